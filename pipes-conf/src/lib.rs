#![deny(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use config::{Config, File, FileFormat};
use once_cell::sync::OnceCell;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use pipes_utils::{deserialize_duration, Bytesize};

pub use self::logging::Log;
pub use self::options::Options;

pub mod logging;
pub mod options;

pub type Result<T> = anyhow::Result<T>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub pipes: Pipes,
    #[serde(default)]
    pub log: Log,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings(Arc::new(Inner::default()))
    }
}

impl From<Inner> for Settings {
    fn from(inner: Inner) -> Self {
        Settings(Arc::new(inner))
    }
}

impl Settings {
    fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/pipes/pipes").required(false))
            .add_source(File::with_name("pipes").required(false));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("pipes").prefix_separator("__").separator("__").try_parsing(true),
        );

        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self::apply(inner, opts))
    }

    /// Builds settings from TOML text, ignoring files and the environment.
    pub fn from_toml(text: &str, opts: Options) -> Result<Self> {
        let inner: Inner =
            Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?.try_deserialize()?;
        Ok(Self::apply(inner, opts))
    }

    fn apply(mut inner: Inner, opts: Options) -> Self {
        //Command line configuration overriding file configuration
        if let Some(laddr) = opts.laddr {
            inner.server.laddr = laddr;
        }
        if let Some(tint_name) = opts.tint_name.as_ref() {
            inner.pipes.tint_name.clone_from(tint_name);
        }
        inner.opts = opts;
        Self(Arc::new(inner))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn logs() {
        let cfg = Self::instance();
        log::debug!("Config info is {:?}", cfg.0);
        log::info!("laddr is {}", cfg.server.laddr);
        log::info!("max_chunk_size is {}", cfg.server.max_chunk_size);
        log::info!("max_frame_size is {:?}", cfg.server.max_frame_size);
        log::info!("tint_name is {}", cfg.pipes.tint_name);
        log::info!("admin_user is {}", cfg.pipes.admin_user);
        log::info!("max_queue is {}", cfg.pipes.max_queue);
        log::info!("timeout is {:?}", cfg.pipes.timeout);
        if cfg.pipes.hmac_key == Pipes::hmac_key_default() {
            log::warn!("pipes.hmac_key is the built-in default, auth cookies can be forged");
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings ...")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    #[serde(default = "Server::laddr_default")]
    pub laddr: SocketAddr,
    //Largest chunk written to a response body.
    #[serde(default = "Server::max_chunk_size_default")]
    pub max_chunk_size: usize,
    //Largest single field accepted in a request body, 0 is unlimited.
    #[serde(default = "Server::max_frame_size_default")]
    pub max_frame_size: Bytesize,
}

impl Default for Server {
    #[inline]
    fn default() -> Self {
        Self {
            laddr: Self::laddr_default(),
            max_chunk_size: Self::max_chunk_size_default(),
            max_frame_size: Self::max_frame_size_default(),
        }
    }
}

impl Server {
    fn laddr_default() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 22222))
    }
    fn max_chunk_size_default() -> usize {
        1024
    }
    fn max_frame_size_default() -> Bytesize {
        Bytesize::from("16M")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pipes {
    #[serde(default = "Pipes::tint_name_default")]
    pub tint_name: String,
    #[serde(default = "Pipes::hmac_key_default")]
    pub hmac_key: String,
    #[serde(default)]
    pub hmac_algo: HmacAlgo,
    #[serde(default = "Pipes::admin_user_default")]
    pub admin_user: String,
    //Pending messages kept per registration before the oldest is dropped.
    #[serde(default = "Pipes::max_queue_default")]
    pub max_queue: usize,
    //How long a two-way call waits for its reply.
    #[serde(default = "Pipes::timeout_default", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "Pipes::cookie_domain_default")]
    pub cookie_domain: String,
}

impl Default for Pipes {
    #[inline]
    fn default() -> Self {
        Self {
            tint_name: Self::tint_name_default(),
            hmac_key: Self::hmac_key_default(),
            hmac_algo: HmacAlgo::default(),
            admin_user: Self::admin_user_default(),
            max_queue: Self::max_queue_default(),
            timeout: Self::timeout_default(),
            debug: false,
            cookie_domain: Self::cookie_domain_default(),
        }
    }
}

impl Pipes {
    fn tint_name_default() -> String {
        "pipes".into()
    }
    fn hmac_key_default() -> String {
        "INSECURE".into()
    }
    fn admin_user_default() -> String {
        "admin".into()
    }
    fn max_queue_default() -> usize {
        1000
    }
    fn timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn cookie_domain_default() -> String {
        "127.0.0.1".into()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HmacAlgo {
    Sha256,
    #[default]
    Sha512,
}

impl HmacAlgo {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            HmacAlgo::Sha256 => "sha256",
            HmacAlgo::Sha512 => "sha512",
        }
    }
}

impl<'de> Deserialize<'de> for HmacAlgo {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let algo = String::deserialize(deserializer)?;
        match algo.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HmacAlgo::Sha256),
            "sha512" => Ok(HmacAlgo::Sha512),
            _ => Err(de::Error::unknown_variant(&algo, &["sha256", "sha512"])),
        }
    }
}
