use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use pipes_conf::HmacAlgo;

use crate::auth::{authenticate_cookie, parse_cookie_header, AuthResult, AUTH_COOKIE_NAME};
use crate::error::PipeError;

pub type ListenerId = u64;

type FinalizeListener = Box<dyn FnOnce(&Context) + Send>;
type ErrorListener = Box<dyn Fn(&PipeError, &Context) + Send + Sync>;

/// The network side of a context, released when the context finalizes.
pub trait Transport: Send + Sync {
    fn close(&self);
}

/// State tied to one inbound request or outbound connection.
///
/// Cloning a `Context` yields another handle to the same connection. Anything that keeps a
/// context past an await point (queue entries, the two-way table, subscriptions) registers an
/// [`Context::on_finalize`] listener and removes itself there.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    tint: Mutex<TintState>,
    auth: RwLock<AuthResult>,
    cookies: HashMap<String, String>,
    stack: Mutex<Vec<String>>,
    finalized: AtomicBool,
    errored: AtomicBool,
    listeners: Mutex<Listeners>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    debug: bool,
    header_len: usize,
}

struct TintState {
    tint: String,
    propagated: bool,
}

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    finalize: Vec<(ListenerId, FinalizeListener)>,
    error: Vec<(ListenerId, ErrorListener)>,
}

impl Listeners {
    #[inline]
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        self.next_id
    }
}

pub struct ContextBuilder {
    tint: String,
    cookies: HashMap<String, String>,
    stack: Vec<String>,
    transport: Option<Box<dyn Transport>>,
    debug: bool,
    header_len: usize,
}

impl ContextBuilder {
    /// Parses the `Cookie` request header into the context's cookie jar.
    pub fn cookie_header(mut self, header: &str) -> Self {
        self.cookies = parse_cookie_header(header);
        self
    }

    pub fn cookies(mut self, cookies: HashMap<String, String>) -> Self {
        self.cookies = cookies;
        self
    }

    /// First entry of the debug stack, usually the peer address.
    pub fn label<L: Into<String>>(mut self, label: L) -> Self {
        self.stack.push(label.into());
        self
    }

    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn header_len(mut self, header_len: usize) -> Self {
        self.header_len = header_len;
        self
    }

    pub fn build(self) -> Context {
        Context {
            inner: Arc::new(ContextInner {
                tint: Mutex::new(TintState { tint: self.tint, propagated: false }),
                auth: RwLock::new(AuthResult::default()),
                cookies: self.cookies,
                stack: Mutex::new(self.stack),
                finalized: AtomicBool::new(false),
                errored: AtomicBool::new(false),
                listeners: Mutex::new(Listeners::default()),
                transport: Mutex::new(self.transport),
                debug: self.debug,
                header_len: self.header_len,
            }),
        }
    }
}

impl Context {
    pub fn builder<T: Into<String>>(tint: T) -> ContextBuilder {
        ContextBuilder {
            tint: tint.into(),
            cookies: HashMap::default(),
            stack: Vec::new(),
            transport: None,
            debug: false,
            header_len: 40,
        }
    }

    #[inline]
    pub fn new<T: Into<String>>(tint: T) -> Self {
        Self::builder(tint).build()
    }

    #[inline]
    pub fn tint(&self) -> String {
        self.inner.tint.lock().tint.clone()
    }

    /// Adopts the tint carried by an inbound message.
    ///
    /// Allowed once, before anything was routed on this context. Returns `false` when
    /// the tint was already propagated or the context is finalized.
    pub fn propagate_tint(&self, tint: &str) -> bool {
        if self.is_finalized() {
            return false;
        }
        let mut state = self.inner.tint.lock();
        if state.propagated {
            log::warn!("{} tint already propagated, ignoring {}", state.tint, tint);
            return false;
        }
        state.tint = tint.to_owned();
        state.propagated = true;
        true
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.inner.cookies
    }

    #[inline]
    pub fn auth(&self) -> AuthResult {
        self.inner.auth.read().clone()
    }

    #[inline]
    pub fn set_auth(&self, auth: AuthResult) {
        *self.inner.auth.write() = auth;
    }

    /// Authenticates the connection with its own `auth` cookie.
    pub fn authenticate(&self, algo: HmacAlgo, key: &str) -> AuthResult {
        if let Some(cookie) = self.inner.cookies.get(AUTH_COOKIE_NAME) {
            self.set_auth(authenticate_cookie(algo, key, cookie));
        }
        self.auth()
    }

    #[inline]
    pub fn is_user(&self, user: &str) -> bool {
        self.inner.auth.read().is_user(user)
    }

    #[inline]
    pub fn push<L: Into<String>>(&self, label: L) {
        self.inner.stack.lock().push(label.into());
    }

    #[inline]
    pub fn pop(&self) -> Option<String> {
        self.inner.stack.lock().pop()
    }

    #[inline]
    pub fn stack(&self) -> Vec<String> {
        self.inner.stack.lock().clone()
    }

    fn header(&self) -> String {
        let header = format!("{{{}}} {}", self.tint(), self.inner.stack.lock().join(" "));
        format!("{:<width$}", header, width = self.inner.header_len)
    }

    pub fn log_out(&self, msg: &str) {
        log::info!("{} {}", self.header(), msg);
    }

    pub fn log_err(&self, msg: &str) {
        log::error!("{} {}", self.header(), msg);
    }

    /// Emitted only on contexts built with `debug(true)`.
    pub fn log_debug(&self, msg: &str) {
        if self.inner.debug {
            log::debug!("{} {}", self.header(), msg);
        }
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::SeqCst)
    }

    /// Registers a one-shot finalize listener. `None` if the context is already finalized.
    pub fn on_finalize<F>(&self, f: F) -> Option<ListenerId>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        if self.is_finalized() {
            return None;
        }
        let id = listeners.next_id();
        listeners.finalize.push((id, Box::new(f)));
        Some(id)
    }

    pub fn off_finalize(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let len = listeners.finalize.len();
        listeners.finalize.retain(|(lid, _)| *lid != id);
        listeners.finalize.len() != len
    }

    pub fn on_error<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&PipeError, &Context) + Send + Sync + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        let id = listeners.next_id();
        listeners.error.push((id, Box::new(f)));
        id
    }

    pub fn off_error(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let len = listeners.error.len();
        listeners.error.retain(|(lid, _)| *lid != id);
        listeners.error.len() != len
    }

    /// Logs `err` and fires the error event. The event fires at most once per context and
    /// never after finalize; it does not finalize the context.
    pub fn error(&self, err: PipeError) {
        self.log_err(&err.to_string());
        if self.is_finalized() {
            return;
        }
        if self.inner.errored.swap(true, Ordering::SeqCst) {
            self.log_debug("error event already fired");
            return;
        }
        let listeners = std::mem::take(&mut self.inner.listeners.lock().error);
        for (_, f) in listeners.iter() {
            f(&err, self);
        }
    }

    /// Detaches the context from everything that referenced it and releases the transport.
    /// Only the first call has any effect.
    pub fn finalize(&self) {
        if self.inner.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let finalize = {
            let mut listeners = self.inner.listeners.lock();
            listeners.error.clear();
            std::mem::take(&mut listeners.finalize)
        };
        self.log_debug(&format!("finalize, {} listeners", finalize.len()));
        for (_, f) in finalize {
            f(self);
        }
        if let Some(transport) = self.inner.transport.lock().take() {
            transport.close();
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context {{ tint: {}, finalized: {} }}", self.tint(), self.is_finalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Closer(Arc<AtomicBool>);

    impl Transport for Closer {
        fn close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_finalize_once() {
        let closed = Arc::new(AtomicBool::new(false));
        let ctx = Context::builder("t-1:1").transport(Box::new(Closer(closed.clone()))).build();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = ctx.on_finalize(move |ctx| {
            assert!(ctx.is_finalized());
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(id.is_some());

        ctx.finalize();
        ctx.finalize();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(closed.load(Ordering::SeqCst));
        assert!(ctx.on_finalize(|_| {}).is_none());
    }

    #[test]
    fn test_off_finalize() {
        let ctx = Context::new("t-1:2");
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = ctx.on_finalize(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(ctx.off_finalize(id.unwrap()));
        assert!(!ctx.off_finalize(id.unwrap()));
        ctx.finalize();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_fires_once_and_not_after_finalize() {
        let ctx = Context::new("t-1:3");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        ctx.on_error(move |err, _| e.lock().push(err.clone()));

        ctx.error(PipeError::Shutdown);
        ctx.error(PipeError::ConnectionTimeout);
        assert_eq!(*errors.lock(), vec![PipeError::Shutdown]);
        assert!(!ctx.is_finalized());

        let ctx = Context::new("t-1:4");
        let e = errors.clone();
        ctx.on_error(move |err, _| e.lock().push(err.clone()));
        ctx.finalize();
        ctx.error(PipeError::Shutdown);
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    fn test_tint_propagation() {
        let ctx = Context::new("pipes-1:5");
        assert!(ctx.propagate_tint("remote-9:1"));
        assert_eq!(ctx.tint(), "remote-9:1");
        assert!(!ctx.propagate_tint("remote-9:2"));
        assert_eq!(ctx.tint(), "remote-9:1");
    }

    #[test]
    fn test_authenticate_from_cookie_header() {
        let cookie = crate::auth::generate_auth_cookie(HmacAlgo::Sha512, "k", "admin", 0, "auth");
        let ctx = Context::builder("t-1:6").cookie_header(&format!("lang=en; {cookie}")).build();
        assert_eq!(ctx.cookies().get("lang").map(String::as_str), Some("en"));
        assert!(!ctx.is_user("admin"));
        assert!(ctx.authenticate(HmacAlgo::Sha512, "k").authenticated);
        assert!(ctx.is_user("admin"));

        let anon = Context::new("t-1:7");
        assert!(!anon.authenticate(HmacAlgo::Sha512, "k").authenticated);
    }

    #[test]
    fn test_stack() {
        let ctx = Context::builder("t-1:8").label("127.0.0.1").header_len(10).build();
        ctx.push("cmd:msg");
        assert_eq!(ctx.stack(), vec!["127.0.0.1".to_string(), "cmd:msg".to_string()]);
        assert_eq!(ctx.pop().as_deref(), Some("cmd:msg"));
        assert_eq!(ctx.header(), "{t-1:8} 127.0.0.1");
    }
}
