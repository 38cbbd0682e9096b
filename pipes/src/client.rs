use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::COOKIE;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use url::Url;

use pipes_codec::{Frame, Multi, MultiCodec};
use pipes_conf::{HmacAlgo, Settings};
use pipes_utils::{timestamp_millis, Counter, TimestampMillis};

use crate::auth::{generate_auth_cookie, AUTH_COOKIE_NAME};
use crate::message::Message;
use crate::Result;

const COOKIE_LIFETIME_MS: i64 = 365 * 24 * 60 * 60 * 1000;

pub type MessageStream = BoxStream<'static, Result<Message>>;

/// HTTP client for a pipes broker.
#[derive(Clone)]
pub struct PipeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    base: Url,
    cookie: String,
    max_chunk_size: usize,
    timeout: Duration,
}

impl PipeClient {
    /// `base` is the broker root, e.g. `http://127.0.0.1:22222`. The auth cookie is valid for a year.
    pub fn new(base: &str, user: &str, algo: HmacAlgo, key: &str) -> Result<Self> {
        Self::build(base, user, algo, key, pipes_codec::DEFAULT_MAX_CHUNK_SIZE, Duration::from_secs(15))
    }

    /// A client for the broker described by `settings`, acting as its admin user.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut laddr = settings.server.laddr;
        if laddr.ip().is_unspecified() {
            laddr.set_ip([127, 0, 0, 1].into());
        }
        //Leave room for the broker's own two-way timeout to answer first.
        let timeout = settings.pipes.timeout + Duration::from_secs(5);
        Self::build(
            &format!("http://{laddr}"),
            &settings.pipes.admin_user,
            settings.pipes.hmac_algo,
            &settings.pipes.hmac_key,
            settings.server.max_chunk_size,
            timeout,
        )
    }

    fn build(
        base: &str,
        user: &str,
        algo: HmacAlgo,
        key: &str,
        max_chunk_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let base = Url::parse(base)?;
        let expiry = timestamp_millis() + COOKIE_LIFETIME_MS;
        let cookie = generate_auth_cookie(algo, key, user, expiry, AUTH_COOKIE_NAME);
        let http = reqwest::Client::builder().connect_timeout(Duration::from_secs(8)).build()?;
        Ok(PipeClient { inner: Arc::new(ClientInner { http, base, cookie, max_chunk_size, timeout }) })
    }

    fn url(&self, cmd: &str) -> Result<Url> {
        Ok(self.inner.base.join(cmd)?)
    }

    fn encode(&self, fields: &[(&str, &str)]) -> Result<Vec<u8>> {
        let multi = Multi::new(self.inner.max_chunk_size);
        let mut body = Vec::new();
        for (typ, value) in fields {
            for chunk in multi.send(typ.to_string(), value.to_string())? {
                body.extend_from_slice(&chunk);
            }
        }
        Ok(body)
    }

    async fn call(&self, cmd: &str, fields: &[(&str, &str)]) -> Result<HashMap<String, String>> {
        let resp = self
            .inner
            .http
            .post(self.url(cmd)?)
            .header(COOKIE, &self.inner.cookie)
            .timeout(self.inner.timeout)
            .body(self.encode(fields)?)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{cmd} failed, status: {status}, {text}"));
        }
        let body = resp.bytes().await?;
        let mut multi = Multi::default();
        let mut out = HashMap::new();
        for frame in multi.feed(&body)? {
            out.insert(frame.typ().to_owned(), frame.body_str()?.to_owned());
        }
        multi.end()?;
        Ok(out)
    }

    fn take(mut fields: HashMap<String, String>, name: &str) -> Result<String> {
        fields.remove(name).ok_or_else(|| anyhow!("missing response field: {name}"))
    }

    /// Routes `msg` and returns the body of the ack or reply.
    pub async fn send(&self, msg: &Message) -> Result<Value> {
        let fields = self.call("msg", &[("msg", &msg.to_json()?)]).await?;
        Ok(serde_json::from_str(&Self::take(fields, "body")?)?)
    }

    pub async fn register(&self, tag: &str, filter: &str, router: &str) -> Result<String> {
        Self::take(self.call("reg", &[("tag", tag), ("filter", filter), ("router", router)]).await?, "id")
    }

    pub async fn unregister(&self, id: &str) -> Result<bool> {
        Ok(Self::take(self.call("unr", &[("id", id)]).await?, "done")? == "true")
    }

    pub async fn grant(&self, tag: &str, filter: &str) -> Result<String> {
        Self::take(self.call("grant", &[("tag", tag), ("filter", filter)]).await?, "id")
    }

    pub async fn revoke(&self, id: &str) -> Result<bool> {
        Ok(Self::take(self.call("revoke", &[("id", id)]).await?, "done")? == "true")
    }

    /// `kind` is `reg` or `auth`.
    pub async fn list(&self, kind: &str, id: Option<&str>) -> Result<Value> {
        let mut fields = vec![("kind", kind)];
        if let Some(id) = id {
            fields.push(("id", id));
        }
        Ok(serde_json::from_str(&Self::take(self.call("list", &fields).await?, "data")?)?)
    }

    /// Mints an auth cookie for `user`, ready for a `Cookie` header. `expiry` is in
    /// milliseconds since the epoch, `0` never expires.
    pub async fn cookie(&self, user: &str, expiry: TimestampMillis) -> Result<String> {
        Self::take(self.call("cookie", &[("user", user), ("expiry", &expiry.to_string())]).await?, "cookie")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.call("shutdown", &[]).await?;
        Ok(())
    }

    pub async fn check(&self) -> Result<bool> {
        Ok(self.call("check", &[]).await?.contains_key("ok"))
    }

    /// Opens one `/sub` stream. Resolves once the broker delivers the first message.
    pub async fn subscribe(&self, id: &str, tag: &str) -> Result<MessageStream> {
        let mut url = self.url("sub")?;
        url.query_pairs_mut().append_pair("id", id).append_pair("tag", tag);
        let resp = self.inner.http.get(url).header(COOKIE, &self.inner.cookie).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("sub failed, status: {status}, {text}"));
        }
        let body = StreamReader::new(resp.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other)));
        let frames = FramedRead::new(body, MultiCodec::default());
        Ok(frames.filter_map(|frame| async move { message_frame(frame) }).boxed())
    }

    /// Keeps a subscription open across disconnects until [`Listener::stop`].
    pub fn listen(&self, id: &str, tag: &str) -> Listener {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ListenState {
            status: RwLock::new(ListenStatus::Connecting),
            retries: Counter::new(),
            delivered: Counter::new(),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        });
        tokio::spawn(listen(self.clone(), id.to_owned(), tag.to_owned(), state.clone(), tx));
        Listener { events: rx, state }
    }
}

//Only `msg` frames carry messages, anything else on a `/sub` stream is skipped.
fn message_frame(frame: std::result::Result<Frame, pipes_codec::FramingError>) -> Option<Result<Message>> {
    match frame {
        Ok(frame) if frame.typ() == "msg" => Some(
            frame
                .body_str()
                .map_err(anyhow::Error::from)
                .and_then(|text| Message::from_json(text).map_err(anyhow::Error::from)),
        ),
        Ok(frame) => {
            log::debug!("skip {} frame", frame.typ());
            None
        }
        Err(e) => Some(Err(e.into())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenStatus {
    Connecting,
    Connected,
    Retry,
    Stop,
}

#[derive(Debug)]
pub enum PipeEvent {
    Connect,
    Disconnect,
    Message(Message),
    Error(String),
    Stop,
}

struct ListenState {
    status: RwLock<ListenStatus>,
    retries: Counter,
    delivered: Counter,
    stopped: AtomicBool,
    stop: Notify,
}

impl ListenState {
    #[inline]
    fn set(&self, status: ListenStatus) {
        *self.status.write() = status;
    }
}

/// Events of a reconnecting subscription.
pub struct Listener {
    events: mpsc::UnboundedReceiver<PipeEvent>,
    state: Arc<ListenState>,
}

impl Listener {
    /// `None` once the listener stopped and every event was taken.
    pub async fn next(&mut self) -> Option<PipeEvent> {
        self.events.recv().await
    }

    #[inline]
    pub fn status(&self) -> ListenStatus {
        *self.state.status.read()
    }

    #[inline]
    pub fn retries(&self) -> u64 {
        self.state.retries.count()
    }

    #[inline]
    pub fn delivered(&self) -> u64 {
        self.state.delivered.count()
    }

    pub fn stop(&self) {
        if !self.state.stopped.swap(true, Ordering::SeqCst) {
            self.state.stop.notify_one();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn listen(
    client: PipeClient,
    id: String,
    tag: String,
    state: Arc<ListenState>,
    tx: mpsc::UnboundedSender<PipeEvent>,
) {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(None)
        .build();

    'outer: while !state.stopped.load(Ordering::SeqCst) {
        state.set(ListenStatus::Connecting);
        let res = tokio::select! {
            _ = state.stop.notified() => break,
            res = client.subscribe(&id, &tag) => res,
        };
        match res {
            Ok(mut stream) => {
                state.set(ListenStatus::Connected);
                backoff.reset();
                if tx.send(PipeEvent::Connect).is_err() {
                    break;
                }
                loop {
                    if state.stopped.load(Ordering::SeqCst) {
                        break 'outer;
                    }
                    let item = tokio::select! {
                        _ = state.stop.notified() => break 'outer,
                        item = stream.next() => item,
                    };
                    let event = match item {
                        Some(Ok(msg)) => {
                            state.delivered.inc();
                            PipeEvent::Message(msg)
                        }
                        Some(Err(e)) => PipeEvent::Error(e.to_string()),
                        None => break,
                    };
                    if tx.send(event).is_err() {
                        break 'outer;
                    }
                }
                if tx.send(PipeEvent::Disconnect).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::debug!("listen {id} failed, {e}");
                if tx.send(PipeEvent::Error(e.to_string())).is_err() {
                    break;
                }
            }
        }

        state.set(ListenStatus::Retry);
        state.retries.inc();
        let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
        tokio::select! {
            _ = state.stop.notified() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    state.set(ListenStatus::Stop);
    let _ = tx.send(PipeEvent::Stop);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_fields() {
        let client = PipeClient::new("http://127.0.0.1:1", "admin", HmacAlgo::Sha512, "k").unwrap();
        let body = client.encode(&[("tag", "echo"), ("filter", "true")]).unwrap();
        assert_eq!(body, b"OK:tag:4:echoOK:filter:4:true".to_vec());
        assert_eq!(client.url("msg").unwrap().as_str(), "http://127.0.0.1:1/msg");
        assert!(client.inner.cookie.starts_with("auth=admin-"));
    }

    #[tokio::test]
    async fn test_sub_stream_frames() {
        let multi = Multi::new(7);
        let mut chunks = multi.send("msg", Message::oneway().subject("A").to_json().unwrap()).unwrap();
        chunks.extend(multi.send("note", "x").unwrap());
        chunks.extend(multi.send("msg", Message::oneway().subject("B").to_json().unwrap()).unwrap());
        chunks.push(bytes::Bytes::from_static(b"OK:msg:9:{"));
        let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));

        let frames = FramedRead::new(StreamReader::new(body), MultiCodec::default());
        let got = frames.filter_map(|frame| async move { message_frame(frame) }).take(3).collect::<Vec<_>>().await;
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].as_ref().unwrap().subj, "A");
        assert_eq!(got[1].as_ref().unwrap().subj, "B");
        assert!(got[2].is_err());
    }

    #[tokio::test]
    async fn test_listen_retries_and_stops() {
        //Nothing listens on port 1.
        let client = PipeClient::new("http://127.0.0.1:1", "admin", HmacAlgo::Sha512, "k").unwrap();
        let mut listener = client.listen("reg", "t");
        match listener.next().await {
            Some(PipeEvent::Error(_)) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        listener.stop();
        loop {
            match listener.next().await {
                Some(PipeEvent::Stop) | None => break,
                Some(_) => {}
            }
        }
        assert_eq!(listener.status(), ListenStatus::Stop);
        assert!(listener.retries() >= 1);
        assert_eq!(listener.delivered(), 0);
    }
}
