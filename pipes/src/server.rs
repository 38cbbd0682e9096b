//! HTTP glue: one warp filter turns every request into a connection [`Context`], decodes the
//! framed body and dispatches on the first path segment.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use warp::http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use warp::http::{Method, StatusCode};
use warp::hyper::Body;
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter as _, Reply as _};

use pipes_codec::{FramingError, Multi};
use pipes_conf::Settings;
use pipes_utils::{TimestampMillis, TintGenerator};

use crate::access::Access;
use crate::auth::{generate_auth_cookie, generate_auth_set_cookie, AUTH_COOKIE_NAME};
use crate::context::{Context, Transport};
use crate::error::PipeError;
use crate::expr::{Expr, RouterExpr};
use crate::message::Message;
use crate::router::{ReplyFn, Router};
use crate::subscription::ForwardFn;
use crate::Result;

const ADMIN_COMMANDS: &[&str] = &["sub", "reg", "unr", "grant", "revoke", "list", "cookie", "shutdown"];

#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub router: Router,
    pub access: Access,
    pub tints: TintGenerator,
    shutdown: Notify,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    pub fn new(settings: Settings) -> Self {
        let router = Router::new(settings.pipes.max_queue);
        let tints = TintGenerator::new(settings.pipes.tint_name.clone());
        ServerContext {
            inner: Arc::new(ServerContextInner {
                settings,
                router,
                access: Access::new(),
                tints,
                shutdown: Notify::new(),
            }),
        }
    }

    /// A fresh context for one inbound request, authenticated with its own cookies.
    ///
    /// `hangup` is cancelled when the context finalizes.
    pub fn context(&self, peer: Option<SocketAddr>, cookie: Option<&str>, hangup: CancellationToken) -> Context {
        let peer = peer.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let mut builder = Context::builder(self.tints.next_tint())
            .label(peer)
            .transport(Box::new(hangup))
            .debug(self.settings.pipes.debug)
            .header_len(self.settings.log.header_len);
        if let Some(cookie) = cookie {
            builder = builder.cookie_header(cookie);
        }
        let ctx = builder.build();
        let auth = ctx.authenticate(self.settings.pipes.hmac_algo, &self.settings.pipes.hmac_key);
        if let Some(user) = auth.user() {
            ctx.push(format!("user:{user}"));
        }
        ctx
    }

    /// Shuts the router down and stops accepting connections.
    pub fn shutdown(&self, ctx: &Context) {
        self.router.shutdown(ctx);
        self.shutdown.notify_one();
    }

    #[inline]
    fn is_admin(&self, ctx: &Context) -> bool {
        ctx.is_user(&self.settings.pipes.admin_user)
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerContext ...")?;
        Ok(())
    }
}

impl Transport for CancellationToken {
    #[inline]
    fn close(&self) {
        self.cancel();
    }
}

/// Binds `laddr`. The returned future serves until [`ServerContext::shutdown`].
pub fn bind(scx: ServerContext, laddr: SocketAddr) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let signal = scx.clone();
    let routes = warp::any()
        .map(move || scx.clone())
        .and(warp::method())
        .and(warp::path::full())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("cookie"))
        .and(warp::addr::remote())
        .and(warp::body::stream())
        .then(handle);

    let (addr, server) = warp::serve(routes).try_bind_with_graceful_shutdown(laddr, async move {
        signal.shutdown.notified().await;
        log::info!("graceful shutdown");
    })?;
    log::info!("pipes listening on {addr}");
    Ok((addr, server))
}

pub async fn serve(scx: ServerContext) -> Result<()> {
    let laddr = scx.settings.server.laddr;
    let (_, server) = bind(scx, laddr)?;
    server.await;
    Ok(())
}

async fn handle<S, B>(
    scx: ServerContext,
    method: Method,
    path: FullPath,
    query: HashMap<String, String>,
    cookie: Option<String>,
    peer: Option<SocketAddr>,
    body: S,
) -> Response
where
    S: Stream<Item = std::result::Result<B, warp::Error>> + Send,
    B: Buf,
{
    let path = path.as_str().to_owned();
    let cmd = path.trim_matches('/').to_owned();
    let hangup = CancellationToken::new();
    let ctx = scx.context(peer, cookie.as_deref(), hangup.clone());
    ctx.push(format!("cmd:{cmd}"));
    ctx.log_debug(&format!("{method} {path}"));

    if cmd == "sub" {
        return subscribe(&scx, ctx, hangup, &path, &query).await;
    }

    //Also runs when hyper drops this future because the peer went away.
    let _finalize = scopeguard::guard(ctx.clone(), |ctx| ctx.finalize());

    let res = match read_fields(&scx, body).await {
        Ok(fields) => dispatch(&scx, &ctx, &cmd, &fields).await,
        Err(e) => Err(e),
    };
    let resp = match res {
        Ok(reply) => reply.into_response(&scx),
        Err(e) => error_response(&ctx, &e, &path),
    };
    resp
}

async fn read_fields<S, B>(scx: &ServerContext, body: S) -> std::result::Result<HashMap<String, String>, PipeError>
where
    S: Stream<Item = std::result::Result<B, warp::Error>>,
    B: Buf,
{
    let mut multi = Multi::new(scx.settings.server.max_chunk_size)
        .max_frame_size(scx.settings.server.max_frame_size.as_usize());
    let mut fields = HashMap::new();
    futures::pin_mut!(body);
    while let Some(chunk) = body.next().await {
        let mut chunk = chunk.map_err(|e| PipeError::Framing(e.to_string()))?;
        while chunk.has_remaining() {
            let n = chunk.chunk().len();
            for frame in multi.feed(chunk.chunk())? {
                fields.insert(frame.typ().to_owned(), frame.body_str()?.to_owned());
            }
            chunk.advance(n);
        }
    }
    match multi.end() {
        Ok(()) | Err(FramingError::NothingReceived) => Ok(fields),
        Err(e) => Err(e.into()),
    }
}

#[inline]
fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> std::result::Result<&'a str, PipeError> {
    fields.get(name).map(String::as_str).ok_or_else(|| PipeError::BadRequest(format!("missing field: {name}")))
}

//An optional `tint` field lets a client re-register or re-grant under a known id.
fn adopt_tint(ctx: &Context, fields: &HashMap<String, String>) {
    if let Some(tint) = fields.get("tint").filter(|t| !t.is_empty()) {
        ctx.propagate_tint(tint);
    }
}

async fn dispatch(
    scx: &ServerContext,
    ctx: &Context,
    cmd: &str,
    fields: &HashMap<String, String>,
) -> std::result::Result<Reply, PipeError> {
    if ADMIN_COMMANDS.contains(&cmd) && !scx.is_admin(ctx) {
        return Err(PipeError::NotFound);
    }
    match cmd {
        "msg" => message(scx, ctx, fields).await,
        "reg" => {
            adopt_tint(ctx, fields);
            let tag = fields.get("tag").map(String::as_str).unwrap_or_default();
            let filter = Expr::parse(field(fields, "filter")?)?;
            let router = RouterExpr::parse(fields.get("router").map(String::as_str).unwrap_or("{}"))?;
            let id = scx.router.register(ctx, tag, Box::new(filter), Box::new(router))?;
            Ok(Reply::field("id", id))
        }
        "unr" => {
            let done = scx.router.unregister(ctx, field(fields, "id")?);
            Ok(Reply::field("done", done.to_string()))
        }
        "grant" => {
            adopt_tint(ctx, fields);
            let tag = fields.get("tag").map(String::as_str).unwrap_or_default();
            let filter = Expr::parse(field(fields, "filter")?)?;
            Ok(Reply::field("id", scx.access.grant(ctx, tag, filter)))
        }
        "revoke" => {
            let done = scx.access.revoke(ctx, field(fields, "id")?);
            Ok(Reply::field("done", done.to_string()))
        }
        "list" => {
            let id = fields.get("id").map(String::as_str).filter(|id| !id.is_empty());
            let data = match fields.get("kind").map(String::as_str).unwrap_or("reg") {
                "reg" => scx.router.list(id),
                "auth" => scx.access.list(id),
                kind => return Err(PipeError::BadRequest(format!("unknown list kind: {kind}"))),
            };
            Ok(Reply::field("data", data.to_string()))
        }
        "cookie" => {
            let user = field(fields, "user")?;
            let expiry = match fields.get("expiry").filter(|e| !e.is_empty()) {
                Some(e) => e.parse::<TimestampMillis>().map_err(|_| PipeError::BadRequest(format!("bad expiry: {e}")))?,
                None => 0,
            };
            let conf = &scx.settings.pipes;
            let cookie = generate_auth_cookie(conf.hmac_algo, &conf.hmac_key, user, expiry, AUTH_COOKIE_NAME);
            let set_cookie = generate_auth_set_cookie(
                conf.hmac_algo,
                &conf.hmac_key,
                user,
                expiry,
                AUTH_COOKIE_NAME,
                "/",
                &conf.cookie_domain,
            );
            let mut reply = Reply::field("cookie", cookie);
            reply.headers.insert("set-cookie".into(), set_cookie);
            Ok(reply)
        }
        "shutdown" => {
            scx.shutdown(ctx);
            Ok(Reply::field("done", "true"))
        }
        "check" => Ok(Reply::field("ok", "ok")),
        _ => Err(PipeError::NotFound),
    }
}

async fn message(
    scx: &ServerContext,
    ctx: &Context,
    fields: &HashMap<String, String>,
) -> std::result::Result<Reply, PipeError> {
    let mut msg = Message::from_json(field(fields, "msg")?)?;
    if let Some(tint) = msg.tint.clone() {
        ctx.propagate_tint(&tint);
    } else {
        msg.set_tint(&ctx.tint());
    }
    msg.set_cookies(ctx.cookies());

    if !scx.access.is_granted(&ctx.auth(), &msg) {
        return Err(PipeError::Forbidden);
    }

    let (tx, rx) = oneshot::channel::<std::result::Result<Arc<Message>, PipeError>>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let on_error = tx.clone();
    ctx.on_error(move |e, _| {
        if let Some(tx) = on_error.lock().take() {
            let _ = tx.send(Err(e.clone()));
        }
    });
    let reply: ReplyFn = Box::new(move |m| match tx.lock().take() {
        Some(tx) => tx.send(Ok(m)).map_err(|_| PipeError::Delivery("caller gone".into())),
        None => Err(PipeError::Delivery("caller already answered".into())),
    });

    ctx.log_out(&format!("{msg}"));
    scx.router.route(ctx, msg, reply);

    let answer = match tokio::time::timeout(scx.settings.pipes.timeout, rx).await {
        Ok(Ok(answer)) => answer?,
        Ok(Err(_)) => return Err(PipeError::Delivery("reply dropped".into())),
        Err(_) => {
            ctx.error(PipeError::ConnectionTimeout);
            return Err(PipeError::ConnectionTimeout);
        }
    };
    Ok(Reply { fields: vec![("body", serde_json::to_string(&answer.body)?)], headers: answer.headers.clone() })
}

/// Streams `msg` frames for one subscription. The status line waits for the first frame so that
/// an early failure is still answered with an error status.
async fn subscribe(
    scx: &ServerContext,
    ctx: Context,
    hangup: CancellationToken,
    path: &str,
    query: &HashMap<String, String>,
) -> Response {
    let guard = scopeguard::guard(ctx.clone(), |ctx| ctx.finalize());
    if !scx.is_admin(&ctx) {
        return error_response(&ctx, &PipeError::NotFound, path);
    }
    let id = match query.get("id").filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => return error_response(&ctx, &PipeError::BadRequest("missing query: id".into()), path),
    };
    let tag = query.get("tag").map(String::as_str).unwrap_or_default();

    let (tx, mut rx) = mpsc::channel::<std::result::Result<Bytes, PipeError>>(scx.settings.pipes.max_queue.max(1));
    let on_error = tx.clone();
    ctx.on_error(move |e, ctx| {
        if on_error.try_send(Err(e.clone())).is_err() {
            ctx.finalize();
        }
    });
    let multi = Multi::new(scx.settings.server.max_chunk_size);
    let forward: ForwardFn = Box::new(move |msg| {
        for chunk in multi.send("msg", msg.to_json()?)? {
            tx.try_send(Ok(chunk)).map_err(|e| PipeError::Delivery(format!("subscriber backlog, {e}")))?;
        }
        Ok(())
    });
    scx.router.subscribe(&ctx, id, tag, forward);

    let first = match rx.recv().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => return error_response(&ctx, &e, path),
        None => return error_response(&ctx, &PipeError::Shutdown, path),
    };

    let rest = futures::stream::unfold((rx, guard, hangup), |(mut rx, guard, hangup)| async move {
        let next = tokio::select! {
            biased;
            next = rx.recv() => next,
            _ = hangup.cancelled() => None,
        };
        match next {
            Some(Ok(chunk)) => Some((Ok::<_, Infallible>(chunk), (rx, guard, hangup))),
            Some(Err(e)) => {
                guard.log_out(&format!("subscription closed, {e}"));
                None
            }
            None => None,
        }
    });
    let body = futures::stream::once(async move { Ok::<_, Infallible>(first) }).chain(rest);
    let mut resp = Response::new(Body::wrap_stream(body));
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    resp
}

fn error_response(ctx: &Context, err: &PipeError, path: &str) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let text = format!("{} {{{}}} [{}]: {}", status.as_u16(), ctx.tint(), err, path);
    ctx.log_err(&text);
    warp::reply::with_status(text, status).into_response()
}

/// Named fields and headers of a successful answer.
#[derive(Default)]
struct Reply {
    fields: Vec<(&'static str, String)>,
    headers: HashMap<String, String>,
}

impl Reply {
    #[inline]
    fn field<V: Into<String>>(typ: &'static str, value: V) -> Self {
        Reply { fields: vec![(typ, value.into())], ..Default::default() }
    }

    fn into_response(self, scx: &ServerContext) -> Response {
        let multi = Multi::new(scx.settings.server.max_chunk_size);
        let mut chunks = Vec::new();
        for (typ, body) in self.fields {
            match multi.send(typ, body) {
                Ok(c) => chunks.extend(c),
                Err(e) => log::error!("encode field {typ}, {e}"),
            }
        }
        let mut resp = Response::new(Body::wrap_stream(futures::stream::iter(chunks.into_iter().map(Ok::<_, Infallible>))));
        let headers = resp.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        for (k, v) in self.headers {
            match (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
                (Ok(k), Ok(v)) => {
                    headers.insert(k, v);
                }
                _ => log::debug!("skip reply header {k}"),
            }
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipes_conf::Options;

    fn scx() -> ServerContext {
        let settings = Settings::from_toml("[pipes]\nhmac_key = \"k\"\ntint_name = \"unit\"", Options::default()).unwrap();
        ServerContext::new(settings)
    }

    #[test]
    fn test_context_authentication() {
        let scx = scx();
        let cookie = crate::auth::generate_auth_cookie(pipes_conf::HmacAlgo::Sha512, "k", "admin", 0, "auth");
        let ctx = scx.context(None, Some(&cookie), CancellationToken::new());
        assert!(ctx.tint().starts_with("unit-"));
        assert!(scx.is_admin(&ctx));
        assert_eq!(ctx.stack().last().map(String::as_str), Some("user:admin"));

        let anon = scx.context(None, None, CancellationToken::new());
        assert!(!scx.is_admin(&anon));
        assert_ne!(anon.tint(), ctx.tint());
    }

    #[tokio::test]
    async fn test_dispatch_admin_only() {
        let scx = scx();
        let ctx = scx.context(None, None, CancellationToken::new());
        let fields = HashMap::from([("filter".to_string(), "true".to_string())]);
        assert_eq!(dispatch(&scx, &ctx, "reg", &fields).await.err(), Some(PipeError::NotFound));
        assert_eq!(dispatch(&scx, &ctx, "nope", &fields).await.err(), Some(PipeError::NotFound));
        assert!(dispatch(&scx, &ctx, "check", &fields).await.is_ok());
    }

    #[tokio::test]
    async fn test_message_forbidden_without_grant() {
        let scx = scx();
        let ctx = scx.context(None, None, CancellationToken::new());
        let fields = HashMap::from([("msg".to_string(), r#"{"type":"oneway"}"#.to_string())]);
        assert_eq!(message(&scx, &ctx, &fields).await.err(), Some(PipeError::Forbidden));

        scx.access.grant(&Context::new("g-1:1"), "any", Expr::always());
        let ctx = scx.context(None, None, CancellationToken::new());
        //Only the "all" built-in exists, without subscribers.
        assert_eq!(
            message(&scx, &ctx, &fields).await.err(),
            Some(PipeError::NoMatchingRegistration(crate::message::MessageType::OneWay))
        );
    }

    #[tokio::test]
    async fn test_read_fields() {
        let scx = scx();
        let multi = Multi::new(3);
        let mut chunks = multi.send("tag", "echo").unwrap();
        chunks.extend(multi.send("filter", "true").unwrap());
        let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, warp::Error>));
        let fields = read_fields(&scx, body).await.unwrap();
        assert_eq!(fields.get("tag").map(String::as_str), Some("echo"));
        assert_eq!(fields.get("filter").map(String::as_str), Some("true"));

        let empty = futures::stream::iter(Vec::<std::result::Result<Bytes, warp::Error>>::new());
        assert!(read_fields(&scx, empty).await.unwrap().is_empty());

        let bad = futures::stream::iter(vec![Ok::<_, warp::Error>(Bytes::from_static(b"OK:x:9:ab"))]);
        assert!(matches!(read_fields(&scx, bad).await, Err(PipeError::Framing(_))));
    }

    #[tokio::test]
    async fn test_issue_cookie() {
        let scx = scx();
        let admin = crate::auth::generate_auth_cookie(pipes_conf::HmacAlgo::Sha512, "k", "admin", 0, "auth");
        let ctx = scx.context(None, Some(&admin), CancellationToken::new());
        let fields = HashMap::from([("user".to_string(), "bob".to_string())]);
        let reply = dispatch(&scx, &ctx, "cookie", &fields).await.unwrap();

        let (typ, cookie) = &reply.fields[0];
        assert_eq!(*typ, "cookie");
        let value = cookie.strip_prefix("auth=").unwrap();
        assert!(crate::auth::authenticate_cookie(pipes_conf::HmacAlgo::Sha512, "k", value).is_user("bob"));
        let set_cookie = reply.headers.get("set-cookie").unwrap();
        assert!(set_cookie.starts_with(cookie.as_str()));
        assert!(set_cookie.ends_with("; Path=/; Domain=127.0.0.1"));

        let fields = HashMap::from([("user".to_string(), "bob".to_string()), ("expiry".to_string(), "soon".to_string())]);
        assert!(matches!(dispatch(&scx, &ctx, "cookie", &fields).await, Err(PipeError::BadRequest(_))));

        let anon = scx.context(None, None, CancellationToken::new());
        assert_eq!(dispatch(&scx, &anon, "cookie", &fields).await.err(), Some(PipeError::NotFound));
    }

    #[test]
    fn test_finalize_cancels_hangup() {
        let scx = scx();
        let hangup = CancellationToken::new();
        let ctx = scx.context(None, None, hangup.clone());
        assert!(!hangup.is_cancelled());
        ctx.finalize();
        assert!(hangup.is_cancelled());
    }

    #[test]
    fn test_error_text() {
        let ctx = Context::new("pipes-1:3");
        let resp = error_response(&ctx, &PipeError::NotFound, "/reg");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
