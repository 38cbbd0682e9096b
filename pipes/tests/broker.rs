use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use pipes::auth::{authenticate_cookie, generate_auth_cookie, AUTH_COOKIE_NAME};
use pipes::codec::Multi;
use pipes::conf::{HmacAlgo, Options, Settings};
use pipes::server::{self, ServerContext};
use pipes::{Message, PipeClient, PipeEvent};

const KEY: &str = "e2e-secret";

async fn start() -> (ServerContext, String) {
    let _ = simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Warn).init();
    let text = format!(
        "[server]\nladdr = \"127.0.0.1:0\"\n[pipes]\nhmac_key = \"{KEY}\"\ntimeout = \"2s\"\n[log]\nto = \"off\"\n"
    );
    let settings = Settings::from_toml(&text, Options::default()).unwrap();
    let scx = ServerContext::new(settings);
    let (addr, server) = server::bind(scx.clone(), scx.settings.server.laddr).unwrap();
    tokio::spawn(server);
    (scx, format!("http://{addr}"))
}

fn admin(base: &str) -> PipeClient {
    PipeClient::new(base, "admin", HmacAlgo::Sha512, KEY).unwrap()
}

async fn wait_subscribed(client: &PipeClient, id: &str) {
    for _ in 0..100 {
        let data = client.list("reg", Some(id)).await.unwrap();
        if data[id]["subs"].as_array().is_some_and(|subs| !subs.is_empty()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no subscription on {id}");
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..50 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 1s");
}

#[tokio::test]
async fn test_oneway_echo() {
    let (_scx, base) = start().await;
    let admin = admin(&base);
    assert!(admin.check().await.unwrap());
    admin.grant("everyone", "true").await.unwrap();
    let id = admin.register("echo", "true", r#"{"ready":"always"}"#).await.unwrap();

    let sub = {
        let (admin, id) = (admin.clone(), id.clone());
        tokio::spawn(async move {
            let mut stream = admin.subscribe(&id, "e2e").await.unwrap();
            stream.next().await
        })
    };
    wait_subscribed(&admin, &id).await;

    let ack = admin.send(&Message::oneway().subject("TEST").body(42)).await.unwrap();
    assert_eq!(ack, json!("ACK"));

    let got = sub.await.unwrap().unwrap().unwrap();
    assert_eq!(got.subj, "TEST");
    assert_eq!(got.body, json!(42));
}

#[tokio::test]
async fn test_twoway_reply() {
    let (_scx, base) = start().await;
    let admin = admin(&base);
    admin.grant("everyone", "true").await.unwrap();
    let id = admin.register("svc", r#"{"eq":["subj","PING"]}"#, "{}").await.unwrap();

    let worker = {
        let (admin, id) = (admin.clone(), id.clone());
        tokio::spawn(async move {
            let mut stream = admin.subscribe(&id, "worker").await.unwrap();
            let req = stream.next().await.unwrap().unwrap();
            admin.send(&Message::reply(&req).body(json!({"pong": req.body}))).await.unwrap()
        })
    };

    //Queued until the worker attaches.
    let answer = admin.send(&Message::twoway().subject("PING").body(7)).await.unwrap();
    assert_eq!(answer, json!({"pong": 7}));
    assert_eq!(worker.await.unwrap(), json!("ACK"));
}

#[tokio::test]
async fn test_rejections() {
    let (_scx, base) = start().await;
    let admin = admin(&base);

    //No grant installed.
    let err = admin.send(&Message::oneway()).await.unwrap_err();
    assert!(err.to_string().contains("403"), "{err}");

    admin.grant("everyone", "true").await.unwrap();
    let err = admin.send(&Message::twoway()).await.unwrap_err();
    assert!(err.to_string().contains("no matching registration"), "{err}");

    admin.register("slow", "true", "{}").await.unwrap();
    let err = admin.send(&Message::twoway()).await.unwrap_err();
    assert!(err.to_string().contains("504"), "{err}");

    let stranger = PipeClient::new(&base, "admin", HmacAlgo::Sha512, "wrong-key").unwrap();
    let err = stranger.register("x", "true", "{}").await.unwrap_err();
    assert!(err.to_string().contains("404"), "{err}");

    let err = admin.register("bad", r#"{"xor":[]}"#, "{}").await.unwrap_err();
    assert!(err.to_string().contains("400"), "{err}");
}

#[tokio::test]
async fn test_unregister_ends_listener() {
    let (_scx, base) = start().await;
    let admin = admin(&base);
    admin.grant("everyone", "true").await.unwrap();
    let id = admin.register("feed", "true", "{}").await.unwrap();

    let mut listener = admin.listen(&id, "watcher");
    wait_subscribed(&admin, &id).await;
    admin.send(&Message::oneway().body("one")).await.unwrap();

    assert!(matches!(listener.next().await, Some(PipeEvent::Connect)));
    match listener.next().await {
        Some(PipeEvent::Message(m)) => assert_eq!(m.body, json!("one")),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(listener.delivered(), 1);

    assert!(admin.unregister(&id).await.unwrap());
    assert!(matches!(listener.next().await, Some(PipeEvent::Disconnect)));
    listener.stop();
    assert_eq!(admin.list("reg", Some(&id)).await.unwrap(), json!({}));
}

#[tokio::test]
async fn test_shutdown() {
    let (scx, base) = start().await;
    let admin = admin(&base);
    admin.shutdown().await.unwrap();
    assert_eq!(scx.router.list(None), json!({}));
}

#[tokio::test]
async fn test_peer_disconnect_drops_pending_twoway() {
    let (scx, base) = start().await;
    let admin = admin(&base);
    admin.grant("everyone", "true").await.unwrap();
    let id = admin.register("slow", r#"{"eq":["subj","SLOW"]}"#, "{}").await.unwrap();
    let reg = scx.router.registration(&id).unwrap();

    let msg = Message::twoway().subject("SLOW").to_json().unwrap();
    let body = Multi::default().send("msg", msg).unwrap().concat();
    let cookie = generate_auth_cookie(HmacAlgo::Sha512, KEY, "admin", 0, AUTH_COOKIE_NAME);
    let addr = base.trim_start_matches("http://").to_owned();
    let mut sock = TcpStream::connect(&addr).await.unwrap();
    let head = format!(
        "POST /msg HTTP/1.1\r\nHost: {addr}\r\nCookie: {cookie}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    sock.write_all(head.as_bytes()).await.unwrap();
    sock.write_all(&body).await.unwrap();

    //No subscriber: the call waits in the two-way table and in the registration queue.
    wait_until(|| scx.router.twoway_count() == 1 && reg.len() == 1).await;

    drop(sock);
    //Cleared by the hangup, not by the 2s two-way timeout.
    wait_until(|| scx.router.twoway_count() == 0 && reg.is_empty()).await;
}

#[tokio::test]
async fn test_issued_cookie_gates_messages() {
    let (_scx, base) = start().await;
    let admin = admin(&base);
    admin.grant("bob only", r#"{"eq":["user","bob"]}"#).await.unwrap();

    let cookie = admin.cookie("bob", 0).await.unwrap();
    let value = cookie.strip_prefix("auth=").unwrap();
    assert!(authenticate_cookie(HmacAlgo::Sha512, KEY, value).is_user("bob"));

    //Bob passes the grant and only misses a registration; a stranger is refused.
    let bob = PipeClient::new(&base, "bob", HmacAlgo::Sha512, KEY).unwrap();
    let err = bob.send(&Message::oneway().subject("HI")).await.unwrap_err();
    assert!(err.to_string().contains("no matching registration"), "{err}");
    let eve = PipeClient::new(&base, "eve", HmacAlgo::Sha512, KEY).unwrap();
    let err = eve.send(&Message::oneway().subject("HI")).await.unwrap_err();
    assert!(err.to_string().contains("403"), "{err}");
}
