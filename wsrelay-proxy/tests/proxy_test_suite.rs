use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use futures::SinkExt as _;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use wsrelay_agent::{ResponseSender, SessionHandler};
use wsrelay_proxy::ProxyBuilder;
use wsrelay_proxy::auth::TokenValidator;
use wsrelay_types::{CONTAINER_PROXY_PATH, Frame, FrameType, HttpMessage};

use crate::setup::{
    EchoHandler, OnceHandler, TEST_SECRET, TEST_TIMEOUT, TaggedTicker, TestProxy, TickerHandler,
    connect_client, handlers, raw_backend, read_text, send_text, start_agent, test_config,
    try_connect_client,
};


#[tokio::test]
async fn echo_round_trip() {
    let proxy = TestProxy::start().await;
    let _agent = start_agent(&proxy, "1", handlers(vec![("/v1/echo", Arc::new(EchoHandler))])).await;

    let mut client = connect_client(&proxy, "/v1/echo", "1").await;
    for message in ["hello", "again"] {
        send_text(&mut client, message).await;
        assert_eq!(
            read_text(&mut client).await.as_deref(),
            Some(format!("{message}-response").as_str())
        );
    }
}

#[tokio::test]
async fn backend_initiated_close_surfaces_eof() {
    let proxy = TestProxy::start().await;
    let _agent = start_agent(&proxy, "1", handlers(vec![("/v1/once", Arc::new(OnceHandler))])).await;

    let mut client = connect_client(&proxy, "/v1/once", "1").await;
    send_text(&mut client, "ping").await;
    assert_eq!(read_text(&mut client).await.as_deref(), Some("ping-response"));
    assert_eq!(read_text(&mut client).await, None);
}

#[tokio::test]
async fn vanished_backend_surfaces_eof_and_rejects_new_clients() {
    let proxy = TestProxy::start().await;
    let agent = start_agent(&proxy, "1", handlers(vec![("/v1/echo", Arc::new(EchoHandler))])).await;

    let mut client = connect_client(&proxy, "/v1/echo", "1").await;
    send_text(&mut client, "warmup").await;
    assert_eq!(read_text(&mut client).await.as_deref(), Some("warmup-response"));

    drop(agent);
    let eof = tokio::time::timeout(Duration::from_secs(1), read_text(&mut client)).await;
    assert_eq!(eof.expect("client sees EOF within one second"), None);

    match try_connect_client(&proxy, "/v1/echo", "1").await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected a 401 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn orphan_replies_draw_a_close() {
    let proxy = TestProxy::start().await;
    let mut backend = raw_backend(&proxy, "1").await;

    let mut client = connect_client(&proxy, "/v1/data", "1").await;

    // the proxy announces the session before any client payload
    let connect = Frame::decode(&read_frame(&mut backend).await).unwrap();
    assert_eq!(connect.frame_type, FrameType::Connect);
    assert!(connect.body.starts_with("/v1/data"));
    let key = connect.key;

    backend
        .send(Message::text(Frame::body(key.clone(), "one").encode()))
        .await
        .unwrap();
    assert_eq!(read_text(&mut client).await.as_deref(), Some("one"));

    // client disconnects without a handshake; the proxy notifies the backend
    drop(client);
    let close = Frame::decode(&read_frame(&mut backend).await).unwrap();
    assert_eq!(close.frame_type, FrameType::Close);
    assert_eq!(close.key, key);

    // further replies for the dead session are answered with Close
    backend
        .send(Message::text(Frame::body(key.clone(), "two").encode()))
        .await
        .unwrap();
    let close = Frame::decode(&read_frame(&mut backend).await).unwrap();
    assert_eq!(close.frame_type, FrameType::Close);
    assert_eq!(close.key, key);
}

#[tokio::test]
async fn concurrent_sessions_do_not_cross_talk() {
    let proxy = TestProxy::start().await;
    let _agent =
        start_agent(&proxy, "1", handlers(vec![("/v1/logs", Arc::new(TickerHandler))])).await;

    let clients = (0..20).map(|index| {
        let proxy = &proxy;
        async move {
            let prefix = format!("client-{index}");
            let mut client = connect_client(proxy, "/v1/logs", "1").await;
            send_text(&mut client, &prefix).await;
            for _ in 0..10 {
                let message = read_text(&mut client).await.expect("ticker keeps emitting");
                assert!(
                    message.starts_with(&prefix),
                    "session leaked a foreign message: {message}"
                );
            }
        }
    });
    tokio::time::timeout(TEST_TIMEOUT, futures::future::join_all(clients))
        .await
        .expect("all sessions stay isolated");
}

#[tokio::test]
async fn fanout_merges_replies_from_every_backend() {
    let mut config = test_config();
    config.stats_paths = vec!["/v1/monitoring/project".to_owned()];
    let proxy = TestProxy::start_with(config).await;

    let _first = start_agent(
        &proxy,
        "1",
        handlers(vec![("/v1/stats", Arc::new(TaggedTicker("1".to_owned())))]),
    )
    .await;
    let _second = start_agent(
        &proxy,
        "2",
        handlers(vec![("/v1/stats", Arc::new(TaggedTicker("2".to_owned())))]),
    )
    .await;

    let token = wsrelay_test_utils::fanout_token(
        TEST_SECRET,
        &[
            (
                "/v1/stats".to_owned(),
                wsrelay_test_utils::frontend_token(TEST_SECRET, "1"),
            ),
            (
                "/v1/stats".to_owned(),
                wsrelay_test_utils::frontend_token(TEST_SECRET, "2"),
            ),
        ],
    );
    let url = proxy.ws_url(&format!("/v1/monitoring/project?token={token}"));
    let (mut client, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("fan-out client connects");

    for _ in 0..100 {
        client.send(Message::text("poke")).await.expect("can poke");
    }

    tokio::time::timeout(TEST_TIMEOUT, async {
        let (mut from_first, mut from_second) = (false, false);
        while !(from_first && from_second) {
            match read_text(&mut client).await.expect("stream keeps going") {
                message if message == "from-1" => from_first = true,
                message if message == "from-2" => from_second = true,
                message => panic!("unexpected message: {message}"),
            }
        }
    })
    .await
    .expect("replies from both backends arrive");
}

#[tokio::test]
async fn http_adapter_round_trips_a_request() {
    let mut config = test_config();
    config.http_paths = vec!["/r/{*path}".to_owned()];
    let proxy = TestProxy::start_with(config).await;
    let _agent = start_agent(
        &proxy,
        "1",
        handlers(vec![(CONTAINER_PROXY_PATH, Arc::new(HttpEchoHandler))]),
    )
    .await;

    let token = wsrelay_test_utils::http_token(TEST_SECRET, "1", "10.1.2.3:8080", "");
    let response = reqwest::Client::new()
        .post(proxy.http_url(&format!("/r/api/items?token={token}")))
        .body("hello world")
        .send()
        .await
        .expect("request reaches the proxy");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-echo-method")
            .and_then(|value| value.to_str().ok()),
        Some("POST")
    );
    let echoed_url = response
        .headers()
        .get("x-echo-url")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    assert!(
        echoed_url.starts_with("http://10.1.2.3:8080/api/items"),
        "unexpected rewritten url: {echoed_url}"
    );
    assert_eq!(response.text().await.unwrap(), "hello world");
}

#[tokio::test]
async fn duplicate_slashes_cannot_evade_the_router() {
    let proxy = TestProxy::start().await;
    let _agent = start_agent(&proxy, "1", handlers(vec![("/v1/echo", Arc::new(EchoHandler))])).await;

    let mut client = connect_client(&proxy, "//v1//echo", "1").await;
    send_text(&mut client, "sneaky").await;
    assert_eq!(read_text(&mut client).await.as_deref(), Some("sneaky-response"));
}

#[tokio::test]
async fn reregistration_replaces_the_backend() {
    let proxy = TestProxy::start().await;
    let _first = start_agent(
        &proxy,
        "1",
        handlers(vec![("/v1/echo", Arc::new(PrefixEcho("A".to_owned())))]),
    )
    .await;
    let before = proxy.registry.lookup("1").expect("first agent registered");

    let _second = start_agent(
        &proxy,
        "1",
        handlers(vec![("/v1/echo", Arc::new(PrefixEcho("B".to_owned())))]),
    )
    .await;
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(current) = proxy.registry.lookup("1")
                && !Arc::ptr_eq(&current, &before)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration is replaced");

    let mut client = connect_client(&proxy, "/v1/echo", "1").await;
    send_text(&mut client, "x").await;
    assert_eq!(read_text(&mut client).await.as_deref(), Some("B:x"));
}

#[tokio::test]
async fn registration_without_backend_id_is_unprocessable() {
    let proxy = TestProxy::start().await;
    let token = wsrelay_test_utils::sign_claims(
        TEST_SECRET,
        &serde_json::json!({ "reportedUuid": "" }),
    );
    let request = ClientRequestBuilder::new(
        proxy
            .ws_url("/v1/connectbackend")
            .parse()
            .expect("valid url"),
    )
    .with_header("Authorization", format!("Bearer {token}"));
    match tokio_tungstenite::connect_async(request).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 422),
        other => panic!("expected a 422 rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn info_routes_and_unknown_paths() {
    let builder = ProxyBuilder::new(test_config(), TokenValidator::from_dev_secret(TEST_SECRET))
        .expect("can build proxy");
    let server = TestServer::new(builder.build()).expect("can build test server");

    let health = server.get("/health").await;
    health.assert_status_ok();
    health.assert_text("healthy");

    let version = server.get("/version").await;
    version.assert_status_ok();
    version.assert_text_contains("wsrelay-proxy");

    server.get("/nowhere").await.assert_status_not_found();
}

async fn read_frame(socket: &mut setup::ClientSocket) -> String {
    tokio::time::timeout(TEST_TIMEOUT, read_text(socket))
        .await
        .expect("frame arrives in time")
        .expect("tunnel stays open")
}

/// Replies `<tag>:<message>`, to tell two registrations of the same backend
/// id apart.
struct PrefixEcho(String);

#[async_trait::async_trait]
impl SessionHandler for PrefixEcho {
    async fn handle(&self, _key: String, mut incoming: mpsc::Receiver<String>, response: ResponseSender) {
        while let Some(message) = incoming.recv().await {
            if response.send(format!("{}:{message}", self.0)).await.is_err() {
                return;
            }
        }
    }
}

/// Collects the tunneled request and echoes it back: status 200, the method
/// and rewritten URL in headers, the body verbatim.
struct HttpEchoHandler;

#[async_trait::async_trait]
impl SessionHandler for HttpEchoHandler {
    async fn handle(&self, _key: String, mut incoming: mpsc::Receiver<String>, response: ResponseSender) {
        let mut method = String::new();
        let mut url = String::new();
        let mut body = Vec::new();
        while let Some(raw) = incoming.recv().await {
            let Ok(message) = HttpMessage::from_frame_body(&raw) else {
                return;
            };
            if !message.method.is_empty() {
                method = message.method;
                url = message.url;
            }
            body.extend_from_slice(&message.body);
            if message.eof {
                break;
            }
        }

        let head = HttpMessage {
            code: 200,
            headers: [
                ("content-type".to_owned(), vec!["text/plain".to_owned()]),
                ("x-echo-method".to_owned(), vec![method]),
                ("x-echo-url".to_owned(), vec![url]),
            ]
            .into_iter()
            .collect(),
            body,
            ..Default::default()
        };
        let tail = HttpMessage {
            eof: true,
            ..Default::default()
        };
        for message in [head, tail] {
            let encoded = message.to_frame_body().expect("can encode response");
            if response.send(encoded).await.is_err() {
                return;
            }
        }
        let _ = response.close().await;
    }
}
