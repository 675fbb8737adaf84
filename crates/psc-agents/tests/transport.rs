//! Tests for the agent endpoint and outbound links.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceExt;

use psc_agents::transport::server::{build_router, PORT_STEP};
use psc_agents::transport::{Inbound, Message, PeerLink};
use psc_core::Tag;

#[tokio::test]
async fn accl_enqueues_and_acknowledges() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = build_router(tx);

    let body = json!({ "from": "fe[1]", "message": { "kind": "check" } });
    let request = Request::builder()
        .method(Method::POST)
        .uri("/accl")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(reply, json!({ "accepted": true }));

    let envelope = rx.recv().await.unwrap();
    assert_eq!(envelope.from, Some(Tag::parse("fe[1]").unwrap()));
    assert_eq!(envelope.message, Message::Check);
}

#[tokio::test]
async fn malformed_message_is_rejected() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = build_router(tx);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/accl")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"message":{"kind":"no_such_message"}}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_tag_is_rejected_at_the_endpoint() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let app = build_router(tx);
    let body = json!({
        "from": "fe[1]:0",
        "message": { "kind": "properties_sent", "tag": "fe[1]:0:x" }
    });
    let request = Request::builder()
        .method(Method::POST)
        .uri("/accl")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn link_delivers_in_order() {
    let mut inbound = Inbound::open(0).await.unwrap();
    let link = PeerLink::new(reqwest::Client::new(), "127.0.0.1", inbound.port);
    link.probe().await.unwrap();

    let from = Tag::parse("fe[3]:0").unwrap();
    assert!(link.send(&from, &Message::Check).await.unwrap());
    assert!(link.send(&from, &Message::Quit).await.unwrap());

    let first = inbound.inbox.recv().await.unwrap();
    let second = inbound.inbox.recv().await.unwrap();
    assert_eq!(first.from.as_ref(), Some(&from));
    assert_eq!(first.message, Message::Check);
    assert_eq!(second.message, Message::Quit);
}

#[tokio::test]
async fn taken_port_moves_up_by_step() {
    let blocker = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let inbound = Inbound::open(taken).await.unwrap();
    assert_ne!(inbound.port, taken);
    assert!(inbound.port > taken);
    assert_eq!((inbound.port - taken) % PORT_STEP, 0);
}

#[tokio::test]
async fn probe_fails_without_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let link = PeerLink::new(reqwest::Client::new(), "127.0.0.1", port);
    assert!(link.probe().await.is_err());
}
