use futures::SinkExt;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use skipper_browser::cdp::CdpTransport;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("ws://{addr}"))
}

fn parse_command(message: Message) -> Value {
    match message {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn responses_are_correlated_even_out_of_order() {
    let (listener, url) = bind_server().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let first = parse_command(ws.next().await.unwrap().unwrap());
        let second = parse_command(ws.next().await.unwrap().unwrap());

        // Answer in reverse arrival order; correlation is by id, not order.
        for cmd in [&second, &first] {
            let id = cmd["id"].as_i64().unwrap();
            let method = cmd["method"].as_str().unwrap();
            let reply = json!({ "id": id, "result": { "echo": method } }).to_string();
            ws.send(Message::Text(reply)).await.unwrap();
        }
    });

    let transport = CdpTransport::connect(&url).await.unwrap();
    let (alpha, beta) = tokio::join!(
        transport.send("Alpha.one", json!({})),
        transport.send("Beta.two", json!({})),
    );

    assert_eq!(alpha.unwrap()["echo"], json!("Alpha.one"));
    assert_eq!(beta.unwrap()["echo"], json!("Beta.two"));
    server.await.unwrap();
}

#[tokio::test]
async fn protocol_error_payloads_become_errors() {
    let (listener, url) = bind_server().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let cmd = parse_command(ws.next().await.unwrap().unwrap());
        let reply = json!({
            "id": cmd["id"],
            "error": { "code": -32000, "message": "No such method" }
        })
        .to_string();
        ws.send(Message::Text(reply)).await.unwrap();
    });

    let transport = CdpTransport::connect(&url).await.unwrap();
    let err = transport.send("Nope.missing", json!({})).await.unwrap_err();
    assert_eq!(err.code(), "external");
    assert!(err.to_string().contains("No such method"));
}

#[tokio::test]
async fn unsolicited_events_reach_waiters_and_subscribers() {
    let (listener, url) = bind_server().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        // Wait for the client's sync command so registrations are in place.
        let cmd = parse_command(ws.next().await.unwrap().unwrap());
        ws.send(Message::Text(
            json!({ "id": cmd["id"], "result": {} }).to_string(),
        ))
        .await
        .unwrap();

        for n in 1..=2 {
            let event = json!({
                "method": "Browser.downloadWillBegin",
                "params": { "n": n }
            })
            .to_string();
            ws.send(Message::Text(event)).await.unwrap();
        }
        // Keep the socket open until the client is done reading.
        let _ = ws.next().await;
    });

    let transport = CdpTransport::connect(&url).await.unwrap();
    let waiter = transport.wait_for_event("Browser.downloadWillBegin").await;
    let mut subscription = transport.subscribe("Browser.downloadWillBegin").await;
    transport.send("Sync.point", json!({})).await.unwrap();

    let one_shot = waiter.await.unwrap();
    assert_eq!(one_shot["n"], json!(1));

    // The persistent subscription sees both events; the one-shot saw only the
    // first.
    assert_eq!(subscription.recv().await.unwrap()["n"], json!(1));
    assert_eq!(subscription.recv().await.unwrap()["n"], json!(2));
}

#[tokio::test]
async fn server_close_rejects_all_in_flight_commands() {
    let (listener, url) = bind_server().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        // Read the command but never answer it.
        let _ = ws.next().await;
        ws.close(None).await.unwrap();
    });

    let transport = CdpTransport::connect(&url).await.unwrap();
    let err = transport.send("Never.answered", json!({})).await.unwrap_err();
    assert_eq!(err.code(), "external");

    // Once closed, new sends fail fast.
    let err = transport.send("After.close", json!({})).await.unwrap_err();
    assert_eq!(err.code(), "external");
}

#[tokio::test]
async fn explicit_close_is_idempotent() {
    let (listener, url) = bind_server().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let transport = CdpTransport::connect(&url).await.unwrap();
    transport.close().await;
    transport.close().await;
    assert!(transport.is_closed());
    assert!(transport.send("X.y", json!({})).await.is_err());
}
