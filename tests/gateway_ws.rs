//! Integrationstests für den Gateway-Client gegen einen in-process
//! Mock-Gateway (echter WebSocket-Server).

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message;
use voicelink::gateway::{EventDispatcher, GatewayClient, GatewayError, GatewayEvent};

// ============================================================================
// MOCK GATEWAY
// ============================================================================

/// Steuerkommandos an den Mock
enum MockCmd {
    /// Rohe JSON-Nachricht an den Client schicken
    Send(Value),
    /// Binären Frame an den Client schicken
    SendBinary(Vec<u8>),
}

struct MockGateway {
    addr: SocketAddr,
    ctrl_tx: mpsc::UnboundedSender<MockCmd>,
    /// Plugin-Requests (body.request), die der Mock gesehen hat
    seen_rx: mpsc::UnboundedReceiver<String>,
}

/// Startet einen Mock-Gateway-Server für genau eine Verbindung
///
/// Beantwortet create/attach/keepalive/destroy; Plugin-Nachrichten werden
/// mit `ack` quittiert und protokolliert. `fail_plugin_requests` lässt
/// Plugin-Nachrichten stattdessen mit einem Janus-Error scheitern.
async fn spawn_mock_gateway(fail_plugin_requests: bool) -> MockGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<MockCmd>();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &WsRequest, mut resp: WsResponse| {
                // Subprotokoll zurückspiegeln, wie es das echte Gateway tut
                if let Some(proto) = req.headers().get("Sec-WebSocket-Protocol") {
                    resp.headers_mut()
                        .insert("Sec-WebSocket-Protocol", proto.clone());
                }
                Ok(resp)
            },
        )
        .await
        .unwrap();

        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(Ok(msg)) = msg else { break };
                    let Message::Text(text) = msg else { continue };
                    let v: Value = serde_json::from_str(&text).unwrap();
                    let tx = v["transaction"].as_str().unwrap_or("");

                    let reply = match v["janus"].as_str().unwrap_or("") {
                        "create" => json!({
                            "janus": "success", "transaction": tx, "data": { "id": 11 }
                        }),
                        "attach" => json!({
                            "janus": "success", "transaction": tx, "data": { "id": 22 }
                        }),
                        "keepalive" | "destroy" => json!({
                            "janus": "ack", "transaction": tx
                        }),
                        "message" => {
                            let request = v["body"]["request"].as_str().unwrap_or("");
                            let _ = seen_tx.send(request.to_string());
                            if fail_plugin_requests {
                                json!({
                                    "janus": "error", "transaction": tx,
                                    "error": { "code": 446, "reason": "Unauthorized request" }
                                })
                            } else {
                                json!({ "janus": "ack", "transaction": tx })
                            }
                        }
                        _ => continue,
                    };
                    write.send(Message::Text(reply.to_string())).await.unwrap();
                }
                cmd = ctrl_rx.recv() => {
                    match cmd {
                        Some(MockCmd::Send(v)) => {
                            write.send(Message::Text(v.to_string())).await.unwrap();
                        }
                        Some(MockCmd::SendBinary(b)) => {
                            write.send(Message::Binary(b)).await.unwrap();
                        }
                        None => break,
                    }
                }
            }
        }
    });

    MockGateway {
        addr,
        ctrl_tx,
        seen_rx,
    }
}

async fn connected_client(mock: &MockGateway) -> (Arc<EventDispatcher>, GatewayClient) {
    let dispatcher = Arc::new(EventDispatcher::new());
    let client = GatewayClient::new(
        format!("ws://{}", mock.addr),
        None,
        Arc::clone(&dispatcher),
    );
    client.connect().await.expect("connect");
    client.attach_plugin().await.expect("attach");
    (dispatcher, client)
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_session_setup_correlates_responses() {
    let mock = spawn_mock_gateway(false).await;
    let (_dispatcher, client) = connected_client(&mock).await;

    assert_eq!(client.session_id(), Some(11));
    assert_eq!(client.handle_id(), Some(22));
    assert!(client.is_connected());

    client.disconnect().await;
}

#[tokio::test]
async fn test_plugin_request_ack_and_event_fallthrough() {
    let mut mock = spawn_mock_gateway(false).await;
    let (dispatcher, client) = connected_client(&mock).await;

    // Handler für das asynchrone Plugin-Event
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<String>();
    dispatcher.on_event("registered", move |ev| {
        let ev_tx = ev_tx.clone();
        async move {
            if let GatewayEvent::Plugin(ev) = ev {
                let _ = ev_tx.send(ev.caller().unwrap_or_default());
            }
        }
    });

    // register wird mit ack beantwortet und kehrt zurück
    client
        .register("10.0.0.5", 5060, "9000", "pw", "Agent")
        .await
        .expect("register");
    assert_eq!(mock.seen_rx.recv().await.as_deref(), Some("register"));

    // Das spätere Event trägt dieselbe Transaktions-Semantik wie das echte
    // Gateway (Slot ist konsumiert) und muss beim Dispatcher landen
    mock.ctrl_tx
        .send(MockCmd::Send(json!({
            "janus": "event",
            "sender": 22,
            "plugindata": {
                "plugin": "janus.plugin.sip",
                "data": { "sip": "event", "result": {
                    "event": "registered", "username": "sip:9000@10.0.0.5"
                } }
            }
        })))
        .unwrap();

    let caller = tokio::time::timeout(Duration::from_secs(2), ev_rx.recv())
        .await
        .expect("event dispatched")
        .unwrap();
    assert_eq!(caller, "sip:9000@10.0.0.5");

    client.disconnect().await;
}

#[tokio::test]
async fn test_remote_error_surfaces_with_code() {
    let mock = spawn_mock_gateway(true).await;
    let (_dispatcher, client) = connected_client(&mock).await;

    let err = client
        .register("10.0.0.5", 5060, "9000", "pw", "Agent")
        .await
        .expect_err("register must fail");

    match err {
        GatewayError::Remote { code, reason } => {
            assert_eq!(code, 446);
            assert_eq!(reason, "Unauthorized request");
        }
        other => panic!("unexpected error: {:?}", other),
    }

    client.disconnect().await;
}

#[tokio::test]
async fn test_binary_frames_bypass_json_path() {
    let mock = spawn_mock_gateway(false).await;
    let (dispatcher, client) = connected_client(&mock).await;

    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(8);
    dispatcher.set_audio_sink(audio_tx);

    mock.ctrl_tx
        .send(MockCmd::SendBinary(vec![0x7F, 0x80, 0xFF]))
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), audio_rx.recv())
        .await
        .expect("frame routed")
        .unwrap();
    assert_eq!(frame, vec![0x7F, 0x80, 0xFF]);

    client.disconnect().await;
}

#[tokio::test]
async fn test_connection_level_events_reach_handlers() {
    let mock = spawn_mock_gateway(false).await;
    let (dispatcher, client) = connected_client(&mock).await;

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<&'static str>();

    let tx = ev_tx.clone();
    dispatcher.on_event("webrtcup", move |_| {
        let tx = tx.clone();
        async move {
            let _ = tx.send("webrtcup");
        }
    });
    let tx = ev_tx.clone();
    dispatcher.on_event("hangup", move |_| {
        let tx = tx.clone();
        async move {
            let _ = tx.send("hangup");
        }
    });

    mock.ctrl_tx
        .send(MockCmd::Send(json!({ "janus": "webrtcup", "sender": 22 })))
        .unwrap();
    mock.ctrl_tx
        .send(MockCmd::Send(json!({
            "janus": "hangup", "sender": 22, "reason": "DTLS alert"
        })))
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), ev_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), ev_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, "webrtcup");
    assert_eq!(second, "hangup");

    client.disconnect().await;
}

#[tokio::test]
async fn test_requests_after_disconnect_fail_cleanly() {
    let mock = spawn_mock_gateway(false).await;
    let (_dispatcher, client) = connected_client(&mock).await;

    client.disconnect().await;

    let err = client
        .register("10.0.0.5", 5060, "9000", "pw", "Agent")
        .await
        .expect_err("must fail after disconnect");
    assert!(matches!(err, GatewayError::NotConnected));
}
