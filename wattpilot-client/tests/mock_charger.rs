//! End-to-end tests against a mock charger
//!
//! The mock speaks the charger side of the protocol over a real WebSocket on
//! 127.0.0.1 and checks what the client sends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use wattpilot_client::hash::{pbkdf2_hash, HashedPassword};
use wattpilot_client::protocol::messages::{auth_hash, hmac_sha256_hex, RequestId};
use wattpilot_client::{ClientConfig, Event, EventKind, PropertyValue, WattpilotClient};

type Ws = WebSocketStream<TcpStream>;

const PASSWORD: &str = "s3cretPassw0rd";
const SERIAL: &str = "12345678";
const TOKEN1: &str = "aaa";
const TOKEN2: &str = "bbb";
const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Mock charger helpers
// ============================================================================

async fn listen() -> (TcpListener, String) {
    let listener = assert_ok!(TcpListener::bind("127.0.0.1:0").await);
    let addr = assert_ok!(listener.local_addr());
    (listener, addr.to_string())
}

async fn accept(listener: &TcpListener) -> Ws {
    let (stream, _) = assert_ok!(timeout(WAIT, listener.accept()).await.expect("no connection"));
    assert_ok!(accept_async(stream).await)
}

async fn send(ws: &mut Ws, value: Value) {
    assert_ok!(ws.send(Message::Text(value.to_string())).await);
}

/// Next text frame as JSON, `None` once the client closed the socket
async fn recv(ws: &mut Ws) -> Option<Value> {
    loop {
        match timeout(WAIT, ws.next()).await.expect("client went silent") {
            Some(Ok(Message::Text(text))) => return Some(assert_ok!(serde_json::from_str(&text))),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn recv_frame(ws: &mut Ws) -> Value {
    recv(ws).await.expect("socket closed")
}

fn hello(secured: bool) -> Value {
    json!({
        "type": "hello",
        "serial": SERIAL,
        "hostname": "Wattpilot_12345678",
        "friendly_name": "Garage",
        "manufacturer": "fronius",
        "devicetype": "wattpilot",
        "version": "36.3",
        "protocol": 2,
        "secured": secured
    })
}

/// Run hello and the challenge; returns the client's auth frame
async fn challenge(ws: &mut Ws, secured: bool) -> Value {
    send(ws, hello(secured)).await;
    send(ws, json!({"type": "authRequired", "token1": TOKEN1, "token2": TOKEN2})).await;
    let auth = recv_frame(ws).await;
    assert_eq!(auth["type"], "auth");
    auth
}

/// Full handshake, verifying the auth digest like the charger does
async fn authenticate(ws: &mut Ws, key: &HashedPassword, secured: bool) -> Value {
    let auth = challenge(ws, secured).await;
    let token3 = auth["token3"].as_str().expect("token3").to_string();
    assert_eq!(token3.len(), 32);
    assert!(token3.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_eq!(auth["hash"], auth_hash(TOKEN1, TOKEN2, &token3, key.as_bytes()));

    send(ws, json!({"type": "authSuccess", "token3": token3})).await;
    auth
}

fn record(client: &WattpilotClient) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::SocketOpen,
        EventKind::SocketError,
        EventKind::SocketClose,
        EventKind::Hello,
        EventKind::AuthRequired,
        EventKind::AuthSuccess,
        EventKind::AuthError,
        EventKind::FullStatus,
        EventKind::FullStatusFinished,
        EventKind::Initialized,
        EventKind::Response,
    ] {
        let events = events.clone();
        client.on(kind, move |event| events.lock().push(event.clone()));
    }
    events
}

fn kinds(events: &Arc<Mutex<Vec<Event>>>) -> Vec<EventKind> {
    events.lock().iter().map(Event::kind).collect()
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

fn config(addr: &str) -> ClientConfig {
    ClientConfig::local(addr, PASSWORD).with_rng_seed(42)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_initialization_and_write() {
    let (listener, addr) = listen().await;

    let charger = tokio::spawn(async move {
        let key = pbkdf2_hash(PASSWORD, SERIAL);
        let mut ws = accept(&listener).await;
        authenticate(&mut ws, &key, false).await;
        send(
            &mut ws,
            json!({"type": "fullStatus", "partial": false, "status": {"amp": 16, "car": 1}}),
        )
        .await;

        let write = recv_frame(&mut ws).await;
        assert_eq!(
            write,
            json!({"type": "setValue", "requestId": 1, "key": "amp", "value": 10})
        );
        send(
            &mut ws,
            json!({"type": "response", "requestId": 1, "success": true, "status": {"amp": 10}}),
        )
        .await;

        // Client disconnects without auto reconnect
        assert!(recv(&mut ws).await.is_none());
    });

    let client = assert_ok!(WattpilotClient::new(config(&addr).without_auto_reconnect()));
    let events = record(&client);
    assert_ok!(client.connect());

    assert!(client.wait_until_ready(WAIT).await);
    assert!(eventually(|| kinds(&events).contains(&EventKind::Initialized)).await);
    assert_eq!(client.serial().as_deref(), Some(SERIAL));
    assert_eq!(client.name().as_deref(), Some("Wattpilot_12345678"));
    assert_eq!(client.get("amp"), Some(PropertyValue::Int(16)));
    assert_eq!(client.derived().amp, Some(16));

    assert_eq!(assert_ok!(client.set_power(10).await), 1);
    assert!(eventually(|| client.get("amp") == Some(PropertyValue::Int(10))).await);
    assert!(eventually(|| kinds(&events).contains(&EventKind::Response)).await);

    client.disconnect(false);
    assert_ok!(timeout(WAIT, client.join()).await);
    assert_ok!(charger.await);

    assert_eq!(
        kinds(&events),
        vec![
            EventKind::Connect,
            EventKind::SocketOpen,
            EventKind::Hello,
            EventKind::AuthRequired,
            EventKind::AuthSuccess,
            EventKind::FullStatus,
            EventKind::FullStatusFinished,
            EventKind::Initialized,
            EventKind::Response,
            EventKind::Disconnect,
            EventKind::SocketClose,
        ]
    );
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_seeded_clients_send_identical_auth() {
    let (listener, addr) = listen().await;

    let charger = tokio::spawn(async move {
        let mut frames = Vec::new();
        for _ in 0..2 {
            let mut ws = accept(&listener).await;
            frames.push(challenge(&mut ws, false).await);
            assert!(recv(&mut ws).await.is_none());
        }
        frames
    });

    for _ in 0..2 {
        let client = assert_ok!(WattpilotClient::new(config(&addr).without_auto_reconnect()));
        assert_ok!(client.connect());
        assert!(eventually(|| client.session_state()
            == wattpilot_client::SessionState::Authenticating)
        .await);
        client.disconnect(false);
        assert_ok!(timeout(WAIT, client.join()).await);
    }

    let frames = assert_ok!(charger.await);
    assert_eq!(frames[0], frames[1]);
}

#[tokio::test]
async fn test_reconnect_restarts_ids_and_keeps_values() {
    let (listener, addr) = listen().await;
    let interval = Duration::from_millis(200);

    let charger = tokio::spawn(async move {
        let key = pbkdf2_hash(PASSWORD, SERIAL);

        let mut ws = accept(&listener).await;
        authenticate(&mut ws, &key, false).await;
        send(
            &mut ws,
            json!({"type": "fullStatus", "partial": false, "status": {"amp": 16}}),
        )
        .await;
        let first = recv_frame(&mut ws).await;
        assert_eq!(first["requestId"], 1);
        assert_ok!(ws.close(None).await);
        let closed_at = Instant::now();

        let mut ws = accept(&listener).await;
        let waited = closed_at.elapsed();
        authenticate(&mut ws, &key, false).await;
        let second = recv_frame(&mut ws).await;
        assert_eq!(second["requestId"], 1);
        assert_eq!(second["value"], 12);
        send(
            &mut ws,
            json!({"type": "fullStatus", "partial": false, "status": {"amp": 12}}),
        )
        .await;

        assert!(recv(&mut ws).await.is_none());
        waited
    });

    let client = assert_ok!(WattpilotClient::new(
        config(&addr).with_reconnect_interval(interval)
    ));
    let events = record(&client);
    assert_ok!(client.connect());
    assert!(client.wait_until_ready(WAIT).await);
    assert_eq!(assert_ok!(client.set_power(16).await), 1);

    // Second session authenticated, first full status not yet sent
    assert!(eventually(|| client.connection_attempts() == 2 && client.is_connected()).await);
    assert!(!client.all_properties_initialized());
    assert_eq!(client.get("amp"), Some(PropertyValue::Int(16)));

    assert_eq!(assert_ok!(client.send_update("amp", 12i64).await), 1);
    assert!(client.wait_until_ready(WAIT).await);
    assert_eq!(client.get("amp"), Some(PropertyValue::Int(12)));

    client.disconnect(false);
    assert_ok!(timeout(WAIT, client.join()).await);
    let waited = assert_ok!(charger.await);
    assert!(waited >= Duration::from_millis(150), "reconnected after {:?}", waited);

    let initialized = kinds(&events)
        .into_iter()
        .filter(|kind| *kind == EventKind::Initialized)
        .count();
    assert_eq!(initialized, 2);
}

#[tokio::test]
async fn test_wrong_password_stops_reconnecting() {
    let (listener, addr) = listen().await;

    let charger = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        challenge(&mut ws, false).await;
        send(&mut ws, json!({"type": "authError", "message": "Wrong password"})).await;
        assert!(recv(&mut ws).await.is_none());

        // No second attempt within several reconnect intervals
        timeout(Duration::from_millis(500), listener.accept())
            .await
            .is_err()
    });

    let client = assert_ok!(WattpilotClient::new(
        ClientConfig::local(addr.as_str(), "not-the-password")
            .with_reconnect_interval(Duration::from_millis(50))
    ));
    let events = record(&client);
    assert_ok!(client.connect());

    assert_ok!(timeout(WAIT, client.join()).await);
    assert!(assert_ok!(charger.await));
    assert!(kinds(&events).contains(&EventKind::AuthError));
    assert_eq!(client.connection_attempts(), 1);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_secured_writes_carry_hmac() {
    let (listener, addr) = listen().await;

    let charger = tokio::spawn(async move {
        let key = pbkdf2_hash(PASSWORD, SERIAL);
        let mut ws = accept(&listener).await;
        authenticate(&mut ws, &key, true).await;
        send(
            &mut ws,
            json!({"type": "fullStatus", "partial": false, "status": {"amp": 16}}),
        )
        .await;

        let frame = recv_frame(&mut ws).await;
        assert_eq!(frame["type"], "securedMsg");
        assert_eq!(frame["requestId"], "1sm");
        let data = frame["data"].as_str().expect("data").to_string();
        assert_eq!(
            frame["hmac"],
            assert_ok!(hmac_sha256_hex(key.as_bytes(), data.as_bytes()))
        );

        let inner: Value = assert_ok!(serde_json::from_str(&data));
        assert_eq!(
            inner,
            json!({"type": "setValue", "requestId": 1, "key": "lmo", "value": 4})
        );
        send(
            &mut ws,
            json!({"type": "response", "requestId": "1sm", "success": false, "message": "denied"}),
        )
        .await;
        assert!(recv(&mut ws).await.is_none());
    });

    let client = assert_ok!(WattpilotClient::new(config(&addr).without_auto_reconnect()));
    let events = record(&client);
    assert_ok!(client.connect());
    assert!(client.wait_until_ready(WAIT).await);

    assert_eq!(
        assert_ok!(client.set_mode(wattpilot_client::LoadMode::Eco).await),
        1
    );
    assert!(eventually(|| kinds(&events).contains(&EventKind::Response)).await);

    let response = events.lock().iter().find_map(|event| match event {
        Event::Response(response) => Some(response.clone()),
        _ => None,
    });
    let response = response.expect("response event");
    assert!(!response.success);
    assert_eq!(response.request_id, Some(RequestId::Text("1sm".into())));
    assert_eq!(client.get("lmo"), None);

    client.disconnect(false);
    assert_ok!(timeout(WAIT, client.join()).await);
    assert_ok!(charger.await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_leave_in_id_order() {
    const WRITES: usize = 20;
    let (listener, addr) = listen().await;

    let charger = tokio::spawn(async move {
        let key = pbkdf2_hash(PASSWORD, SERIAL);
        let mut ws = accept(&listener).await;
        authenticate(&mut ws, &key, false).await;
        send(
            &mut ws,
            json!({"type": "fullStatus", "partial": false, "status": {"amp": 16}}),
        )
        .await;

        let mut ids = Vec::new();
        for _ in 0..WRITES {
            let frame = recv_frame(&mut ws).await;
            assert_eq!(frame["key"], "amp");
            ids.push(frame["requestId"].as_u64().expect("numeric id"));
        }

        let structured = recv_frame(&mut ws).await;
        assert_eq!(structured["key"], "rfd");
        assert_eq!(structured["value"], json!([1, 2]));

        assert!(recv(&mut ws).await.is_none());
        ids
    });

    let client = assert_ok!(WattpilotClient::new(config(&addr).without_auto_reconnect()));
    assert_ok!(client.connect());
    assert!(client.wait_until_ready(WAIT).await);

    let writes = (0..WRITES).map(|i| {
        let client = client.clone();
        tokio::spawn(async move { client.send_update("amp", 6 + i as i64).await })
    });
    for result in join_all(writes).await {
        assert_ok!(assert_ok!(result));
    }
    assert_ok!(client.set_property("rfd", "[1, 2]", None, true).await);

    client.disconnect(false);
    assert_ok!(timeout(WAIT, client.join()).await);

    let ids = assert_ok!(charger.await);
    assert_eq!(ids, (1..=WRITES as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_write_failure_reports_and_reconnects() {
    let (listener, addr) = listen().await;

    let charger = tokio::spawn(async move {
        for _ in 0..2 {
            let mut ws = accept(&listener).await;
            send(&mut ws, json!({"type": "hello", "serial": SERIAL})).await;
            send(
                &mut ws,
                json!({"type": "authRequired", "token1": TOKEN1, "token2": TOKEN2}),
            )
            .await;
            // The auth frame is larger than the client may send
            assert!(recv(&mut ws).await.is_none());
        }
    });

    let client = assert_ok!(WattpilotClient::new(
        config(&addr)
            .with_reconnect_interval(Duration::from_millis(100))
            .with_max_message_size(100)
    ));
    let events = record(&client);
    assert_ok!(client.connect());

    let closes = || {
        kinds(&events)
            .into_iter()
            .filter(|kind| *kind == EventKind::SocketClose)
            .count()
    };
    assert!(eventually(|| client.connection_attempts() >= 2 && closes() >= 2).await);
    assert!(!client.is_connected());

    client.disconnect(false);
    assert_ok!(timeout(WAIT, client.join()).await);
    assert_ok!(charger.await);

    assert_eq!(
        kinds(&events)[..6],
        [
            EventKind::Connect,
            EventKind::SocketOpen,
            EventKind::Hello,
            EventKind::AuthRequired,
            EventKind::SocketError,
            EventKind::SocketClose,
        ]
    );
    assert!(events
        .lock()
        .iter()
        .any(|event| matches!(event, Event::SocketError(reason) if !reason.is_empty())));
}
