//! WebSocket client against a scripted in-process dialog service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use robot_voice_core::config::ConnectConfig;
use robot_voice_core::transport::ws::WsClient;
use robot_voice_core::transport::{TransportEvent, TransportState};
use robot_voice_core::Error;

const RECV_WAIT: Duration = Duration::from_secs(3);

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Read the client hello, check its shape, and answer with the service
/// hello carrying `session_id` and the negotiated rate.
async fn hello_exchange(ws: &mut WebSocketStream<TcpStream>, rate: u32) {
    let msg = ws.next().await.unwrap().unwrap();
    let hello: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["version"], 1);
    assert_eq!(hello["audio_params"]["format"], "pcm");

    let reply = format!(
        r#"{{"type":"hello","session_id":"s-test","audio_params":{{"sample_rate":{}}}}}"#,
        rate
    );
    ws.send(Message::Text(reply)).await.unwrap();
}

async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    timeout(RECV_WAIT, rx.recv()).await.unwrap().unwrap()
}

async fn connect(url: &str, events: mpsc::Sender<TransportEvent>) -> WsClient {
    WsClient::connect(
        url,
        "dev-42",
        "client-1",
        16_000,
        &ConnectConfig::default(),
        events,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn full_turn_streams_audio_and_reply() {
    let (listener, url) = bind().await;
    let binary_frames = Arc::new(AtomicUsize::new(0));
    let server_count = binary_frames.clone();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello_exchange(&mut ws, 24_000).await;

        // Listen start, three audio frames, listen stop.
        let msg = ws.next().await.unwrap().unwrap();
        let listen: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(listen["type"], "listen");
        assert_eq!(listen["state"], "start");
        assert_eq!(listen["session_id"], "s-test");
        assert_eq!(listen["mode"], "auto");

        loop {
            let msg = ws.next().await.unwrap().unwrap();
            match msg {
                Message::Binary(frame) => {
                    assert_eq!(frame.len(), 640);
                    server_count.fetch_add(1, Ordering::SeqCst);
                }
                Message::Text(raw) => {
                    let stop: serde_json::Value = serde_json::from_str(&raw).unwrap();
                    assert_eq!(stop["type"], "listen");
                    assert_eq!(stop["state"], "stop");
                    break;
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        ws.send(Message::Text(
            r#"{"type":"stt","text":"hello robot"}"#.to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(
            r#"{"type":"tts","state":"start"}"#.to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::Binary(vec![0u8; 320])).await.unwrap();
        ws.send(Message::Text(r#"{"type":"tts","state":"stop"}"#.to_string()))
            .await
            .unwrap();

        // Hold the connection until the client closes it.
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let (tx, mut rx) = mpsc::channel(16);
    let client = connect(&url, tx).await;
    assert_eq!(client.session_id(), "s-test");
    assert_eq!(client.server_sample_rate(), 24_000);
    assert_eq!(client.state(), TransportState::Connected);

    client.start_listening().await.unwrap();
    assert_eq!(client.state(), TransportState::Listening);
    for _ in 0..3 {
        client.send_audio(vec![0u8; 640]).unwrap();
    }
    client.stop_listening().await.unwrap();
    assert_eq!(client.state(), TransportState::WaitingForResponse);

    match next_event(&mut rx).await {
        TransportEvent::Stt { text } => assert_eq!(text, "hello robot"),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(matches!(next_event(&mut rx).await, TransportEvent::TtsStart));
    assert_eq!(client.state(), TransportState::Speaking);
    match next_event(&mut rx).await {
        TransportEvent::TtsAudio(data) => assert_eq!(data.len(), 320),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(matches!(next_event(&mut rx).await, TransportEvent::TtsStop));
    assert_eq!(client.state(), TransportState::Connected);
    assert_eq!(binary_frames.load(Ordering::SeqCst), 3);

    client.close().await;
    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Disconnected
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn audio_is_rejected_outside_listening() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello_exchange(&mut ws, 16_000).await;
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let (tx, mut rx) = mpsc::channel(16);
    let client = connect(&url, tx).await;

    match client.send_audio(vec![0u8; 640]) {
        Err(Error::InvalidState { op, .. }) => assert_eq!(op, "send_audio"),
        other => panic!("expected invalid state, got {:?}", other),
    }

    client.close().await;
    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Disconnected
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn stray_binary_outside_speaking_is_discarded() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello_exchange(&mut ws, 16_000).await;
        // Reply audio with no tts start framing it.
        ws.send(Message::Binary(vec![0u8; 640])).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"stt","text":"marker"}"#.to_string(),
        ))
        .await
        .unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let (tx, mut rx) = mpsc::channel(16);
    let client = connect(&url, tx).await;

    // The marker text arrives after the binary; if the binary had been
    // forwarded we would see TtsAudio first.
    match next_event(&mut rx).await {
        TransportEvent::Stt { text } => assert_eq!(text, "marker"),
        other => panic!("unexpected event: {:?}", other),
    }

    client.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn service_close_resets_the_session() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello_exchange(&mut ws, 16_000).await;
        ws.send(Message::Close(None)).await.unwrap();
    });

    let (tx, mut rx) = mpsc::channel(16);
    let client = connect(&url, tx).await;

    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Disconnected
    ));
    assert_eq!(client.state(), TransportState::Idle);

    // Requests after the reset are refused locally.
    assert!(client.start_listening().await.is_err());
    server.await.unwrap();
}

#[tokio::test]
async fn upgrade_carries_identity_headers() {
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            assert_eq!(
                req.headers().get("Protocol-Version").unwrap().to_str().unwrap(),
                "1"
            );
            assert_eq!(
                req.headers().get("Device-Id").unwrap().to_str().unwrap(),
                "dev-42"
            );
            assert_eq!(
                req.headers().get("Client-Id").unwrap().to_str().unwrap(),
                "client-1"
            );
            Ok(resp)
        })
        .await
        .unwrap();
        hello_exchange(&mut ws, 16_000).await;
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let (tx, _rx) = mpsc::channel(16);
    let client = connect(&url, tx).await;
    client.close().await;
    server.await.unwrap();
}
