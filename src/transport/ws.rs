//! WebSocket dialog client.
//!
//! `connect` performs the upgrade plus the hello handshake and returns a
//! handle; a spawned task owns the socket from then on. Callers issue
//! guarded protocol requests through the handle and receive inbound
//! traffic as [`TransportEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::wire::{ClientMessage, ServerMessage};
use super::{TransportCell, TransportEvent, TransportState};
use crate::config::ConnectConfig;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on a single socket write; a stalled peer drops the session
/// instead of wedging the task.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Client-side keep-alive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Command backlog; roughly two seconds of audio frames.
const CMD_CHANNEL_CAPACITY: usize = 64;

enum WsCommand {
    StartListening,
    StopListening,
    Abort,
    Audio(Vec<u8>),
    Close,
}

/// Handle to a live dialog session. Cheap to clone the pieces it holds;
/// dropping the last handle closes the socket task.
pub struct WsClient {
    cell: Arc<TransportCell>,
    cmd_tx: mpsc::Sender<WsCommand>,
    session_id: String,
    server_sample_rate: u32,
}

impl WsClient {
    /// Open the socket, send the capability hello, and wait (bounded) for
    /// the service hello that carries the session id and the negotiated
    /// reply sample rate.
    pub async fn connect(
        url: &str,
        device_id: &str,
        client_id: &str,
        sample_rate: u32,
        cfg: &ConnectConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self> {
        let cell = TransportCell::new();
        cell.begin_connect();

        let mut request = url.into_client_request()?;
        {
            let headers = request.headers_mut();
            headers.insert("Protocol-Version", HeaderValue::from_static("1"));
            if !device_id.is_empty() {
                headers.insert(
                    "Device-Id",
                    HeaderValue::from_str(device_id)
                        .map_err(|e| Error::Transport(format!("bad device id: {e}")))?,
                );
            }
            headers.insert(
                "Client-Id",
                HeaderValue::from_str(client_id)
                    .map_err(|e| Error::Transport(format!("bad client id: {e}")))?,
            );
        }

        let handshake = async {
            let (mut stream, response) = connect_async(request).await?;
            debug!(status = %response.status(), "WebSocket upgrade accepted");

            let hello = ClientMessage::hello(sample_rate).to_json()?;
            stream.send(Message::Text(hello)).await?;

            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(raw))) => match ServerMessage::from_json(&raw) {
                        Ok(ServerMessage::Hello {
                            session_id,
                            audio_params,
                        }) => {
                            let session_id = session_id.unwrap_or_default();
                            let rate = audio_params
                                .and_then(|p| p.sample_rate)
                                .unwrap_or(sample_rate);
                            return Ok((stream, session_id, rate));
                        }
                        Ok(other) => debug!(?other, "Ignoring pre-handshake message"),
                        Err(e) => warn!("Unparseable handshake message: {}", e),
                    },
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(Error::from(e)),
                    None => {
                        return Err(Error::Transport(
                            "connection closed during handshake".to_string(),
                        ))
                    }
                }
            }
        };
        let deadline = Duration::from_millis(cfg.connect_timeout_ms);
        let (stream, session_id, server_sample_rate) = time::timeout(deadline, handshake)
            .await
            .map_err(|_| Error::Timeout("ws_handshake"))??;

        cell.hello_complete();
        info!(session_id = %session_id, server_sample_rate, "Dialog service session open");

        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let task_cell = cell.clone();
        let task_session = session_id.clone();
        tokio::spawn(run_socket(stream, cmd_rx, events, task_cell, task_session));

        Ok(Self {
            cell,
            cmd_tx,
            session_id,
            server_sample_rate,
        })
    }

    pub fn state(&self) -> TransportState {
        self.cell.current()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sample rate the service will synthesize replies at.
    pub fn server_sample_rate(&self) -> u32 {
        self.server_sample_rate
    }

    /// Connected -> Listening; opens a listen session on the service.
    pub async fn start_listening(&self) -> Result<()> {
        self.cell.try_start_listening()?;
        self.send_cmd(WsCommand::StartListening).await
    }

    /// Listening -> WaitingForResponse.
    pub async fn stop_listening(&self) -> Result<()> {
        self.cell.try_stop_listening()?;
        self.send_cmd(WsCommand::StopListening).await
    }

    /// Ask the service to drop the turn in flight. Local state is left
    /// alone; the service answers with a tts stop.
    pub async fn send_abort(&self) -> Result<()> {
        self.cell.check_abort()?;
        self.send_cmd(WsCommand::Abort).await
    }

    /// Forward one binary PCM frame. Rejected outside Listening; dropped
    /// with an error when the outbound queue is full, never buffered
    /// beyond the queue bound.
    pub fn send_audio(&self, pcm: Vec<u8>) -> Result<()> {
        self.cell.check_send_audio()?;
        match self.cmd_tx.try_send(WsCommand::Audio(pcm)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::QueueFull("ws_audio")),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::Transport("socket task closed".to_string()))
            }
        }
    }

    /// Watchdog recovery for a response that never arrived.
    pub fn recover_to_connected(&self) -> bool {
        self.cell.recover_to_connected()
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(WsCommand::Close).await;
    }

    async fn send_cmd(&self, cmd: WsCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| {
            self.cell.reset();
            Error::Transport("socket task closed".to_string())
        })
    }
}

async fn run_socket(
    stream: WsStream,
    mut cmd_rx: mpsc::Receiver<WsCommand>,
    events: mpsc::Sender<TransportEvent>,
    cell: Arc<TransportCell>,
    mut session_id: String,
) {
    let (mut sink, mut read) = stream.split();
    let mut ping = time::interval(PING_INTERVAL);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let msg = match cmd {
                    None | Some(WsCommand::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Some(WsCommand::StartListening) => {
                        json_msg(&ClientMessage::listen_start(&session_id))
                    }
                    Some(WsCommand::StopListening) => {
                        json_msg(&ClientMessage::listen_stop(&session_id))
                    }
                    Some(WsCommand::Abort) => json_msg(&ClientMessage::abort(&session_id)),
                    Some(WsCommand::Audio(bytes)) => Some(Message::Binary(bytes)),
                };
                if let Some(msg) = msg {
                    if let Err(e) = send_msg(&mut sink, msg).await {
                        warn!("WebSocket send failed: {}", e);
                        break;
                    }
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(raw))) => {
                    handle_text(&raw, &cell, &events, &mut session_id).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    // Reply audio only counts while Speaking; stray binary
                    // frames in other states are discarded.
                    if cell.current() == TransportState::Speaking
                        && events.send(TransportEvent::TtsAudio(data)).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("Service closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket read error: {}", e);
                    break;
                }
                None => break,
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    cell.reset();
    let _ = events.send(TransportEvent::Disconnected).await;
    info!("WebSocket session closed");
}

async fn handle_text(
    raw: &str,
    cell: &TransportCell,
    events: &mpsc::Sender<TransportEvent>,
    session_id: &mut String,
) {
    let msg = match ServerMessage::from_json(raw) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Ignoring unknown control message: {}", e);
            return;
        }
    };
    match msg {
        ServerMessage::Hello {
            session_id: sid, ..
        } => {
            // A mid-session hello re-issues the session id; adopt it.
            if let Some(sid) = sid {
                *session_id = sid;
            }
            cell.hello_complete();
        }
        ServerMessage::Stt { text } => {
            info!(text = %text, "Recognition result");
            let _ = events.send(TransportEvent::Stt { text }).await;
        }
        ServerMessage::Tts { state, .. } => match state.as_str() {
            "start" => {
                if cell.tts_start() {
                    let _ = events.send(TransportEvent::TtsStart).await;
                } else {
                    warn!(state = %cell.current(), "tts start in unexpected state");
                }
            }
            "stop" => {
                if cell.tts_stop() {
                    let _ = events.send(TransportEvent::TtsStop).await;
                }
            }
            other => debug!(state = %other, "Unhandled tts state"),
        },
    }
}

fn json_msg(msg: &ClientMessage) -> Option<Message> {
    match msg.to_json() {
        Ok(raw) => Some(Message::Text(raw)),
        Err(e) => {
            warn!("Failed to encode control message: {}", e);
            None
        }
    }
}

async fn send_msg(sink: &mut SplitSink<WsStream, Message>, msg: Message) -> Result<()> {
    match time::timeout(WRITE_TIMEOUT, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Timeout("ws_write")),
    }
}
