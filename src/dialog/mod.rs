//! Dialog engine: wake handling, per-frame gating, utterance dispatch,
//! and the session watchdog.
//!
//! One task owns the wake/dialog state machine and the segmenter. It
//! selects over captured audio frames, control messages from the host,
//! transport events from the streaming client, and a once-a-second
//! watchdog tick. A separate upload worker drains finalized utterances in
//! batch mode so network waits never stall frame processing.

pub mod segmenter;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::actions::{ActionDispatcher, Command};
use crate::assets;
use crate::audio::{wav, AudioFrame};
use crate::config::CoreConfig;
use crate::ipc::HostEvent;
use crate::playback::Player;
use crate::transport::http::HttpChat;
use crate::transport::ws::WsClient;
use crate::transport::{DialogService, TransportEvent};
use crate::Error;

pub use segmenter::{EndpointMode, SegmentEvent, Segmenter, Utterance};
pub use session::{DialogSession, WakeState, WakeStateMachine};

/// Watchdog cadence for session and turn timeouts.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);
/// Finalized utterances awaiting upload in batch mode.
const UTTERANCE_QUEUE_DEPTH: usize = 4;
/// Inbound transport events buffered ahead of the engine loop.
const TRANSPORT_EVENT_CAPACITY: usize = 64;
/// Connect attempts per wake before falling back.
const CONNECT_ATTEMPTS: u32 = 3;
/// Poll cadence while a batch reply plays out.
const PLAYOUT_POLL: Duration = Duration::from_millis(500);
/// Ceiling on waiting for a batch reply to play out.
const PLAYOUT_CEILING: Duration = Duration::from_secs(60);

/// Wake classifier gate. The engine closes it for the duration of a
/// session so the device cannot re-trigger on itself, and re-opens it on
/// teardown.
pub trait WakeDetector {
    fn set_enabled(&mut self, enabled: bool);
    /// Drop any buffered classifier state.
    fn flush(&mut self);
}

/// Control messages driving the engine.
#[derive(Debug)]
pub enum EngineControl {
    /// Wake phrase detected (or host-triggered wake).
    Wake,
    /// Local command classified.
    Command(Command),
    /// Ask the current dialog session to end.
    ExitDialog,
    Shutdown,
}

/// Streaming-turn progress, watched by the tick handler.
struct TurnWatch {
    started_ms: u64,
    tts_active: bool,
    tts_stopped: bool,
}

pub struct Engine {
    cfg: CoreConfig,
    streaming: bool,
    wake: Arc<WakeStateMachine>,
    session: Arc<DialogSession>,
    segmenter: Segmenter,
    player: Player,
    actions: ActionDispatcher,
    detector: Box<dyn WakeDetector + Send>,
    host: mpsc::UnboundedSender<HostEvent>,
    transport_tx: mpsc::Sender<TransportEvent>,
    transport_rx: Option<mpsc::Receiver<TransportEvent>>,
    service: Option<DialogService>,
    upload_tx: Option<mpsc::Sender<Utterance>>,
    turn: Option<TurnWatch>,
    command_deadline_ms: Option<u64>,
    client_id: String,
    started: Instant,
}

impl Engine {
    pub fn new(
        cfg: CoreConfig,
        player: Player,
        actions: ActionDispatcher,
        detector: Box<dyn WakeDetector + Send>,
        host: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        let streaming = cfg.use_websocket();
        let mode = if streaming {
            EndpointMode::Streaming
        } else {
            EndpointMode::Batch
        };
        let segmenter = Segmenter::new(cfg.segmenter.clone(), cfg.sample_rate_hz, mode);
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
        Self {
            cfg,
            streaming,
            wake: WakeStateMachine::new(),
            session: DialogSession::new(),
            segmenter,
            player,
            actions,
            detector,
            host,
            transport_tx,
            transport_rx: Some(transport_rx),
            service: None,
            upload_tx: None,
            turn: None,
            command_deadline_ms: None,
            client_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
        }
    }

    pub fn wake_machine(&self) -> Arc<WakeStateMachine> {
        self.wake.clone()
    }

    pub fn session(&self) -> Arc<DialogSession> {
        self.session.clone()
    }

    /// Run the engine until the frame source closes or a shutdown control
    /// arrives.
    pub async fn run(
        mut self,
        mut frames: mpsc::Receiver<AudioFrame>,
        mut control: mpsc::Receiver<EngineControl>,
    ) {
        let mut transport_rx = match self.transport_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        if !self.streaming {
            self.start_batch_service();
        }
        self.wake.start();
        info!(
            streaming = self.streaming,
            client_id = %self.client_id,
            "Dialog engine running"
        );
        let _ = self.host.send(HostEvent::Ready {});

        let mut tick = time::interval(WATCHDOG_INTERVAL);
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => break,
                },
                msg = control.recv() => match msg {
                    Some(EngineControl::Wake) => self.on_wake().await,
                    Some(EngineControl::Command(command)) => self.on_command(command).await,
                    Some(EngineControl::ExitDialog) => self.session.request_exit(),
                    Some(EngineControl::Shutdown) | None => break,
                },
                event = transport_rx.recv() => {
                    if let Some(event) = event {
                        self.on_transport_event(event).await;
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
        }

        match self.wake.current() {
            WakeState::Dialog => self.end_session("shutdown").await,
            WakeState::ListeningCommand => self.close_command_window("shutdown"),
            _ => {}
        }
        self.wake.stop();
        info!("Dialog engine stopped");
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Build the HTTP fallback service and its upload worker.
    fn start_batch_service(&mut self) {
        let Some(url) = self.cfg.chat_url.clone() else {
            debug!("No dialog service configured");
            return;
        };
        let device_id = self.cfg.device_id.clone().unwrap_or_default();
        match HttpChat::new(&url, &device_id, &self.cfg.http, &self.cfg.playback) {
            Ok(chat) => {
                let (tx, rx) = mpsc::channel(UTTERANCE_QUEUE_DEPTH);
                tokio::spawn(run_upload_worker(
                    rx,
                    chat.clone(),
                    self.cfg.http.use_pcm_stream,
                    self.player.clone(),
                    self.session.clone(),
                    self.host.clone(),
                    self.started,
                ));
                self.upload_tx = Some(tx);
                self.service = Some(DialogService::Batch(chat));
            }
            Err(e) => warn!("Dialog service setup failed: {}", e),
        }
    }

    /// Per-frame path. Guards run in a fixed order; any skip still
    /// refreshes the session keep-alive so a long reply cannot time the
    /// session out.
    async fn on_frame(&mut self, frame: AudioFrame) {
        if self.wake.current() != WakeState::Dialog || !self.session.is_active() {
            return;
        }
        let now = self.now_ms();

        // Window after a local command: the device must not transcribe
        // its own confirmation or the tail of the command phrase.
        if self.session.input_suppressed(now) {
            self.session.touch(now);
            return;
        }
        // Single-turn policy: while a reply is pending, new speech waits.
        if self.session.is_turn_busy() {
            self.session.touch(now);
            return;
        }
        // Echo avoidance: the device is speaking.
        if !self.player.is_idle() {
            self.session.touch(now);
            return;
        }
        // Streaming only: a new utterance needs a service that can open a
        // listen session right now.
        if let Some(service) = &self.service {
            if !self.segmenter.is_active() && !service.accepts_new_turn() {
                self.session.touch(now);
                return;
            }
        }

        let result = self.segmenter.push_frame(&frame.pcm, frame.vad_speech);
        if result.speech {
            self.session.touch(now);
        }
        for event in result.events {
            self.on_segment_event(event).await;
        }
    }

    async fn on_segment_event(&mut self, event: SegmentEvent) {
        match event {
            SegmentEvent::Started => {
                if let Some(DialogService::Streaming(ws)) = &self.service {
                    if let Err(e) = ws.start_listening().await {
                        warn!("Failed to open listen session: {}", e);
                        self.segmenter.abort_current();
                    }
                }
            }
            SegmentEvent::Audio { pcm } => {
                if let Some(DialogService::Streaming(ws)) = &self.service {
                    match ws.send_audio(wav::pcm_to_bytes(&pcm)) {
                        Ok(()) => {}
                        Err(Error::QueueFull(_)) => {
                            debug!("Outbound audio queue full, frame dropped")
                        }
                        Err(e) => {
                            warn!("Audio send failed: {}", e);
                            self.segmenter.abort_current();
                        }
                    }
                }
            }
            SegmentEvent::Finalized(utterance) => self.dispatch_utterance(utterance).await,
            SegmentEvent::Cancelled => {}
        }
    }

    async fn dispatch_utterance(&mut self, utterance: Utterance) {
        if utterance.dropped {
            debug!("Discarding pre-empted utterance");
            return;
        }
        let now = self.now_ms();
        match &self.service {
            Some(DialogService::Streaming(ws)) => {
                if let Err(e) = ws.stop_listening().await {
                    warn!("Failed to close listen session: {}", e);
                    return;
                }
                if self.session.try_begin_turn() {
                    self.turn = Some(TurnWatch {
                        started_ms: now,
                        tts_active: false,
                        tts_stopped: false,
                    });
                    self.session.touch(now);
                }
            }
            Some(DialogService::Batch(_)) => {
                let Some(tx) = &self.upload_tx else { return };
                match tx.try_send(utterance) {
                    Ok(()) => {
                        if self.session.try_begin_turn() {
                            self.session.touch(now);
                        }
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Utterance queue full, dropping")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!("Upload worker gone, dropping utterance")
                    }
                }
            }
            None => {}
        }
    }

    async fn on_wake(&mut self) {
        if !self.wake.wake_detected() {
            debug!(state = %self.wake.current(), "Wake ignored");
            return;
        }
        info!("Wake event accepted");
        self.detector.set_enabled(false);
        self.detector.flush();
        let _ = self.host.send(HostEvent::Wake {});
        self.actions.post_wake();
        if let Err(e) = self.player.play_asset(assets::WAKE_CHIME).await {
            warn!("Wake chime failed: {}", e);
        }

        if self.cfg.dialog.enabled && self.cfg.has_dialog_service() {
            if self.open_session().await {
                return;
            }
            warn!("Dialog service unavailable, running the command window instead");
        }

        self.wake.enter_command_window();
        self.command_deadline_ms = Some(self.now_ms() + self.cfg.dialog.command_timeout_ms);
        info!(timeout_ms = self.cfg.dialog.command_timeout_ms, "Command window open");
        let _ = self.host.send(HostEvent::SessionStart {
            mode: "command".to_string(),
        });
    }

    /// Open a dialog session, connecting the streaming service first when
    /// one is configured. Returns false if no service could be reached.
    async fn open_session(&mut self) -> bool {
        if self.streaming {
            match self.connect_with_backoff().await {
                Some(client) => self.service = Some(DialogService::Streaming(client)),
                None => return false,
            }
        }
        if self.service.is_none() {
            return false;
        }

        self.wake.enter_dialog();
        let now = self.now_ms();
        self.session.begin(now);
        self.segmenter.abort_current();
        self.turn = None;
        info!(
            timeout_ms = self.cfg.dialog.session_timeout_ms,
            "Dialog session started"
        );
        let _ = self.host.send(HostEvent::SessionStart {
            mode: "dialog".to_string(),
        });
        true
    }

    async fn connect_with_backoff(&mut self) -> Option<WsClient> {
        let url = self.cfg.ws_url.clone()?;
        let device_id = self.cfg.device_id.clone().unwrap_or_default();
        let mut delay = Duration::from_millis(self.cfg.connect.backoff_initial_ms);
        for attempt in 1..=CONNECT_ATTEMPTS {
            match WsClient::connect(
                &url,
                &device_id,
                &self.client_id,
                self.cfg.sample_rate_hz,
                &self.cfg.connect,
                self.transport_tx.clone(),
            )
            .await
            {
                Ok(client) => return Some(client),
                Err(e) => {
                    warn!(attempt, "Dialog service connect failed: {}", e);
                    if attempt < CONNECT_ATTEMPTS {
                        time::sleep(delay).await;
                        delay =
                            (delay * 2).min(Duration::from_millis(self.cfg.connect.backoff_max_ms));
                    }
                }
            }
        }
        None
    }

    async fn on_command(&mut self, command: Command) {
        info!(command = %command, "Local command");
        let now = self.now_ms();
        match self.wake.current() {
            WakeState::Dialog if self.session.is_active() => {
                // Cancel whatever the cloud pipeline was doing with this
                // speech; the command owns it.
                let had_open_utterance = self.segmenter.abort_current();
                if had_open_utterance || self.session.is_turn_busy() {
                    if let Some(DialogService::Streaming(ws)) = &self.service {
                        if let Err(e) = ws.send_abort().await {
                            debug!("Abort send failed: {}", e);
                        }
                    }
                }
                self.turn = None;
                self.session.end_turn();
                self.session
                    .suppress_input_for(now, self.cfg.dialog.command_ignore_ms);
                self.session.touch(now);
            }
            WakeState::ListeningCommand => self.close_command_window("matched"),
            _ => {}
        }
        self.actions.post_command(command);
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let now = self.now_ms();
        match event {
            TransportEvent::Stt { text } => {
                self.session.touch(now);
                let _ = self.host.send(HostEvent::Stt { text });
            }
            TransportEvent::TtsStart => {
                if let Some(turn) = &mut self.turn {
                    turn.tts_active = true;
                }
                self.session.touch(now);
                let _ = self.host.send(HostEvent::TtsState {
                    state: "start".to_string(),
                });
                let rate = match &self.service {
                    Some(DialogService::Streaming(ws)) => ws.server_sample_rate(),
                    _ => self.cfg.sample_rate_hz,
                };
                if let Err(e) = self
                    .player
                    .pcm_stream_begin(rate, self.cfg.playback.prebuffer_ms)
                    .await
                {
                    warn!("Failed to open reply stream: {}", e);
                }
            }
            TransportEvent::TtsAudio(bytes) => {
                let samples = wav::bytes_to_pcm(&bytes);
                let timeout = Duration::from_millis(self.cfg.playback.stream_write_timeout_ms);
                if let Err(e) = self.player.pcm_stream_write(&samples, timeout).await {
                    warn!("Reply stream write failed: {}", e);
                }
            }
            TransportEvent::TtsStop => {
                self.player.pcm_stream_end();
                if let Some(turn) = &mut self.turn {
                    turn.tts_stopped = true;
                }
                self.session.touch(now);
                let _ = self.host.send(HostEvent::TtsState {
                    state: "stop".to_string(),
                });
            }
            TransportEvent::Disconnected => {
                if self.session.is_active() {
                    warn!("Dialog service connection lost");
                    if let Some(turn) = &self.turn {
                        if turn.tts_active && !turn.tts_stopped {
                            self.player.pcm_stream_end();
                        }
                    }
                    self.end_session("disconnected").await;
                } else {
                    debug!("Stale disconnect event");
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = self.now_ms();
        match self.wake.current() {
            WakeState::Dialog => {
                if !self.session.is_active() {
                    return;
                }
                if self.session.take_exit_request() {
                    self.end_session("exit_requested").await;
                    return;
                }
                if self.session.idle_for(now) > self.cfg.dialog.session_timeout_ms {
                    self.end_session("timeout").await;
                    return;
                }
                self.settle_turn(now);
            }
            WakeState::ListeningCommand => {
                if let Some(deadline) = self.command_deadline_ms {
                    if now >= deadline {
                        self.close_command_window("timeout");
                    }
                }
            }
            _ => {}
        }
    }

    /// Release a streaming turn once the reply finished playing, or give
    /// up on a response that never came.
    fn settle_turn(&mut self, now: u64) {
        let Some(turn) = &self.turn else { return };
        if !self.session.is_turn_busy() {
            self.turn = None;
            return;
        }
        if turn.tts_stopped && self.player.is_idle() {
            debug!("Turn complete");
            self.turn = None;
            self.session.end_turn();
            self.session.touch(now);
            return;
        }
        if !turn.tts_active && now.saturating_sub(turn.started_ms) > self.cfg.dialog.stt_timeout_ms
        {
            warn!("No assistant response, releasing the turn");
            if let Some(DialogService::Streaming(ws)) = &self.service {
                ws.recover_to_connected();
            }
            self.turn = None;
            self.session.end_turn();
            self.session.touch(now);
        }
    }

    async fn end_session(&mut self, reason: &str) {
        if !self.wake.end_session() {
            return;
        }
        self.session.end();
        self.segmenter.abort_current();
        self.turn = None;
        if self.streaming {
            if let Some(DialogService::Streaming(ws)) = self.service.take() {
                ws.close().await;
            }
        }
        self.detector.set_enabled(true);
        self.detector.flush();
        info!(reason, "Dialog session ended");
        let _ = self.host.send(HostEvent::SessionEnd {
            reason: reason.to_string(),
        });
    }

    fn close_command_window(&mut self, reason: &str) {
        if !self.wake.end_command_window() {
            return;
        }
        self.command_deadline_ms = None;
        self.detector.set_enabled(true);
        self.detector.flush();
        info!(reason, "Command window closed");
        let _ = self.host.send(HostEvent::SessionEnd {
            reason: reason.to_string(),
        });
    }
}

/// Batch-mode turn worker: upload the utterance, play the reply, wait for
/// playout, release the turn gate. Keep-alive touches run through every
/// wait so the session survives long replies.
async fn run_upload_worker(
    mut utterances: mpsc::Receiver<Utterance>,
    chat: HttpChat,
    use_pcm_stream: bool,
    player: Player,
    session: Arc<DialogSession>,
    host: mpsc::UnboundedSender<HostEvent>,
    started: Instant,
) {
    while let Some(utterance) = utterances.recv().await {
        let wav_body = wav::encode_wav(&utterance.pcm, utterance.sample_rate);
        info!(
            bytes = wav_body.len(),
            speech_ms = utterance.speech_ms,
            "Uploading utterance"
        );
        session.touch(elapsed_ms(started));

        let result = if use_pcm_stream {
            chat.chat_pcm_stream(wav_body, &player).await
        } else {
            match chat.chat_wav(wav_body).await {
                Ok(reply) => match wav::decode_wav(&reply) {
                    Ok((rate, pcm)) => player.play_owned(pcm, rate).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                let deadline = Instant::now() + PLAYOUT_CEILING;
                while !player.is_idle() && Instant::now() < deadline {
                    session.touch(elapsed_ms(started));
                    time::sleep(PLAYOUT_POLL).await;
                }
            }
            Err(e) => {
                warn!("Dialog turn failed: {}", e);
                let _ = host.send(HostEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        session.end_turn();
    }
    debug!("Upload worker stopped");
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
