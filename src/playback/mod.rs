//! Playback buffer manager.
//!
//! One owner for everything the speaker plays: embedded WAV assets,
//! whole reply buffers handed over by the dialog engine, and the live
//! PCM stream fed by streaming replies. A dedicated thread owns the
//! output device and drains whichever source is active, so the handle
//! stays cheap; callers that must wait (source switches, ring
//! backpressure) wait on bounded polls.
//!
//! Ownership rule: a buffer passed to [`Player::play_owned`] is consumed
//! by the call and released by the player exactly once, whether it plays
//! out, is pre-empted, or never makes it to the thread.

mod output;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::audio::ring_buffer::{audio_ring_buffer, AudioConsumer, AudioProducer};
use crate::audio::wav;
use crate::config::PlaybackConfig;
use crate::error::{Error, Result};
use output::{OutputBackend, CHUNK_SAMPLES, MAX_QUEUED_CHUNKS};

/// Poll step while waiting for the player to reach idle.
const IDLE_POLL: Duration = Duration::from_millis(20);
/// Poll step for ring writers and the drain loop.
const DRAIN_POLL: Duration = Duration::from_millis(10);
/// Hard cap on holding playback for the prebuffer to fill.
const PREBUFFER_CAP: Duration = Duration::from_secs(2);

/// Stream ring sizing in samples: about a second of mono audio, clamped.
fn stream_capacity(sample_rate: u32) -> usize {
    (sample_rate as usize).clamp(16_384, 49_152)
}

/// What the playback thread is doing, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    Idle = 0,
    Playing = 1,
    Paused = 2,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Playing,
            2 => PlaybackState::Paused,
            _ => PlaybackState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

type StateObserver = Arc<dyn Fn(PlaybackState) + Send + Sync>;

enum PlayerCmd {
    Play(PlaySource),
    Stop,
    Pause,
    Resume,
    Shutdown,
}

/// What to play next. `Owned` buffers are freed by the player.
enum PlaySource {
    Asset(&'static [u8]),
    Owned {
        pcm: Vec<i16>,
        sample_rate: u32,
    },
    Stream {
        consumer: AudioConsumer,
        sample_rate: u32,
        prebuffer_samples: usize,
    },
}

struct Shared {
    state: AtomicU8,
    /// Writer side of the live stream ring; `None` whenever no stream is
    /// open.
    producer: Mutex<Option<AudioProducer>>,
    /// Tells the drain loop the stream is complete or being torn down.
    stream_stop: AtomicBool,
    observer: Mutex<Option<StateObserver>>,
    buffers_taken: AtomicU64,
    buffers_released: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Idle as u8),
            producer: Mutex::new(None),
            stream_stop: AtomicBool::new(false),
            observer: Mutex::new(None),
            buffers_taken: AtomicU64::new(0),
            buffers_released: AtomicU64::new(0),
        }
    }

    fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, next: PlaybackState) {
        let prev = self.state.swap(next as u8, Ordering::SeqCst);
        if prev == next as u8 {
            return;
        }
        let observer = self.observer.lock().ok().and_then(|slot| slot.as_ref().cloned());
        if let Some(observer) = observer {
            observer(next);
        }
    }

    fn count_release(&self) {
        self.buffers_released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Cloneable handle to the playback thread.
#[derive(Clone)]
pub struct Player {
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<PlayerCmd>,
    wait_idle_timeout: Duration,
}

impl Player {
    /// Start the playback thread on the default output device.
    pub fn spawn(cfg: &PlaybackConfig) -> Result<Self> {
        Self::spawn_inner(cfg, true)
    }

    /// Start a playback thread with no output device. Timing behaves the
    /// same; nothing is audible. For tests and headless setups.
    pub fn spawn_null(cfg: &PlaybackConfig) -> Result<Self> {
        Self::spawn_inner(cfg, false)
    }

    fn spawn_inner(cfg: &PlaybackConfig, use_device: bool) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let shared = Arc::new(Shared::new());
        let thread_shared = Arc::clone(&shared);

        thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                // the device must be opened on the thread that owns it
                let backend = if use_device {
                    OutputBackend::rodio()
                } else {
                    Ok(OutputBackend::null())
                };
                match backend {
                    Ok(backend) => {
                        let _ = ready_tx.send(Ok(()));
                        run_player(cmd_rx, thread_shared, backend);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| Error::AudioDevice(format!("spawning playback thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| Error::AudioDevice("playback thread died during startup".into()))??;

        Ok(Self {
            shared,
            cmd_tx,
            wait_idle_timeout: Duration::from_millis(cfg.wait_idle_timeout_ms),
        })
    }

    /// Register the observer invoked on every state change.
    pub fn set_observer(&self, observer: impl Fn(PlaybackState) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.shared.observer.lock() {
            *slot = Some(Arc::new(observer));
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == PlaybackState::Idle
    }

    /// Owned buffers accepted so far.
    pub fn buffers_taken(&self) -> u64 {
        self.shared.buffers_taken.load(Ordering::SeqCst)
    }

    /// Owned buffers released so far (played out, pre-empted, or refused).
    pub fn buffers_released(&self) -> u64 {
        self.shared.buffers_released.load(Ordering::SeqCst)
    }

    /// Wait until the player reports idle. False on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
        true
    }

    /// Stop whatever is playing. Non-blocking; the thread releases the
    /// active source and reports idle on its own.
    pub fn stop(&self) {
        self.shared.stream_stop.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(PlayerCmd::Stop);
    }

    pub fn pause(&self) {
        let _ = self.cmd_tx.send(PlayerCmd::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.send(PlayerCmd::Resume);
    }

    /// Stop playback and end the playback thread.
    pub fn shutdown(&self) {
        self.shared.stream_stop.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(PlayerCmd::Shutdown);
    }

    /// Play a compiled-in WAV asset, pre-empting the active source.
    pub async fn play_asset(&self, wav_bytes: &'static [u8]) -> Result<()> {
        self.preempt().await?;
        self.send(PlayerCmd::Play(PlaySource::Asset(wav_bytes)))
    }

    /// Take ownership of a decoded reply buffer and play it.
    ///
    /// The buffer is consumed unconditionally: when the active source
    /// will not yield within the configured window, the incoming buffer
    /// is dropped, counted, and `Timeout` returned.
    pub async fn play_owned(&self, pcm: Vec<i16>, sample_rate: u32) -> Result<()> {
        self.shared.buffers_taken.fetch_add(1, Ordering::SeqCst);
        if pcm.is_empty() {
            self.shared.count_release();
            return Err(Error::AudioFormat("empty reply buffer".into()));
        }
        if let Err(e) = self.preempt().await {
            self.shared.count_release();
            return Err(e);
        }
        match self.cmd_tx.send(PlayerCmd::Play(PlaySource::Owned {
            pcm,
            sample_rate,
        })) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.shared.count_release();
                Err(Error::Transport("playback thread is gone".into()))
            }
        }
    }

    /// Open the live PCM stream at `sample_rate`, pre-empting the active
    /// source. Playback starts once `prebuffer_ms` of audio is buffered
    /// or a hard cap elapses.
    pub async fn pcm_stream_begin(&self, sample_rate: u32, prebuffer_ms: u32) -> Result<()> {
        self.preempt().await?;

        let capacity = stream_capacity(sample_rate);
        let prebuffer_samples =
            (sample_rate as usize * prebuffer_ms as usize / 1_000).min(capacity / 2);
        let (producer, consumer) = audio_ring_buffer(Some(capacity));

        self.shared.stream_stop.store(false, Ordering::SeqCst);
        match self.shared.producer.lock() {
            Ok(mut slot) => *slot = Some(producer),
            Err(_) => return Err(Error::AudioDevice("stream slot poisoned".into())),
        }
        // callers gate capture on player state; mark busy before the
        // first byte arrives
        self.shared.set_state(PlaybackState::Playing);

        let cmd = PlayerCmd::Play(PlaySource::Stream {
            consumer,
            sample_rate,
            prebuffer_samples,
        });
        if self.cmd_tx.send(cmd).is_err() {
            if let Ok(mut slot) = self.shared.producer.lock() {
                *slot = None;
            }
            self.shared.set_state(PlaybackState::Idle);
            return Err(Error::Transport("playback thread is gone".into()));
        }
        debug!(sample_rate, prebuffer_samples, capacity, "PCM stream open");
        Ok(())
    }

    /// Push samples into the live stream, waiting for ring space up to
    /// `timeout`. `InvalidState` when no stream is open.
    pub async fn pcm_stream_write(&self, samples: &[i16], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        loop {
            {
                let mut slot = self
                    .shared
                    .producer
                    .lock()
                    .map_err(|_| Error::AudioDevice("stream slot poisoned".into()))?;
                match slot.as_mut() {
                    Some(producer) => written += producer.push_slice(&samples[written..]),
                    None => {
                        return Err(Error::InvalidState {
                            op: "pcm_stream_write",
                            state: self.state().as_str(),
                        })
                    }
                }
            }
            if written >= samples.len() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("pcm_stream_write"));
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Mark the live stream complete. Non-blocking; the thread plays out
    /// what is buffered and then reports idle. Later writes are refused.
    pub fn pcm_stream_end(&self) {
        if let Ok(mut slot) = self.shared.producer.lock() {
            *slot = None;
        }
        self.shared.stream_stop.store(true, Ordering::SeqCst);
    }

    /// Ask the active source to stop, then wait for idle.
    async fn preempt(&self) -> Result<()> {
        if !self.is_idle() {
            self.stop();
        }
        if !self.wait_idle(self.wait_idle_timeout).await {
            return Err(Error::Timeout("playback_preempt"));
        }
        Ok(())
    }

    fn send(&self, cmd: PlayerCmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::Transport("playback thread is gone".into()))
    }
}

enum SourceExit {
    Idle,
    Next(PlaySource),
    Shutdown,
}

enum Outcome {
    Finished,
    Stopped,
    Preempted(PlaySource),
    Shutdown,
}

enum ActiveSource {
    Buffer {
        pcm: Vec<i16>,
        pos: usize,
        sample_rate: u32,
        owned: bool,
    },
    Stream {
        consumer: AudioConsumer,
        sample_rate: u32,
    },
}

fn run_player(cmd_rx: mpsc::Receiver<PlayerCmd>, shared: Arc<Shared>, mut backend: OutputBackend) {
    debug!("Playback thread started");
    let mut pending: Option<PlaySource> = None;
    loop {
        let cmd = match pending.take() {
            Some(source) => PlayerCmd::Play(source),
            None => match cmd_rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            },
        };
        match cmd {
            PlayerCmd::Play(source) => {
                match play_source(&cmd_rx, &shared, &mut backend, source) {
                    SourceExit::Idle => {}
                    SourceExit::Next(source) => pending = Some(source),
                    SourceExit::Shutdown => break,
                }
            }
            // stale controls arriving between sources
            PlayerCmd::Stop | PlayerCmd::Pause | PlayerCmd::Resume => {}
            PlayerCmd::Shutdown => break,
        }
    }
    backend.stop();
    debug!("Playback thread stopped");
}

fn play_source(
    cmd_rx: &mpsc::Receiver<PlayerCmd>,
    shared: &Shared,
    backend: &mut OutputBackend,
    source: PlaySource,
) -> SourceExit {
    let mut active = match source {
        PlaySource::Asset(bytes) => match wav::decode_wav(bytes) {
            Ok((sample_rate, pcm)) => ActiveSource::Buffer {
                pcm,
                pos: 0,
                sample_rate,
                owned: false,
            },
            Err(e) => {
                warn!("Embedded asset rejected: {}", e);
                return SourceExit::Idle;
            }
        },
        PlaySource::Owned { pcm, sample_rate } => ActiveSource::Buffer {
            pcm,
            pos: 0,
            sample_rate,
            owned: true,
        },
        PlaySource::Stream {
            consumer,
            sample_rate,
            prebuffer_samples,
        } => {
            wait_prebuffer(shared, &consumer, prebuffer_samples);
            ActiveSource::Stream {
                consumer,
                sample_rate,
            }
        }
    };

    shared.set_state(PlaybackState::Playing);
    let outcome = drain(cmd_rx, shared, backend, &mut active);

    if !matches!(outcome, Outcome::Finished) {
        backend.stop();
    }
    release(shared, active);
    shared.stream_stop.store(false, Ordering::SeqCst);
    shared.set_state(PlaybackState::Idle);

    match outcome {
        Outcome::Preempted(source) => SourceExit::Next(source),
        Outcome::Shutdown => SourceExit::Shutdown,
        Outcome::Finished | Outcome::Stopped => SourceExit::Idle,
    }
}

/// Hold the first write until enough audio is queued to ride out network
/// jitter. Bounded so a stalled upstream still starts playback.
fn wait_prebuffer(shared: &Shared, consumer: &AudioConsumer, prebuffer_samples: usize) {
    let deadline = Instant::now() + PREBUFFER_CAP;
    while !shared.stream_stop.load(Ordering::SeqCst) && consumer.available() < prebuffer_samples {
        if Instant::now() >= deadline {
            debug!("Prebuffer cap reached, starting playback");
            break;
        }
        thread::sleep(DRAIN_POLL);
    }
}

fn drain(
    cmd_rx: &mpsc::Receiver<PlayerCmd>,
    shared: &Shared,
    backend: &mut OutputBackend,
    active: &mut ActiveSource,
) -> Outcome {
    let mut chunk = vec![0i16; CHUNK_SAMPLES];
    loop {
        loop {
            match cmd_rx.try_recv() {
                Ok(PlayerCmd::Stop) => return Outcome::Stopped,
                Ok(PlayerCmd::Pause) => {
                    backend.pause();
                    shared.set_state(PlaybackState::Paused);
                }
                Ok(PlayerCmd::Resume) => {
                    backend.resume();
                    shared.set_state(PlaybackState::Playing);
                }
                Ok(PlayerCmd::Play(source)) => return Outcome::Preempted(source),
                Ok(PlayerCmd::Shutdown) => return Outcome::Shutdown,
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => return Outcome::Shutdown,
            }
        }

        if shared.state() == PlaybackState::Paused {
            thread::sleep(IDLE_POLL);
            continue;
        }

        let exhausted = match active {
            ActiveSource::Buffer {
                pcm,
                pos,
                sample_rate,
                ..
            } => {
                if *pos < pcm.len() && backend.queued_chunks() < MAX_QUEUED_CHUNKS {
                    let end = (*pos + CHUNK_SAMPLES).min(pcm.len());
                    backend.write(&pcm[*pos..end], *sample_rate);
                    *pos = end;
                    continue;
                }
                *pos >= pcm.len()
            }
            ActiveSource::Stream {
                consumer,
                sample_rate,
            } => {
                if backend.queued_chunks() < MAX_QUEUED_CHUNKS {
                    let popped = consumer.pop_slice(&mut chunk);
                    if popped > 0 {
                        backend.write(&chunk[..popped], *sample_rate);
                        continue;
                    }
                }
                shared.stream_stop.load(Ordering::SeqCst) && consumer.available() == 0
            }
        };

        if exhausted && backend.is_done() {
            return Outcome::Finished;
        }
        thread::sleep(DRAIN_POLL);
    }
}

/// Drop the finished source, counting owned releases and closing the
/// stream slot.
fn release(shared: &Shared, active: ActiveSource) {
    match active {
        ActiveSource::Buffer { owned: true, .. } => shared.count_release(),
        ActiveSource::Buffer { owned: false, .. } => {}
        ActiveSource::Stream { .. } => {
            if let Ok(mut slot) = shared.producer.lock() {
                *slot = None;
            }
        }
    }
}
