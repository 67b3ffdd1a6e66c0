//! Robot voice core.
//!
//! Communicates with the supervising host via JSON-line IPC on
//! stdin/stdout. This is the entry point that brings up playback, the
//! action dispatcher, audio capture, and the dialog engine, then routes
//! host commands until stdin closes or a stop arrives.

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use robot_voice_core::actions::{ActionDispatcher, Command};
use robot_voice_core::assets;
use robot_voice_core::audio::capture::{spawn_frame_pump, start_capture};
use robot_voice_core::audio::ring_buffer::audio_ring_buffer;
use robot_voice_core::config::read_config;
use robot_voice_core::dialog::{DialogSession, Engine, EngineControl, WakeStateMachine};
use robot_voice_core::ipc::bridge::{
    emit_error, emit_event, spawn_stdin_reader, HostActuators, HostDetector,
};
use robot_voice_core::ipc::{HostCommand, HostEvent};
use robot_voice_core::playback::Player;

/// Mean-abs level treated as voice activity by the capture front-end.
/// Stands in for the dedicated voice detector the robot hardware has.
const ACTIVITY_MEAN_ABS: u16 = 700;

/// Frames buffered between the capture pump and the engine.
const FRAME_CHANNEL_CAPACITY: usize = 32;

#[tokio::main]
async fn main() {
    // Initialize tracing (respects RUST_LOG env, defaults to info).
    // Logs go to stderr; stdout carries the event protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Emit starting event immediately so the host knows we're alive.
    emit_event(&HostEvent::Starting {});

    let cfg = read_config();
    info!(
        ws = cfg.ws_url.as_deref().unwrap_or("-"),
        chat = cfg.chat_url.as_deref().unwrap_or("-"),
        rate = cfg.sample_rate_hz,
        "Configuration loaded"
    );
    if !cfg.has_dialog_service() {
        warn!("No dialog service configured; wake falls back to the command window");
    }

    // Host event fan-in: every subsystem sends here, one task writes stdout.
    let (host_tx, mut host_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = host_rx.recv().await {
            emit_event(&event);
        }
    });

    let player = match Player::spawn(&cfg.playback) {
        Ok(player) => player,
        Err(e) => {
            warn!("Audio output unavailable ({}), continuing without playback", e);
            match Player::spawn_null(&cfg.playback) {
                Ok(player) => player,
                Err(e) => {
                    emit_error(&format!("playback init failed: {e}"));
                    return;
                }
            }
        }
    };
    let host_for_player = host_tx.clone();
    player.set_observer(move |state| {
        let _ = host_for_player.send(HostEvent::PlayerState {
            state: state.to_string(),
        });
    });

    let host_for_actions = host_tx.clone();
    let actions = ActionDispatcher::spawn(
        cfg.actions.clone(),
        HostActuators::new(host_tx.clone()),
        player.clone(),
        assets::CELEBRATION,
        move |command| {
            let _ = host_for_actions.send(HostEvent::Command {
                command: command.as_str().to_string(),
            });
        },
    );

    // Capture is best-effort: without a microphone the host can still
    // drive wake and commands over stdin.
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let (producer, consumer) = audio_ring_buffer(None);
    let _capture_stream = match start_capture(producer, None, cfg.sample_rate_hz) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Audio capture unavailable ({}), host-driven input only", e);
            None
        }
    };
    spawn_frame_pump(
        consumer,
        cfg.frame_samples,
        ACTIVITY_MEAN_ABS,
        frames_tx,
    );

    let engine = Engine::new(
        cfg.clone(),
        player.clone(),
        actions,
        Box::new(HostDetector::new(host_tx.clone())),
        host_tx.clone(),
    );
    let wake = engine.wake_machine();
    let session = engine.session();
    let (control_tx, control_rx) = mpsc::channel(8);
    let engine_task = tokio::spawn(engine.run(frames_rx, control_rx));

    // Main loop: route host commands until stdin closes.
    let mut commands = spawn_stdin_reader();
    loop {
        match commands.recv().await {
            Some(command) => {
                if !handle_command(command, &control_tx, &wake, &session, &player).await {
                    break;
                }
            }
            None => {
                info!("stdin closed, shutting down");
                break;
            }
        }
    }

    let _ = control_tx.send(EngineControl::Shutdown).await;
    let _ = engine_task.await;
    player.shutdown();
    info!("Voice core shut down");
}

/// Handle a single command from the host.
/// Returns `false` if the main loop should exit.
async fn handle_command(
    cmd: HostCommand,
    control: &mpsc::Sender<EngineControl>,
    wake: &WakeStateMachine,
    session: &DialogSession,
    player: &Player,
) -> bool {
    match cmd {
        HostCommand::Wake {} => {
            let _ = control.send(EngineControl::Wake).await;
        }

        HostCommand::Command { id, text } => {
            let command = id
                .and_then(Command::from_id)
                .or_else(|| text.as_deref().and_then(Command::parse));
            match command {
                Some(command) => {
                    let _ = control.send(EngineControl::Command(command)).await;
                }
                None => emit_error("unrecognized command"),
            }
        }

        HostCommand::ExitDialog {} => {
            let _ = control.send(EngineControl::ExitDialog).await;
        }

        HostCommand::Status {} => {
            emit_event(&HostEvent::Status {
                state: wake.current().to_string(),
                session_active: session.is_active(),
                turn_busy: session.is_turn_busy(),
                player: player.state().to_string(),
            });
        }

        HostCommand::Stop {} => {
            emit_event(&HostEvent::Stopping {});
            return false;
        }
    }

    true
}
