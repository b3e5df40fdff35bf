//! Command-line voice call client.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] (defaults on first run), apply CLI overrides.
//! 3. `call`: open the speaker and microphone, start the call, and print
//!    transcript lines until the call ends or Ctrl-C is pressed.
//!    `probe`: open a socket, perform the handshake and report the latency.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;

use voice_call::audio::{AudioOutput, CpalMicrophone, CpalSpeaker, MicrophoneSource};
use voice_call::config::{AppConfig, Environment};
use voice_call::session::{CallController, CallError, CallEvent};
use voice_call::transport::{Envelope, TransportChannel, TransportEvent, TransportEventKind};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "voice-call", version, about = "Talk to a voice agent over WebSocket")]
struct Cli {
    /// Settings file (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured environment.
    #[arg(long, global = true, value_enum)]
    env: Option<EnvArg>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a call (default).
    Call {
        /// ISO-639-1 conversation language.
        #[arg(long)]
        language: Option<String>,
    },
    /// Check that the service answers the handshake, without audio.
    Probe,
}

#[derive(Clone, Copy, ValueEnum)]
enum EnvArg {
    Production,
    Local,
}

impl From<EnvArg> for Environment {
    fn from(arg: EnvArg) -> Self {
        match arg {
            EnvArg::Production => Environment::Production,
            EnvArg::Local => Environment::Local,
        }
    }
}

// ---------------------------------------------------------------------------
// call
// ---------------------------------------------------------------------------

async fn run_call(config: AppConfig, language: Option<String>) -> Result<()> {
    let speaker = CpalSpeaker::open(config.playback.device.as_deref())
        .context("opening the output device")?;
    let output: Arc<dyn AudioOutput> = Arc::new(speaker);
    let microphone: Arc<dyn MicrophoneSource> = Arc::new(CpalMicrophone::new());

    let (controller, mut events) = CallController::build(&config, microphone, output);

    // Events emitted during the start are printed by the loop below.
    let starter = controller.clone();
    let mut start = tokio::spawn(async move { starter.start_call(language.as_deref()).await });
    let mut start_done = false;
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                log::info!("interrupted, hanging up");
                interrupted = true;
                controller.end_call();
            }
            result = &mut start, if !start_done => {
                start_done = true;
                match result? {
                    Ok(()) | Err(CallError::Cancelled) => {}
                    Err(e) => {
                        while let Ok(event) = events.try_recv() {
                            print_event(&event);
                        }
                        return Err(e.into());
                    }
                }
            }
            event = events.recv() => match event {
                Some(CallEvent::ConversationEnd) | None => break,
                Some(event) => print_event(&event),
            },
        }
    }

    println!("-- call ended");
    Ok(())
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged(state) => log::info!("call: {}", state.label()),
        CallEvent::ConversationStart { conversation_id } => match conversation_id {
            Some(id) => println!("-- connected (conversation {id}); press Ctrl-C to hang up"),
            None => println!("-- connected; press Ctrl-C to hang up"),
        },
        CallEvent::Message {
            text,
            is_user,
            timestamp,
        } => {
            let who = if *is_user { "you" } else { "agent" };
            println!("[{}] {who}: {text}", timestamp.format("%H:%M:%S"));
        }
        CallEvent::Error { message } => eprintln!("!! {message}"),
        CallEvent::ConversationEnd => println!("-- call ended"),
    }
}

// ---------------------------------------------------------------------------
// probe
// ---------------------------------------------------------------------------

async fn run_probe(config: AppConfig) -> Result<()> {
    let transport = TransportChannel::new(&config.transport);
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    transport.on(TransportEventKind::Message, move |event| {
        if let TransportEvent::Message(envelope) = event {
            let _ = tx.send(envelope.clone());
        }
    });

    let started = Instant::now();
    transport.connect().await.context("connecting")?;
    println!("socket open after {:?}", started.elapsed());

    let session = &config.session;
    transport.send(&Envelope::begin(
        session.begin_message,
        &session.context,
        &session.language,
    ))?;

    let limit = Duration::from_millis(session.handshake_timeout_ms);
    let reply = tokio::time::timeout(limit, async {
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::ElevenlabsConnected { conversation_id } => return Ok(conversation_id),
                Envelope::Error { message } => return Err(message),
                _ => {}
            }
        }
        Err("connection closed".to_string())
    })
    .await;

    let outcome = match reply {
        Ok(Ok(conversation_id)) => {
            println!(
                "service ready after {:?} (conversation {})",
                started.elapsed(),
                conversation_id.as_deref().unwrap_or("-")
            );
            let _ = transport.send(&Envelope::EndConversation);
            Ok(())
        }
        Ok(Err(message)) => Err(anyhow::anyhow!("service rejected the session: {message}")),
        Err(_) => Err(anyhow::anyhow!("no ready reply within {limit:?}")),
    };
    transport.disconnect();
    outcome
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load().unwrap_or_else(|e| {
            log::warn!("Failed to load config ({e}); using defaults");
            AppConfig::default()
        }),
    };
    if let Some(env) = cli.env {
        config.transport.environment = env.into();
    }

    match cli.command.unwrap_or(Command::Call { language: None }) {
        Command::Call { language } => run_call(config, language).await,
        Command::Probe => run_probe(config).await,
    }
}
