//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::audio::{
    AudioChunk, AudioOutput, DeviceError, InputStream, MicrophoneSource, PlayableBuffer,
    PlaybackError,
};
use crate::config::{CaptureConfig, Environment, TransportConfig};
use crate::transport::{Envelope, EnvelopeSink, TransportError};

/// Poll `condition` every 10 ms until it holds or `limit` elapses.
pub(crate) async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Local-environment transport config pointing at `url`, with short delays.
pub(crate) fn transport_config(url: &str) -> TransportConfig {
    let mut config = TransportConfig::default();
    config.environment = Environment::Local;
    config.endpoints.local = url.to_string();
    config.connect_timeout_secs = 2;
    config.max_reconnect_attempts = 5;
    config.reconnect_base_delay_ms = 20;
    config
}

// ---------------------------------------------------------------------------
// MockServer
// ---------------------------------------------------------------------------

enum ServerCommand {
    Send(String),
    Drop,
    Close,
}

/// In-process WebSocket server that records what it receives.
pub(crate) struct MockServer {
    pub url: String,
    received: Arc<Mutex<Vec<Envelope>>>,
    accepted: Arc<AtomicUsize>,
    refuse: Arc<AtomicUsize>,
    reply_on_begin: Arc<Mutex<Option<(Duration, Envelope)>>>,
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (commands, mut command_rx) = mpsc::unbounded_channel::<ServerCommand>();

        let server = Self {
            url: format!("ws://{addr}/ws"),
            received: Arc::new(Mutex::new(Vec::new())),
            accepted: Arc::new(AtomicUsize::new(0)),
            refuse: Arc::new(AtomicUsize::new(0)),
            reply_on_begin: Arc::new(Mutex::new(None)),
            commands: commands.clone(),
        };

        let received = Arc::clone(&server.received);
        let accepted = Arc::clone(&server.accepted);
        let refuse = Arc::clone(&server.refuse);
        let reply_on_begin = Arc::clone(&server.reply_on_begin);

        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if refuse
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    drop(tcp);
                    continue;
                }
                let Ok(socket) = tokio_tungstenite::accept_async(tcp).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let (mut sink, mut stream) = socket.split();

                loop {
                    tokio::select! {
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(envelope) = Envelope::from_json(&text) else { continue };
                                let is_begin = matches!(
                                    envelope,
                                    Envelope::ConnectElevenlabs { .. } | Envelope::BeginSession { .. }
                                );
                                received.lock().push(envelope);
                                let reply = reply_on_begin.lock().clone();
                                if let (true, Some((delay, reply))) = (is_begin, reply) {
                                    let tx = commands.clone();
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        if let Ok(json) = reply.to_json() {
                                            let _ = tx.send(ServerCommand::Send(json));
                                        }
                                    });
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                        command = command_rx.recv() => match command {
                            Some(ServerCommand::Send(text)) => {
                                let _ = sink.send(Message::Text(text)).await;
                            }
                            Some(ServerCommand::Drop) => break,
                            Some(ServerCommand::Close) => {
                                let _ = sink
                                    .send(Message::Close(Some(CloseFrame {
                                        code: CloseCode::Normal,
                                        reason: "bye".into(),
                                    })))
                                    .await;
                                break;
                            }
                            None => return,
                        },
                    }
                }
            }
        });

        server
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn count_received(&self, kind: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    /// Number of completed WebSocket handshakes.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Drop the next `n` TCP connections before the WebSocket handshake.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Reply with `envelope` `delay` after every begin-session envelope.
    pub fn reply_on_begin(&self, delay: Duration, envelope: Envelope) {
        *self.reply_on_begin.lock() = Some((delay, envelope));
    }

    pub fn send(&self, envelope: Envelope) {
        let json = envelope.to_json().expect("encode");
        let _ = self.commands.send(ServerCommand::Send(json));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.commands.send(ServerCommand::Send(text.to_string()));
    }

    /// Drop the TCP connection without a close frame.
    pub fn drop_connection(&self) {
        let _ = self.commands.send(ServerCommand::Drop);
    }

    /// Close the connection with code 1000.
    pub fn close_normally(&self) {
        let _ = self.commands.send(ServerCommand::Close);
    }
}

/// 16-bit mono WAV file bytes.
pub(crate) fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
        for &s in samples {
            writer.write_sample(s).expect("write sample");
        }
        writer.finalize().expect("finalize");
    }
    cursor.into_inner()
}

pub(crate) fn ready_envelope() -> Envelope {
    Envelope::ElevenlabsConnected {
        conversation_id: Some("conv-test".into()),
    }
}

// ---------------------------------------------------------------------------
// MockMicrophone
// ---------------------------------------------------------------------------

/// Microphone double; tests push chunks through [`MockMicrophone::push`].
#[derive(Default)]
pub(crate) struct MockMicrophone {
    feed: Arc<Mutex<Option<std_mpsc::Sender<AudioChunk>>>>,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
    failure: Mutex<Option<DeviceError>>,
}

impl MockMicrophone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(error: DeviceError) -> Arc<Self> {
        let mic = Self::default();
        *mic.failure.lock() = Some(error);
        Arc::new(mic)
    }

    /// Push a 16 kHz mono chunk.  Returns `false` if the device is closed.
    pub fn push(&self, samples: Vec<f32>) -> bool {
        match self.feed.lock().as_ref() {
            Some(tx) => tx
                .send(AudioChunk {
                    samples,
                    sample_rate: 16_000,
                    channels: 1,
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.feed.lock().is_some()
    }
}

impl MicrophoneSource for MockMicrophone {
    fn open(
        &self,
        _config: &CaptureConfig,
        tx: std_mpsc::Sender<AudioChunk>,
    ) -> Result<Box<dyn InputStream>, DeviceError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        *self.feed.lock() = Some(tx);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockInput {
            feed: Arc::clone(&self.feed),
            released: Arc::clone(&self.released),
        }))
    }
}

struct MockInput {
    feed: Arc<Mutex<Option<std_mpsc::Sender<AudioChunk>>>>,
    released: Arc<AtomicUsize>,
}

impl InputStream for MockInput {
    fn device_name(&self) -> &str {
        "mock microphone"
    }
}

impl Drop for MockInput {
    fn drop(&mut self) {
        self.feed.lock().take();
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// RecordingOutput
// ---------------------------------------------------------------------------

/// Output double that "plays" each buffer for a fixed time and records
/// the order and the peak number of overlapping plays.
pub(crate) struct RecordingOutput {
    play_time: Duration,
    played: Mutex<Vec<PlayableBuffer>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingOutput {
    pub fn new(play_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            play_time,
            played: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn played(&self) -> Vec<PlayableBuffer> {
        self.played.lock().clone()
    }

    pub fn played_count(&self) -> usize {
        self.played.lock().len()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, buffer: PlayableBuffer) -> Result<(), PlaybackError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.played.lock().push(buffer);
        tokio::time::sleep(self.play_time).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl EnvelopeSink for RecordingSink {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.sent.lock().push(envelope.clone());
        Ok(())
    }
}
