//! Microphone → encoder → gated send.
//!
//! [`CapturePipeline::start`] opens the microphone and spawns a dedicated
//! `capture-encode` thread that drains chunks, encodes them, and sends each
//! frame as an `audio_chunk` envelope.  The send gate is checked per frame:
//! a frame goes out only while this run is active *and* the session reports
//! `remote_ready`.  Frames that fail the gate are dropped, never queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;

use crate::audio::{AudioChunk, DeviceError, InputStream, MicrophoneSource};
use crate::config::CaptureConfig;
use crate::session::SharedSession;
use crate::transport::{Envelope, EnvelopeSink};

use super::encoder::FrameEncoder;

/// Frame counters since the pipeline was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// One start/stop cycle: the open device plus that run's active flag.
struct Running {
    input: Box<dyn InputStream>,
    active: Arc<AtomicBool>,
}

pub struct CapturePipeline {
    source: Arc<dyn MicrophoneSource>,
    sink: Arc<dyn EnvelopeSink>,
    config: CaptureConfig,
    counters: Arc<Counters>,
    running: Mutex<Option<Running>>,
}

impl CapturePipeline {
    pub fn new(
        source: Arc<dyn MicrophoneSource>,
        sink: Arc<dyn EnvelopeSink>,
        config: &CaptureConfig,
    ) -> Self {
        Self {
            source,
            sink,
            config: config.clone(),
            counters: Arc::new(Counters::default()),
            running: Mutex::new(None),
        }
    }

    /// Acquire the microphone and begin encoding.  A no-op if already running.
    ///
    /// # Errors
    ///
    /// Returns the [`DeviceError`] from the microphone; nothing is left open.
    pub fn start(&self, session: &SharedSession) -> Result<(), DeviceError> {
        let mut running = self.running.lock();
        if running.is_some() {
            log::debug!("capture: start while already running");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<AudioChunk>();
        let input = self.source.open(&self.config, tx)?;
        let active = Arc::new(AtomicBool::new(true));

        let worker = EncodeWorker {
            rx,
            encoder: FrameEncoder::new(self.config.sample_rate, self.config.frame_samples),
            session: Arc::clone(session),
            sink: Arc::clone(&self.sink),
            active: Arc::clone(&active),
            counters: Arc::clone(&self.counters),
        };
        std::thread::Builder::new()
            .name("capture-encode".into())
            .spawn(move || worker.run())
            .map_err(|e| DeviceError::Acquisition(format!("failed to spawn encoder: {e}")))?;

        log::info!("capture: started on {}", input.device_name());
        *running = Some(Running { input, active });
        Ok(())
    }

    /// Close the gate and release the microphone.  Safe to call repeatedly.
    pub fn stop(&self) {
        let Some(run) = self.running.lock().take() else {
            log::debug!("capture: stop while not running");
            return;
        };
        run.active.store(false, Ordering::SeqCst);
        let name = run.input.device_name().to_string();
        drop(run.input);
        log::info!("capture: released {name}");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_sent: self.counters.sent.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// EncodeWorker
// ---------------------------------------------------------------------------

struct EncodeWorker {
    rx: mpsc::Receiver<AudioChunk>,
    encoder: FrameEncoder,
    session: SharedSession,
    sink: Arc<dyn EnvelopeSink>,
    active: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl EncodeWorker {
    /// Runs until the microphone side of the channel is dropped.
    fn run(self) {
        while let Ok(chunk) = self.rx.recv() {
            for frame in self.encoder.encode(&chunk) {
                self.forward(Envelope::pcm16_audio(&frame));
            }
        }
        log::debug!("capture: encoder thread finished");
    }

    /// Send one frame if the gate is open.  The session lock is held through
    /// the send so no transition can slip between the check and the write.
    fn forward(&self, envelope: Envelope) {
        let session = self.session.lock();
        if !self.active.load(Ordering::SeqCst) || !session.remote_ready() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.sink.send(&envelope) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("capture: frame dropped: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
