//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and handed to each
//! subsystem by value.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Deployment the client talks to.  Selects which entry of
/// [`Endpoints`] the transport resolves on every connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    /// Hosted voice service.
    Production,
    /// Development server on the local machine.
    Local,
}

impl Default for Environment {
    fn default() -> Self {
        Self::Production
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Socket URL for each [`Environment`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    /// Production WebSocket URL.  Empty until configured by the user.
    pub production: String,
    /// Local development WebSocket URL.
    pub local: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            production: String::new(),
            local: "ws://127.0.0.1:3001/ws".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TransportConfig
// ---------------------------------------------------------------------------

/// Socket connection and reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Which endpoint to resolve.
    pub environment: Environment,
    /// URL per environment.
    pub endpoints: Endpoints,
    /// Seconds to wait for the socket to open before giving up.
    pub connect_timeout_secs: u64,
    /// Ceiling for automatic reconnect attempts after an unexpected close.
    pub max_reconnect_attempts: u32,
    /// Base delay; attempt `n` waits `n * reconnect_base_delay_ms`.
    pub reconnect_base_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            endpoints: Endpoints::default(),
            connect_timeout_secs: 10,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// BeginMessage
// ---------------------------------------------------------------------------

/// Which control envelope opens the remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeginMessage {
    /// `{"type":"connect_elevenlabs", ...}`
    ConnectElevenlabs,
    /// `{"type":"begin_session", ...}`
    BeginSession,
}

impl Default for BeginMessage {
    fn default() -> Self {
        Self::ConnectElevenlabs
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Parameters sent with the begin-session envelope and the handshake bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Conversation language as an ISO-639-1 code.
    pub language: String,
    /// Free-form context string forwarded to the remote agent.
    pub context: String,
    /// Control envelope used to begin the remote session.
    pub begin_message: BeginMessage,
    /// Milliseconds to wait for the remote ready reply.
    pub handshake_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language: "en".into(),
            context: String::new(),
            begin_message: BeginMessage::default(),
            handshake_timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureConfig
// ---------------------------------------------------------------------------

/// Microphone capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Wire sample rate in Hz (the remote decoder expects 16 000).
    pub sample_rate: u32,
    /// Maximum samples per outbound frame (4096 ≈ 256 ms at 16 kHz).
    pub frame_samples: usize,
    /// Input device name; `None` means the system default.
    pub device: Option<String>,
    /// Ask the platform for echo cancellation.
    pub echo_cancellation: bool,
    /// Ask the platform for noise suppression.
    pub noise_suppression: bool,
    /// Ask the platform for automatic gain control.
    pub auto_gain_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 4_096,
            device: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

// ---------------------------------------------------------------------------
// PlaybackConfig
// ---------------------------------------------------------------------------

/// Inbound audio playback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Chunks smaller than this many bytes are discarded as noise.
    pub min_chunk_bytes: usize,
    /// Upper bound for a single container-guess decode attempt.
    pub attempt_timeout_ms: u64,
    /// Sample rate assumed for headerless PCM16 chunks.
    pub pcm_sample_rate: u32,
    /// Output device name; `None` means the system default.
    pub device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            min_chunk_bytes: 100,
            attempt_timeout_ms: 2_000,
            pcm_sample_rate: 16_000,
            device: None,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_call::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Socket and reconnect policy.
    pub transport: TransportConfig,
    /// Remote session parameters.
    pub session: SessionConfig,
    /// Microphone capture settings.
    pub capture: CaptureConfig,
    /// Playback queue settings.
    pub playback: PlaybackConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// so callers never need to special-case a missing file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = AppConfig::default();
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(original.transport.environment, loaded.transport.environment);
        assert_eq!(original.transport.endpoints.local, loaded.transport.endpoints.local);
        assert_eq!(
            original.transport.max_reconnect_attempts,
            loaded.transport.max_reconnect_attempts
        );
        assert_eq!(original.session.language, loaded.session.language);
        assert_eq!(original.session.begin_message, loaded.session.begin_message);
        assert_eq!(original.capture.frame_samples, loaded.capture.frame_samples);
        assert_eq!(original.capture.device, loaded.capture.device);
        assert_eq!(original.playback.min_chunk_bytes, loaded.playback.min_chunk_bytes);
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        assert_eq!(config.transport.environment, Environment::Production);
        assert_eq!(config.session.handshake_timeout_ms, 10_000);
    }

    #[test]
    fn default_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.transport.connect_timeout_secs, 10);
        assert_eq!(cfg.transport.max_reconnect_attempts, 5);
        assert_eq!(cfg.transport.reconnect_base_delay_ms, 1_000);
        assert!(cfg.transport.endpoints.production.is_empty());
        assert_eq!(cfg.session.begin_message, BeginMessage::ConnectElevenlabs);
        assert_eq!(cfg.capture.sample_rate, 16_000);
        assert_eq!(cfg.capture.frame_samples, 4_096);
        assert!(cfg.capture.echo_cancellation);
        assert_eq!(cfg.playback.attempt_timeout_ms, 2_000);
        assert_eq!(cfg.playback.pcm_sample_rate, 16_000);
    }

    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("modified.toml");

        let mut cfg = AppConfig::default();
        cfg.transport.environment = Environment::Local;
        cfg.transport.endpoints.production = "wss://voice.internal/ws".into();
        cfg.session.language = "th".into();
        cfg.session.begin_message = BeginMessage::BeginSession;
        cfg.capture.device = Some("USB Mic".into());
        cfg.playback.min_chunk_bytes = 64;

        cfg.save_to(&path).expect("save");
        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(loaded.transport.environment, Environment::Local);
        assert_eq!(loaded.transport.endpoints.production, "wss://voice.internal/ws");
        assert_eq!(loaded.session.language, "th");
        assert_eq!(loaded.session.begin_message, BeginMessage::BeginSession);
        assert_eq!(loaded.capture.device.as_deref(), Some("USB Mic"));
        assert_eq!(loaded.playback.min_chunk_bytes, 64);
    }
}
