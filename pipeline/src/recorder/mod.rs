pub mod channel;
pub mod file;
pub mod keys;
pub mod mqtt;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use platewatch_common::config::{validate_recorder, ConfigError, RecorderConfig};
use platewatch_common::frame::Frame;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::detect::Detection;
use crate::lifecycle::Lifecycle;
use crate::registry::Named;
use crate::source::Source;

pub use channel::{ChannelRecorder, RecordedEvent};
pub use file::FileRecorder;
pub use mqtt::MqttRecorder;
pub use sqlite::SqliteRecorder;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("recorder is closed")]
    Closed,
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("recorder did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Upper bound on a single recorder's `record` call during fanout.
pub const RECORD_TIMEOUT: Duration = Duration::from_secs(10);

pub enum Backend {
    Sqlite(SqliteRecorder),
    Mqtt(MqttRecorder),
    File(FileRecorder),
    Channel(ChannelRecorder),
}

/// A persistence backend for plate reads.
///
/// Each instance is started once and stopped once; `record` only succeeds
/// while it is running.
pub struct Recorder {
    backend: Backend,
    lifecycle: Lifecycle,
}

impl Recorder {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn from_config(config: &RecorderConfig, data_path: &Path) -> Result<Self, ConfigError> {
        validate_recorder(config)?;
        let backend = match config {
            RecorderConfig::Sqlite(c) => Backend::Sqlite(SqliteRecorder::new(c, data_path)),
            RecorderConfig::Mqtt(c) => Backend::Mqtt(MqttRecorder::new(c)),
            RecorderConfig::File(c) => Backend::File(FileRecorder::new(c, data_path)),
        };
        Ok(Self::new(backend))
    }

    /// An in-process recorder and the receiving end of its events.
    pub fn channel(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<RecordedEvent>) {
        let (recorder, rx) = ChannelRecorder::new(name);
        (Self::new(Backend::Channel(recorder)), rx)
    }

    pub fn kind(&self) -> &'static str {
        match self.backend {
            Backend::Sqlite(_) => "sqlite",
            Backend::Mqtt(_) => "mqtt",
            Backend::File(_) => "file",
            Backend::Channel(_) => "channel",
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Acquire the backend's resources. Returns `Ok(false)` when the
    /// instance was already started (or stopped) before.
    pub async fn start(&self) -> Result<bool, RecorderError> {
        if !self.lifecycle.begin() {
            return Ok(false);
        }
        match &self.backend {
            Backend::Sqlite(r) => r.open()?,
            Backend::Mqtt(r) => r.connect(),
            Backend::File(r) => r.start_sweeper(),
            Backend::Channel(_) => {}
        }
        info!(recorder = self.name(), kind = self.kind(), "recorder started");
        Ok(true)
    }

    /// Release the backend's resources. Returns whether this call stopped it.
    pub async fn stop(&self) -> bool {
        if !self.lifecycle.end() {
            return false;
        }
        match &self.backend {
            Backend::Sqlite(r) => r.close(),
            Backend::Mqtt(r) => r.disconnect().await,
            Backend::File(r) => r.stop_sweeper(),
            Backend::Channel(_) => {}
        }
        info!(recorder = self.name(), "recorder stopped");
        true
    }

    pub async fn record(
        &self,
        detection: &Detection,
        source: &Source,
        original: &Frame,
        filtered: &Frame,
    ) -> Result<(), RecorderError> {
        if !self.lifecycle.is_running() {
            return Err(RecorderError::Closed);
        }
        let source = source.name();
        match &self.backend {
            Backend::Sqlite(r) => r.insert(detection, source, filtered).map(|_| ()),
            Backend::Mqtt(r) => r.publish(detection, source, filtered.jpeg()),
            Backend::File(r) => r.write(detection, source, original, filtered).await.map(|_| ()),
            Backend::Channel(r) => r.send(detection, source, original, filtered),
        }
    }
}

impl Named for Recorder {
    fn name(&self) -> &str {
        match &self.backend {
            Backend::Sqlite(r) => r.name(),
            Backend::Mqtt(r) => r.name(),
            Backend::File(r) => r.name(),
            Backend::Channel(r) => r.name(),
        }
    }
}

/// Outcome of delivering one detection to every recorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Deliver to each recorder in order. A failing or stalled recorder is
/// logged and skipped; the rest still receive the detection.
pub async fn fanout(
    recorders: &[Arc<Recorder>],
    detection: &Detection,
    source: &Source,
    original: &Frame,
    filtered: &Frame,
) -> FanoutReport {
    let mut report = FanoutReport::default();
    for recorder in recorders {
        let outcome = tokio::time::timeout(RECORD_TIMEOUT, recorder.record(detection, source, original, filtered))
            .await
            .unwrap_or(Err(RecorderError::TimedOut(RECORD_TIMEOUT)));
        match outcome {
            Ok(()) => {
                debug!(recorder = recorder.name(), source = source.name(), "recorded");
                report.delivered += 1;
            }
            Err(e) => {
                error!(
                    recorder = recorder.name(),
                    source = source.name(),
                    error = %e,
                    "recorder failed"
                );
                report.failed += 1;
            }
        }
    }
    report
}
