pub mod ffmpeg;
pub mod mjpeg;

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use platewatch_common::config::{validate_source, ConfigError, SourceConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::lifecycle::Lifecycle;
use crate::registry::Named;

pub use mjpeg::MjpegSplitter;

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Raw chunks buffered between a reader and its sink.
pub const EVENT_BUFFER: usize = 64;

/// What a running source reports to its sink.
#[derive(Debug)]
pub enum SourceEvent {
    /// Raw MJPEG bytes, in stream order. Chunk boundaries are arbitrary.
    Data(Bytes),
    /// The reader failed and will retry after a backoff.
    Failed(SourceError),
    /// The input ran out and will not be retried.
    Ended,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("stream read failed: {0}")]
    HttpStream(reqwest::Error),
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("ffmpeg exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

/// How a single read attempt ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The input ended.
    Finished,
    /// The sink went away.
    Closed,
}

/// A camera feed.
///
/// [`start`](Source::start) spawns a reader that pushes raw bytes to the
/// given sender and reconnects with exponential backoff (2 s doubling to
/// 30 s). [`stop`](Source::stop) ends the reader and drops the sender, which
/// tells the sink that no more data is coming.
pub struct Source {
    name: String,
    config: SourceConfig,
    ffmpeg_path: String,
    lifecycle: Lifecycle,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Source {
    pub fn from_config(config: &SourceConfig, ffmpeg_path: &str) -> Result<Self, ConfigError> {
        validate_source(config)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            name: config.name().to_string(),
            config: config.clone(),
            ffmpeg_path: ffmpeg_path.to_string(),
            lifecycle: Lifecycle::new(),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> &'static str {
        kind_name(&self.config)
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Begin reading into `events`. Only the first call on an instance has
    /// any effect; returns whether this call started it.
    pub fn start(&self, events: mpsc::Sender<SourceEvent>) -> bool {
        if !self.lifecycle.begin() {
            return false;
        }
        info!(source = %self.name, kind = self.kind(), "starting source");

        let reader = Reader {
            name: self.name.clone(),
            config: self.config.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
        };
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(reader.run(events, shutdown));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        true
    }

    /// Stop reading. Only the first call on a started instance has any
    /// effect; returns whether this call stopped it.
    pub fn stop(&self) -> bool {
        if !self.lifecycle.end() {
            return false;
        }
        info!(source = %self.name, "stopping source");
        self.shutdown.send_replace(true);
        true
    }

    /// Wait for the reader task to exit after [`stop`](Source::stop).
    pub async fn join(&self) {
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(source = %self.name, error = %e, "source task failed");
            }
        }
    }
}

impl Named for Source {
    fn name(&self) -> &str {
        &self.name
    }
}

struct Reader {
    name: String,
    config: SourceConfig,
    ffmpeg_path: String,
}

impl Reader {
    async fn run(self, events: mpsc::Sender<SourceEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let result = tokio::select! {
                result = self.read_once(&events) => result,
                _ = shutdown.changed() => break,
            };

            match result {
                Ok(ReadEnd::Closed) => break,
                Ok(ReadEnd::Finished) if matches!(self.config, SourceConfig::File(_)) => {
                    info!(source = %self.name, "input file finished");
                    let _ = events.send(SourceEvent::Ended).await;
                    break;
                }
                Ok(ReadEnd::Finished) => {
                    info!(source = %self.name, "stream ended cleanly, reconnecting");
                    backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    if events.send(SourceEvent::Failed(e)).await.is_err() {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        info!(source = %self.name, "source reader exited");
    }

    async fn read_once(&self, events: &mpsc::Sender<SourceEvent>) -> Result<ReadEnd, SourceError> {
        info!(source = %self.name, kind = kind_name(&self.config), "connecting");
        match &self.config {
            SourceConfig::Mjpeg(c) => mjpeg::read_stream(&c.url, events).await,
            SourceConfig::Rtsp(c) => {
                ffmpeg::read_process(
                    &self.ffmpeg_path,
                    ffmpeg::Input::Rtsp(&c.url),
                    c.capture_interval,
                    events,
                )
                .await
            }
            SourceConfig::File(c) => {
                let path = c.path.to_string_lossy();
                ffmpeg::read_process(
                    &self.ffmpeg_path,
                    ffmpeg::Input::File(&path),
                    c.capture_interval,
                    events,
                )
                .await
            }
        }
    }
}

fn kind_name(config: &SourceConfig) -> &'static str {
    match config {
        SourceConfig::Mjpeg(_) => "mjpeg",
        SourceConfig::Rtsp(_) => "rtsp",
        SourceConfig::File(_) => "file",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platewatch_common::config::{FileSourceConfig, MjpegSourceConfig};

    fn mjpeg(name: &str, url: &str) -> Source {
        let config = SourceConfig::Mjpeg(MjpegSourceConfig {
            name: name.into(),
            url: url.into(),
        });
        Source::from_config(&config, "ffmpeg").unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SourceConfig::Mjpeg(MjpegSourceConfig {
            name: "cam".into(),
            url: "ftp://cam".into(),
        });
        assert!(Source::from_config(&config, "ffmpeg").is_err());
    }

    #[tokio::test]
    async fn unreachable_camera_reports_failure() {
        let source = mjpeg("cam", "http://127.0.0.1:1/stream");
        assert_eq!(source.kind(), "mjpeg");
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);

        assert!(source.start(tx.clone()));
        assert!(!source.start(tx), "second start is ignored");

        match rx.recv().await {
            Some(SourceEvent::Failed(SourceError::HttpConnect(_))) => {}
            other => panic!("expected a connect failure, got {other:?}"),
        }

        assert!(source.stop());
        assert!(!source.stop(), "second stop is ignored");
        source.join().await;
        assert!(rx.recv().await.is_none(), "sender dropped once the reader exits");
    }

    #[tokio::test]
    async fn stopped_before_start_never_runs() {
        let source = mjpeg("cam", "http://127.0.0.1:1/stream");
        assert!(!source.stop());
        let (tx, _rx) = mpsc::channel(1);
        assert!(!source.start(tx));
        assert!(!source.is_running());
    }

    #[tokio::test]
    async fn file_source_with_missing_ffmpeg_keeps_retrying() {
        let config = SourceConfig::File(FileSourceConfig {
            name: "replay".into(),
            path: "/videos/a.mp4".into(),
            capture_interval: 1.0,
        });
        let source = Source::from_config(&config, "/nonexistent/ffmpeg").unwrap();
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        source.start(tx);
        assert!(matches!(
            rx.recv().await,
            Some(SourceEvent::Failed(SourceError::Spawn(_)))
        ));
        source.stop();
        source.join().await;
    }
}
