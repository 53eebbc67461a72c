use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use platewatch_common::config::FileRecorderConfig;
use platewatch_common::frame::Frame;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::keys;
use super::RecorderError;
use crate::detect::Detection;

/// How often the retention sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Writes one JPEG per plate read to a templated path.
///
/// Every written file is appended to a log next to the data directory;
/// the retention sweep walks that log instead of the file tree, so files
/// the recorder did not write are never touched.
pub struct FileRecorder {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    name: String,
    pattern: String,
    retain_days: u32,
    use_filtered: bool,
    log_path: PathBuf,
    log_lock: tokio::sync::Mutex<()>,
}

impl FileRecorder {
    pub fn new(config: &FileRecorderConfig, data_path: &Path) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                pattern: config.pattern.clone(),
                retain_days: config.retain_days,
                use_filtered: config.use_filtered,
                log_path: data_path.join(format!("file_recorder_{}.log", config.name)),
                log_lock: tokio::sync::Mutex::new(()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn log_path(&self) -> &Path {
        &self.inner.log_path
    }

    /// Start the periodic retention sweep. A recorder that keeps files
    /// forever has nothing to sweep.
    pub fn start_sweeper(&self) {
        if self.inner.retain_days == 0 {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                match inner.sweep(Utc::now().timestamp_millis()).await {
                    Ok(0) => {}
                    Ok(removed) => info!(recorder = %inner.name, removed, "retention sweep removed files"),
                    Err(e) => warn!(recorder = %inner.name, error = %e, "retention sweep failed"),
                }
            }
        });
        *self.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }

    /// Write the image once per candidate. Returns the written paths.
    pub async fn write(
        &self,
        detection: &Detection,
        source: &str,
        original: &Frame,
        filtered: &Frame,
    ) -> Result<Vec<PathBuf>, RecorderError> {
        let frame = if self.inner.use_filtered { filtered } else { original };
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        let mut written = Vec::with_capacity(detection.candidates.len());
        for candidate in &detection.candidates {
            let path = keys::image_path(
                &self.inner.pattern,
                source,
                detection.epoch_time,
                &candidate.plate,
                candidate.confidence,
            );
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(&path, frame.jpeg()).await?;
            debug!(recorder = %self.inner.name, path = %path.display(), plate = %candidate.plate, "wrote plate image");
            written.push(path);
        }
        self.inner.append_log(&written, Utc::now().timestamp_millis()).await?;
        Ok(written)
    }

    /// Remove logged files older than the retention window, as of `now_ms`.
    pub async fn sweep(&self, now_ms: i64) -> Result<usize, RecorderError> {
        self.inner.sweep(now_ms).await
    }
}

impl Inner {
    async fn append_log(&self, paths: &[PathBuf], written_ms: i64) -> Result<(), RecorderError> {
        if paths.is_empty() {
            return Ok(());
        }
        let _guard = self.log_lock.lock().await;
        if let Some(dir) = self.log_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        let mut lines = String::new();
        for path in paths {
            lines.push_str(&format!("{written_ms}\t{}\n", path.display()));
        }
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn sweep(&self, now_ms: i64) -> Result<usize, RecorderError> {
        if self.retain_days == 0 {
            return Ok(0);
        }
        let cutoff = now_ms - i64::from(self.retain_days) * MS_PER_DAY;

        let _guard = self.log_lock.lock().await;
        let log = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(log) => log,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut kept = String::with_capacity(log.len());
        let mut removed = 0;
        for line in log.lines() {
            let Some((written, path)) = parse_log_line(line) else {
                warn!(recorder = %self.name, line, "skipping malformed log line");
                continue;
            };
            if written >= cutoff {
                kept.push_str(line);
                kept.push('\n');
                continue;
            }
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(recorder = %self.name, path, error = %e, "failed to remove expired image");
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }

        let tmp = self.log_path.with_extension("log.tmp");
        tokio::fs::write(&tmp, kept).await?;
        tokio::fs::rename(&tmp, &self.log_path).await?;
        Ok(removed)
    }
}

fn parse_log_line(line: &str) -> Option<(i64, &str)> {
    let (written, path) = line.split_once('\t')?;
    Some((written.parse().ok()?, path))
}

impl Drop for FileRecorder {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}
