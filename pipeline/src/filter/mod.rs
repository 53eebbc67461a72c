pub mod mask;
pub mod motion;
pub mod vision;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use platewatch_common::config::{ConfigError, FilterConfig};
use platewatch_common::frame::{Frame, FrameError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::Named;

pub use mask::MaskFilter;
pub use motion::{MotionDetector, MotionFilter};

/// A frame filter. Filters mutate the frame in place; clearing it drops the
/// frame from the pipeline.
pub enum Filter {
    Motion(MotionFilter),
    Mask(MaskFilter),
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl Filter {
    pub fn from_config(config: &FilterConfig, data_path: &Path) -> Result<Self, ConfigError> {
        Ok(match config {
            FilterConfig::Motion(c) => Filter::Motion(MotionFilter::new(c, data_path)),
            FilterConfig::Mask(c) => Filter::Mask(MaskFilter::new(c, data_path)?),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Filter::Motion(_) => "motion",
            Filter::Mask(_) => "mask",
        }
    }

    pub async fn apply(&self, frame: &mut Frame) -> Result<(), FilterError> {
        match self {
            Filter::Motion(f) => f.apply(frame).await,
            Filter::Mask(f) => f.apply(frame),
        }
    }
}

impl Named for Filter {
    fn name(&self) -> &str {
        match self {
            Filter::Motion(f) => f.name(),
            Filter::Mask(f) => f.name(),
        }
    }
}

/// Run `filters` over `frame` in order, stopping as soon as one clears it.
///
/// Stateless filters never yield, so concurrent frames reach the first
/// stateful filter's queue in the order their chains were first polled.
pub async fn run_chain(filters: &[Arc<Filter>], frame: &mut Frame) -> Result<(), FilterError> {
    for filter in filters {
        if frame.is_empty() {
            break;
        }
        filter.apply(frame).await?;
        if frame.is_empty() {
            debug!(filter = filter.name(), "frame dropped");
        }
    }
    Ok(())
}

/// Where a filter writes the last frame it let through.
pub struct DebugSnapshot {
    path: PathBuf,
}

impl DebugSnapshot {
    pub fn new(data_path: &Path, filter_name: &str) -> Self {
        Self {
            path: data_path.join("debug").join(format!("{filter_name}.jpg")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `frame` in the background. Best effort; failures are logged
    /// and otherwise ignored.
    pub fn save(&self, frame: &Frame) -> JoinHandle<()> {
        let path = self.path.clone();
        let jpeg = frame.jpeg().clone();
        tokio::spawn(async move {
            if let Some(dir) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(dir).await {
                    warn!(path = %dir.display(), error = %e, "failed to create debug directory");
                    return;
                }
            }
            if let Err(e) = tokio::fs::write(&path, &jpeg).await {
                warn!(path = %path.display(), error = %e, "failed to write debug snapshot");
            }
        })
    }
}
