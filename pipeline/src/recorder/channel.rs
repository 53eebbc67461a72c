use platewatch_common::frame::Frame;
use tokio::sync::mpsc;

use super::RecorderError;
use crate::detect::Detection;

/// Everything one recorder call received.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub source: String,
    pub detection: Detection,
    pub original: Frame,
    pub filtered: Frame,
}

/// Hands detections to in-process code over an unbounded channel.
pub struct ChannelRecorder {
    name: String,
    tx: mpsc::UnboundedSender<RecordedEvent>,
}

impl ChannelRecorder {
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<RecordedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(
        &self,
        detection: &Detection,
        source: &str,
        original: &Frame,
        filtered: &Frame,
    ) -> Result<(), RecorderError> {
        self.tx
            .send(RecordedEvent {
                source: source.to_string(),
                detection: detection.clone(),
                original: original.clone(),
                filtered: filtered.clone(),
            })
            .map_err(|_| RecorderError::Closed)
    }
}
