use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use platewatch_common::config::{Config, ConfigError, FilterConfig, RecorderConfig, SourceConfig};
use platewatch_common::frame::{Frame, FrameError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::detect::{DetectError, DetectionClient};
use crate::filter::{self, Filter, FilterError};
use crate::recorder::{fanout, FanoutReport, Recorder};
use crate::registry::{Named, Registry, RegistryEvent};
use crate::source::{MjpegSplitter, Source, SourceEvent, EVENT_BUFFER};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("a {kind} named {name:?} is already registered")]
    Duplicate { kind: &'static str, name: String },
}

/// What happened to one ingested frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A filter dropped it.
    Discarded,
    /// The recognition service found no plate.
    NoResults,
    /// Plates were found and handed to the recorders.
    Recorded(FanoutReport),
    /// Decoding, filtering or recognition failed; the frame was dropped.
    Failed,
}

/// Shared pipeline state: the three registries and the recognition client.
pub struct Pipeline {
    pub sources: Registry<Source>,
    pub filters: Registry<Filter>,
    pub recorders: Registry<Recorder>,
    detector: DetectionClient,
    data_path: PathBuf,
    ffmpeg_path: String,
    sinks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Run one JPEG buffer through filters, recognition and recorders.
    ///
    /// Never fails: any error is logged with the source name and the frame
    /// is dropped.
    pub async fn next(&self, buffer: Bytes, source: &Source) -> FrameOutcome {
        match self.process(buffer, source).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(source = source.name(), error = %e, "frame processing failed");
                FrameOutcome::Failed
            }
        }
    }

    async fn process(&self, buffer: Bytes, source: &Source) -> Result<FrameOutcome, PipelineError> {
        let original = Frame::from_jpeg(buffer)?;
        let mut filtered = original.clone();

        let filters = self.filters.snapshot();
        filter::run_chain(&filters, &mut filtered).await?;
        if filtered.is_empty() {
            debug!(source = source.name(), "frame filtered out");
            return Ok(FrameOutcome::Discarded);
        }

        let detection = self.detector.detect(&filtered).await?;
        if detection.is_empty() {
            debug!(source = source.name(), "no plates found");
            return Ok(FrameOutcome::NoResults);
        }
        for candidate in &detection.candidates {
            info!(
                source = source.name(),
                plate = %candidate.plate,
                confidence = candidate.confidence,
                "plate detected"
            );
        }

        let recorders = self.recorders.snapshot();
        let report = fanout(&recorders, &detection, source, &original, &filtered).await;
        Ok(FrameOutcome::Recorded(report))
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg_path
    }
}

/// Wires sources to the frame pipeline and keeps plugin lifecycles in step
/// with the registries.
///
/// Adding a source to the registry starts it and attaches a sink that cuts
/// its byte stream into JPEGs and runs each through [`Pipeline::next`].
/// Removing it stops the reader; frames already in flight still finish.
/// Recorders are started before they become visible to the fanout and
/// stopped when removed.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    listeners: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Must be called from within a tokio runtime.
    pub fn new(detector: DetectionClient, data_path: impl Into<PathBuf>, ffmpeg_path: impl Into<String>) -> Self {
        let pipeline = Arc::new(Pipeline {
            sources: Registry::new(),
            filters: Registry::new(),
            recorders: Registry::new(),
            detector,
            data_path: data_path.into(),
            ffmpeg_path: ffmpeg_path.into(),
            sinks: Mutex::new(Vec::new()),
        });

        let listeners = vec![
            tokio::spawn(watch_sources(Arc::clone(&pipeline), pipeline.sources.subscribe())),
            tokio::spawn(watch_recorders(pipeline.recorders.subscribe())),
            tokio::spawn(watch_filters(pipeline.filters.subscribe())),
        ];

        Self { pipeline, listeners }
    }

    /// Build every configured plugin. Filters and recorders are registered
    /// before sources so the first frame already sees the full chain.
    pub async fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let detector = DetectionClient::from_config(&config.recognition)?;
        let orchestrator = Self::new(detector, config.data_path.clone(), config.ffmpeg_path.clone());

        for filter in &config.filters {
            orchestrator.add_filter_config(filter)?;
        }
        for recorder in &config.recorders {
            orchestrator.add_recorder_config(recorder).await?;
        }
        for source in &config.sources {
            orchestrator.add_source_config(source)?;
        }

        info!(
            sources = orchestrator.pipeline.sources.len(),
            filters = orchestrator.pipeline.filters.len(),
            recorders = orchestrator.pipeline.recorders.len(),
            "pipeline configured"
        );
        Ok(orchestrator)
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn sources(&self) -> &Registry<Source> {
        &self.pipeline.sources
    }

    pub fn filters(&self) -> &Registry<Filter> {
        &self.pipeline.filters
    }

    pub fn recorders(&self) -> &Registry<Recorder> {
        &self.pipeline.recorders
    }

    pub async fn next(&self, buffer: Bytes, source: &Source) -> FrameOutcome {
        self.pipeline.next(buffer, source).await
    }

    pub fn add_source(&self, source: Source) -> Result<Arc<Source>, PipelineError> {
        self.pipeline
            .sources
            .add_unique(source)
            .map_err(|s| duplicate("source", s.name()))
    }

    pub fn add_source_config(&self, config: &SourceConfig) -> Result<Arc<Source>, PipelineError> {
        let source = Source::from_config(config, &self.pipeline.ffmpeg_path)?;
        self.add_source(source)
    }

    pub fn add_filter(&self, filter: Filter) -> Result<Arc<Filter>, PipelineError> {
        self.pipeline
            .filters
            .add_unique(filter)
            .map_err(|f| duplicate("filter", f.name()))
    }

    pub fn add_filter_config(&self, config: &FilterConfig) -> Result<Arc<Filter>, PipelineError> {
        let filter = Filter::from_config(config, &self.pipeline.data_path)?;
        self.add_filter(filter)
    }

    /// Start the recorder, then register it. A recorder that fails to start
    /// is still registered; its records fail until it is replaced. One that
    /// loses a name race is stopped again.
    pub async fn add_recorder(&self, recorder: Recorder) -> Result<Arc<Recorder>, PipelineError> {
        if self.pipeline.recorders.contains(recorder.name()) {
            return Err(duplicate("recorder", recorder.name()));
        }
        if let Err(e) = recorder.start().await {
            error!(recorder = recorder.name(), error = %e, "recorder failed to start");
        }
        match self.pipeline.recorders.add_unique(recorder) {
            Ok(recorder) => Ok(recorder),
            Err(recorder) => {
                recorder.stop().await;
                Err(duplicate("recorder", recorder.name()))
            }
        }
    }

    pub async fn add_recorder_config(&self, config: &RecorderConfig) -> Result<Arc<Recorder>, PipelineError> {
        let recorder = Recorder::from_config(config, &self.pipeline.data_path)?;
        self.add_recorder(recorder).await
    }

    pub fn remove_source(&self, name: &str) -> bool {
        !self.pipeline.sources.remove_named(name).is_empty()
    }

    pub fn remove_filter(&self, name: &str) -> bool {
        !self.pipeline.filters.remove_named(name).is_empty()
    }

    pub fn remove_recorder(&self, name: &str) -> bool {
        !self.pipeline.recorders.remove_named(name).is_empty()
    }

    /// Stop every source, let in-flight frames finish, then stop every
    /// recorder.
    pub async fn shutdown(&self) {
        info!("shutting down pipeline");
        for source in self.pipeline.sources.remove(|_| true) {
            source.stop();
            source.join().await;
        }

        let sinks: Vec<_> = std::mem::take(&mut *self.pipeline.sinks.lock().unwrap_or_else(PoisonError::into_inner));
        for sink in sinks {
            if let Err(e) = sink.await {
                error!(error = %e, "source sink failed");
            }
        }

        for recorder in self.pipeline.recorders.remove(|_| true) {
            recorder.stop().await;
        }
        for listener in &self.listeners {
            listener.abort();
        }
        info!("pipeline stopped");
    }
}

fn duplicate(kind: &'static str, name: &str) -> PipelineError {
    PipelineError::Duplicate {
        kind,
        name: name.to_string(),
    }
}

async fn watch_sources(pipeline: Arc<Pipeline>, mut events: mpsc::UnboundedReceiver<RegistryEvent<Source>>) {
    while let Some(event) = events.recv().await {
        match event {
            RegistryEvent::Added(sources) => {
                for source in sources {
                    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
                    if !source.start(tx) {
                        continue;
                    }
                    let sink = tokio::spawn(run_sink(Arc::clone(&pipeline), source, rx));
                    let mut sinks = pipeline.sinks.lock().unwrap_or_else(PoisonError::into_inner);
                    sinks.retain(|handle| !handle.is_finished());
                    sinks.push(sink);
                }
            }
            RegistryEvent::Removed(sources) => {
                for source in sources {
                    source.stop();
                }
            }
        }
    }
}

async fn watch_recorders(mut events: mpsc::UnboundedReceiver<RegistryEvent<Recorder>>) {
    while let Some(event) = events.recv().await {
        match event {
            RegistryEvent::Added(recorders) => {
                for recorder in recorders {
                    if let Err(e) = recorder.start().await {
                        error!(recorder = recorder.name(), error = %e, "recorder failed to start");
                    }
                }
            }
            RegistryEvent::Removed(recorders) => {
                for recorder in recorders {
                    recorder.stop().await;
                }
            }
        }
    }
}

async fn watch_filters(mut events: mpsc::UnboundedReceiver<RegistryEvent<Filter>>) {
    while let Some(event) = events.recv().await {
        match event {
            RegistryEvent::Added(filters) => {
                for filter in filters {
                    info!(filter = filter.name(), kind = filter.kind(), "filter added");
                }
            }
            RegistryEvent::Removed(filters) => {
                for filter in filters {
                    info!(filter = filter.name(), "filter removed");
                }
            }
        }
    }
}

/// Frames of one source that may be between split and outcome at once.
/// Past this the sink stops reading, and the bounded event channel pushes
/// back on the reader.
pub const MAX_IN_FLIGHT: usize = 4;

/// Per-source consumer: splits the byte stream into JPEGs and keeps up to
/// [`MAX_IN_FLIGHT`] frames in flight at once. Frames are first polled in
/// arrival order, which is the order they join each filter's queue.
async fn run_sink(pipeline: Arc<Pipeline>, source: Arc<Source>, mut events: mpsc::Receiver<SourceEvent>) {
    let mut splitter = MjpegSplitter::new();
    let mut pending: VecDeque<Bytes> = VecDeque::new();
    let mut in_flight = FuturesUnordered::new();
    let mut open = true;
    let mut frames: u64 = 0;

    loop {
        while in_flight.len() < MAX_IN_FLIGHT {
            let Some(jpeg) = pending.pop_front() else {
                break;
            };
            frames += 1;
            let pipeline = Arc::clone(&pipeline);
            let source = Arc::clone(&source);
            in_flight.push(async move { pipeline.next(jpeg, &source).await });
        }

        tokio::select! {
            event = events.recv(), if open && pending.is_empty() => match event {
                Some(SourceEvent::Data(chunk)) => pending.extend(splitter.push(&chunk)),
                Some(SourceEvent::Failed(e)) => {
                    error!(source = source.name(), error = %e, "source failed, retrying");
                }
                Some(SourceEvent::Ended) => {
                    info!(source = source.name(), "source input ended");
                }
                None => open = false,
            },
            Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                if let FrameOutcome::Recorded(report) = outcome {
                    if report.failed > 0 {
                        warn!(source = source.name(), failed = report.failed, "some recorders failed");
                    }
                }
            }
            else => break,
        }
    }
    info!(source = source.name(), frames, "source sink finished");
}
