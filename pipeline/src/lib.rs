//! Frame pipeline: camera sources, filters, plate recognition and recorders,
//! held in observable registries and wired together by the [`Orchestrator`].

pub mod detect;
pub mod filter;
pub mod lifecycle;
pub mod orchestrator;
pub mod queue;
pub mod recorder;
pub mod registry;
pub mod source;

pub use detect::{DetectError, Detection, DetectionClient, PlateCandidate};
pub use filter::{Filter, FilterError};
pub use orchestrator::{FrameOutcome, Orchestrator, Pipeline, PipelineError, MAX_IN_FLIGHT};
pub use queue::OrderedFrameQueue;
pub use recorder::{FanoutReport, RecordedEvent, Recorder, RecorderError};
pub use registry::{Named, Registry, RegistryEvent};
pub use source::{Source, SourceError, SourceEvent};
