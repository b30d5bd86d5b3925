//! Texture generation pipeline: request a generated image from a remote
//! endpoint, decode it and commit it as a texture asset without blocking
//! the caller.

pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod job;
mod model;
pub mod orchestrator;
pub mod request;
pub mod sink;
pub mod spec;
pub mod transport;

pub use codec::{PixelBuffer, RawPayload, SourceFormat};
pub use config::{GeneratorConfig, ResponseFormat, RetryConfig, SlotPolicy};
pub use error::{BuildError, DecodeError, JobError, OrchestratorError, SinkError, TransportError};
pub use job::{JobEvent, JobId, JobSnapshot, JobState};
pub use model::GenerationModel;
pub use orchestrator::Orchestrator;
pub use sink::{AssetIdentity, AssetMetadata, AssetSink, MemoryAssetSink};
pub use spec::GenerationSpec;
pub use transport::{HttpTransport, Transport};
