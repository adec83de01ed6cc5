//! Turns EPUB and plain-text books into narrated audiobooks.
//!
//! The pipeline runs in two phases. Analysis is synchronous and CPU-bound:
//! [`source`] reads the document, [`segmenter`] splits it into chapters and
//! [`analysis`] produces a [`BookInfo`]. Generation is asynchronous:
//! [`engine::SynthesisEngine`] plans chunks, calls a
//! [`provider::SpeechProvider`] for each in order and assembles the audio.

pub mod analysis;
pub mod artifacts;
pub mod audio;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod job;
pub mod markup;
pub mod model;
pub mod normalize;
pub mod planner;
pub mod provider;
pub mod segmenter;
pub mod source;

pub use config::{AudioFormat, Config};
pub use engine::{GenerateRequest, JobOutcome, SynthesisEngine};
pub use error::{AssemblyError, PipelineError, SynthesisError};
pub use job::{JobStatus, OutputMode, ProgressSnapshot, SynthesisJob};
pub use model::{BookInfo, Chapter, ChunkPlanEntry};
