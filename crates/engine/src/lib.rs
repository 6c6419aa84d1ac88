pub mod config;
pub mod error;
pub mod layout;
pub mod job;
pub mod chunks;
pub mod probe;
pub mod progress;
pub mod subtitle;
pub mod timeline;
pub mod store;
pub mod live;
pub mod thumbnail;
pub mod controller;
pub mod engine;

pub use config::{EngineConfig, LegacyScope};
pub use engine::{Engine, JobRequest};
pub use error::{EngineError, StateError};
pub use job::{Job, JobStatus};
pub use live::LiveEvent;
pub use timeline::{Timeline, TranscriptSegment};
