pub mod constants;
pub mod conversion;
pub mod datamodel;
pub mod export;
pub mod field;
pub mod identity;
pub mod logging;
pub mod mask;
pub mod mock;
pub mod pipeline;
pub mod reader;
pub mod select;
pub mod store;
pub mod time;
pub mod too_errors;
pub mod upsert;
pub mod validation;
pub mod xmatch;

pub use datamodel::{FiberType, RawBatch, RawValue, SkyBrightnessMode, TooRecord};
pub use pipeline::{PipelineParams, RunContext, RunSummary, TooPipeline};
pub use store::{MemoryStore, TooStore};
pub use too_errors::TooError;
