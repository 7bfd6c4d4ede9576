pub mod models;
pub mod registry;
mod request_id;

pub use models::{ModelInfoError, ModelInfoSource, ModelResolver, StaticModelInfo};
pub use registry::{StreamEntry, StreamLease, StreamRegistry};
pub use request_id::RequestIdGenerator;
