pub mod archive;
pub mod config;
pub mod decoder;
pub mod descriptor;
pub mod encoder;
pub mod error;
pub mod manifest;
pub mod planner;
pub mod pump;
pub mod registry;

pub use decoder::replicate;
pub use descriptor::{BlobLocation, PayloadDescriptor};
pub use encoder::{encode, make_payload};
pub use error::{Error, Result};
pub use planner::{Plan, PlannedImage, plan};
pub use registry::{MemoryRegistry, Registry};
