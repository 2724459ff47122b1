mod client;
mod dispatch;
mod error;
mod instance;
mod probe;
mod registry;

pub use client::{GenerationBackend, HttpGenerationClient};
pub use dispatch::{dispatch, generate_on, Generation};
pub use error::{BackendError, Result};
pub use instance::{InFlightGuard, InstanceCapabilities, ModelInstance};
pub use probe::spawn_prober;
pub use registry::BackendRegistry;
