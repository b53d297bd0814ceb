mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, JSON, VISION};
pub use selectors::{ModelSelection, ModelSelector};
