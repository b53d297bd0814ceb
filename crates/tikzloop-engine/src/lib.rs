pub mod config;
pub mod controller;
pub mod error;
pub mod generation;
pub mod policy;
pub mod recorder;
pub mod render;
pub mod similarity;

pub use config::{GenerationConfig, LoopOptions, Rasterizer, RenderConfig, Strategy};
pub use controller::ConvergenceController;
pub use error::{EngineError, GenerationError, RenderError, ScoringError};
pub use generation::{build_generator, Feedback, FigureGenerator, PromptedGenerator};
pub use recorder::{load_run, RunRecord, RunRecorder};
pub use render::{LatexRenderer, Renderer};
pub use similarity::{SimilarityScorer, SsimScorer};
