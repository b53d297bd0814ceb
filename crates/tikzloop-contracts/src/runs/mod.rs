pub mod attempt;
pub mod history;
pub mod summary;

pub use attempt::{
    Attempt, FinalArtifact, FinalSelection, Raster, RenderFailure, RenderOutcome, Run,
    RunBuilder, TargetImage, Verdict,
};
