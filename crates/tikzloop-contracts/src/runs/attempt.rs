//! Attempt and Run records produced by the convergence loop.
//!
//! A `Run` is only obtainable by sealing a `RunBuilder`; the builder is the
//! single place attempt indices are assigned, so indices are dense and ordered.
//! Scores can only be attached through `push_rendered`, so a failed render
//! never carries a similarity or aggregate score.

use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::figure::{Critique, FigurePlan};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raster {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RenderOutcome {
    Rendered { raster: Raster },
    CompileFailed { diagnostic: String },
    Timeout { stage: String, seconds: u64 },
}

impl RenderOutcome {
    pub fn is_rendered(&self) -> bool {
        matches!(self, Self::Rendered { .. })
    }

    pub fn raster(&self) -> Option<&Raster> {
        match self {
            Self::Rendered { raster } => Some(raster),
            _ => None,
        }
    }

    /// Text handed to the repair step for a failed render.
    pub fn failure_text(&self) -> Option<String> {
        match self {
            Self::Rendered { .. } => None,
            Self::CompileFailed { diagnostic } => Some(diagnostic.clone()),
            Self::Timeout { stage, seconds } => {
                Some(format!("{stage} timed out after {seconds}s"))
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Rendered { .. } => "rendered",
            Self::CompileFailed { .. } => "compile_failed",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// The non-rendered subset of `RenderOutcome`.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderFailure {
    CompileFailed { diagnostic: String },
    Timeout { stage: String, seconds: u64 },
}

impl From<RenderFailure> for RenderOutcome {
    fn from(failure: RenderFailure) -> Self {
        match failure {
            RenderFailure::CompileFailed { diagnostic } => Self::CompileFailed { diagnostic },
            RenderFailure::Timeout { stage, seconds } => Self::Timeout { stage, seconds },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    index: usize,
    source_code: String,
    render_outcome: RenderOutcome,
    similarity_score: Option<f64>,
    critique: Option<Critique>,
    aggregate_score: Option<f64>,
}

impl Attempt {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn render_outcome(&self) -> &RenderOutcome {
        &self.render_outcome
    }

    pub fn similarity_score(&self) -> Option<f64> {
        self.similarity_score
    }

    pub fn critique(&self) -> Option<&Critique> {
        self.critique.as_ref()
    }

    pub fn aggregate_score(&self) -> Option<f64> {
        self.aggregate_score
    }

    pub fn is_rendered(&self) -> bool {
        self.render_outcome.is_rendered()
    }

    /// Score used to rank attempts: aggregate when critiqued, else similarity.
    pub fn ranking_score(&self) -> Option<f64> {
        self.aggregate_score.or(self.similarity_score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    FailedQuality,
    FailedCompile,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::FailedQuality => "failed_quality",
            Self::FailedCompile => "failed_compile",
        }
    }
}

/// Which rendered attempt becomes the delivered artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalSelection {
    #[default]
    LastRendered,
    BestScoring,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalArtifact {
    pub attempt_index: usize,
    pub source_code: String,
    pub raster: Raster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    run_id: String,
    strategy: String,
    max_attempts: usize,
    target: TargetImage,
    plan: Option<FigurePlan>,
    started_at: String,
    finished_at: String,
    attempts: Vec<Attempt>,
    final_artifact: Option<FinalArtifact>,
    verdict: Verdict,
}

impl Run {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn target(&self) -> &TargetImage {
        &self.target
    }

    pub fn plan(&self) -> Option<&FigurePlan> {
        self.plan.as_ref()
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn finished_at(&self) -> &str {
        &self.finished_at
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn final_artifact(&self) -> Option<&FinalArtifact> {
        self.final_artifact.as_ref()
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn rendered_count(&self) -> usize {
        self.attempts.iter().filter(|attempt| attempt.is_rendered()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.attempts.len() - self.rendered_count()
    }

    pub fn best_attempt(&self) -> Option<&Attempt> {
        best_rendered(&self.attempts)
    }
}

/// Mutable, append-only view of a Run while the loop is executing.
#[derive(Debug)]
pub struct RunBuilder {
    run_id: String,
    strategy: String,
    max_attempts: usize,
    target: TargetImage,
    plan: Option<FigurePlan>,
    started_at: String,
    attempts: Vec<Attempt>,
}

impl RunBuilder {
    pub fn new(
        run_id: impl Into<String>,
        strategy: impl Into<String>,
        max_attempts: usize,
        target: TargetImage,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            strategy: strategy.into(),
            max_attempts,
            target,
            plan: None,
            started_at: now_utc_iso(),
            attempts: Vec::new(),
        }
    }

    pub fn set_plan(&mut self, plan: FigurePlan) {
        self.plan = Some(plan);
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn next_index(&self) -> usize {
        self.attempts.len()
    }

    pub fn push_failed(&mut self, source_code: impl Into<String>, failure: RenderFailure) -> &Attempt {
        let attempt = Attempt {
            index: self.next_index(),
            source_code: source_code.into(),
            render_outcome: failure.into(),
            similarity_score: None,
            critique: None,
            aggregate_score: None,
        };
        self.attempts.push(attempt);
        &self.attempts[self.attempts.len() - 1]
    }

    pub fn push_rendered(
        &mut self,
        source_code: impl Into<String>,
        raster: Raster,
        similarity_score: f64,
        critique: Option<Critique>,
    ) -> &Attempt {
        let aggregate_score = critique.as_ref().map(Critique::aggregate);
        let attempt = Attempt {
            index: self.next_index(),
            source_code: source_code.into(),
            render_outcome: RenderOutcome::Rendered { raster },
            similarity_score: Some(similarity_score.clamp(0.0, 1.0)),
            critique,
            aggregate_score,
        };
        self.attempts.push(attempt);
        &self.attempts[self.attempts.len() - 1]
    }

    pub fn has_rendered(&self) -> bool {
        self.attempts.iter().any(Attempt::is_rendered)
    }

    pub fn seal(self, verdict: Verdict, selection: FinalSelection) -> Run {
        let chosen = match selection {
            FinalSelection::LastRendered => {
                self.attempts.iter().rev().find(|attempt| attempt.is_rendered())
            }
            FinalSelection::BestScoring => best_rendered(&self.attempts),
        };
        let final_artifact = chosen.and_then(|attempt| {
            attempt.render_outcome.raster().map(|raster| FinalArtifact {
                attempt_index: attempt.index,
                source_code: attempt.source_code.clone(),
                raster: raster.clone(),
            })
        });
        Run {
            run_id: self.run_id,
            strategy: self.strategy,
            max_attempts: self.max_attempts,
            target: self.target,
            plan: self.plan,
            started_at: self.started_at,
            finished_at: now_utc_iso(),
            attempts: self.attempts,
            final_artifact,
            verdict,
        }
    }
}

// Ties go to the later attempt.
fn best_rendered(attempts: &[Attempt]) -> Option<&Attempt> {
    attempts
        .iter()
        .filter(|attempt| attempt.is_rendered())
        .fold(None, |best: Option<&Attempt>, attempt| match best {
            Some(current)
                if current.ranking_score().unwrap_or(f64::MIN)
                    > attempt.ranking_score().unwrap_or(f64::MIN) =>
            {
                Some(current)
            }
            _ => Some(attempt),
        })
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{FinalSelection, Raster, RenderFailure, RenderOutcome, RunBuilder, TargetImage, Verdict};

    fn target() -> TargetImage {
        TargetImage {
            path: PathBuf::from("target.png"),
            width: 100,
            height: 100,
        }
    }

    fn raster(name: &str) -> Raster {
        Raster {
            path: PathBuf::from(name),
            width: 10,
            height: 10,
        }
    }

    #[test]
    fn indices_are_dense_and_failed_attempts_carry_no_scores() {
        let mut builder = RunBuilder::new("run-1", "similarity", 3, target());
        builder.push_failed(
            "\\draw (0,0) -- (1,1)",
            RenderFailure::CompileFailed {
                diagnostic: "! Undefined control".to_string(),
            },
        );
        builder.push_rendered("\\draw (0,0) -- (1,1);", raster("a.png"), 0.4, None);
        builder.push_failed(
            "\\draw",
            RenderFailure::Timeout {
                stage: "pdflatex".to_string(),
                seconds: 30,
            },
        );
        let run = builder.seal(Verdict::FailedQuality, FinalSelection::LastRendered);

        for (position, attempt) in run.attempts().iter().enumerate() {
            assert_eq!(attempt.index(), position);
            if !attempt.is_rendered() {
                assert!(attempt.similarity_score().is_none());
                assert!(attempt.aggregate_score().is_none());
            }
        }
        assert_eq!(run.rendered_count(), 1);
        assert_eq!(run.failed_count(), 2);
        assert_eq!(
            run.attempts()[2].render_outcome().failure_text().as_deref(),
            Some("pdflatex timed out after 30s")
        );
    }

    #[test]
    fn last_rendered_selection_ignores_higher_earlier_scores() {
        let mut builder = RunBuilder::new("run-2", "similarity", 3, target());
        builder.push_rendered("first", raster("first.png"), 0.8, None);
        builder.push_rendered("second", raster("second.png"), 0.5, None);
        builder.push_failed(
            "third",
            RenderFailure::CompileFailed {
                diagnostic: "! Missing $".to_string(),
            },
        );
        let run = builder.seal(Verdict::FailedQuality, FinalSelection::LastRendered);

        let chosen = run.final_artifact().expect("final artifact");
        assert_eq!(chosen.attempt_index, 1);
        assert_eq!(chosen.source_code, "second");
        assert_eq!(run.best_attempt().map(|attempt| attempt.index()), Some(0));
    }

    #[test]
    fn best_scoring_selection_keeps_the_peak() {
        let mut builder = RunBuilder::new("run-3", "similarity", 3, target());
        builder.push_rendered("first", raster("first.png"), 0.8, None);
        builder.push_rendered("second", raster("second.png"), 0.5, None);
        let run = builder.seal(Verdict::FailedQuality, FinalSelection::BestScoring);
        assert_eq!(run.final_artifact().map(|item| item.attempt_index), Some(0));
    }

    #[test]
    fn run_without_renders_has_no_final_artifact() {
        let mut builder = RunBuilder::new("run-4", "critique", 1, target());
        builder.push_failed(
            "x",
            RenderFailure::CompileFailed {
                diagnostic: "! Emergency stop".to_string(),
            },
        );
        assert!(!builder.has_rendered());
        let run = builder.seal(Verdict::FailedCompile, FinalSelection::LastRendered);
        assert!(run.final_artifact().is_none());
        assert_eq!(run.verdict().as_str(), "failed_compile");
    }

    #[test]
    fn render_outcome_serializes_with_status_tag() -> anyhow::Result<()> {
        let outcome = RenderOutcome::CompileFailed {
            diagnostic: "! Undefined control sequence.".to_string(),
        };
        let value = serde_json::to_value(&outcome)?;
        assert_eq!(value["status"], "compile_failed");
        let back: RenderOutcome = serde_json::from_value(value)?;
        assert_eq!(back, outcome);
        Ok(())
    }
}
