//! Stopping strategies for the convergence loop.
//!
//! The controller owns the loop; a policy only answers what to do with the
//! attempt it was just handed and how compile failures are accounted.

use tikzloop_contracts::runs::Attempt;

use crate::config::{LoopOptions, Strategy};
use crate::generation::Feedback;

/// Consecutive non-improving aggregates that count as a plateau.
pub const PLATEAU_LIMIT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Judgement {
    Pass,
    Plateau,
    Continue,
}

/// What happens once a step has used all of its compile attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileExhausted {
    /// Repair once more and move on to the next step with that artifact.
    CarryRepair,
    /// Seal the run as `FailedCompile`.
    AbortRun,
}

pub trait StoppingPolicy {
    fn strategy(&self) -> Strategy;

    fn wants_plan(&self) -> bool;

    fn wants_critique(&self) -> bool;

    /// Renders allowed within one outer step, the first try included.
    fn compile_attempts_per_step(&self) -> usize;

    fn on_compile_exhausted(&self) -> CompileExhausted;

    fn judge(&mut self, attempt: &Attempt) -> Judgement;

    /// Feedback for refining a rendered, non-passing attempt.
    fn feedback(&self, attempt: &Attempt) -> Option<Feedback> {
        let raster = attempt.render_outcome().raster()?;
        Some(match attempt.critique() {
            Some(critique) => Feedback::Critique {
                critique: critique.clone(),
                rendered: Some(raster.path.clone()),
            },
            None => Feedback::Visual {
                rendered: raster.path.clone(),
            },
        })
    }
}

pub fn policy_for(options: &LoopOptions) -> Box<dyn StoppingPolicy> {
    match options.strategy {
        Strategy::Similarity => Box::new(SimilarityPolicy::new(options.threshold)),
        Strategy::Critique => Box::new(CritiquePolicy::new(options.pass_threshold)),
    }
}

/// Stops as soon as pixel similarity reaches the threshold.
#[derive(Debug, Clone)]
pub struct SimilarityPolicy {
    threshold: f64,
}

impl SimilarityPolicy {
    pub const COMPILE_ATTEMPTS: usize = 2;

    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl StoppingPolicy for SimilarityPolicy {
    fn strategy(&self) -> Strategy {
        Strategy::Similarity
    }

    fn wants_plan(&self) -> bool {
        false
    }

    fn wants_critique(&self) -> bool {
        false
    }

    fn compile_attempts_per_step(&self) -> usize {
        Self::COMPILE_ATTEMPTS
    }

    fn on_compile_exhausted(&self) -> CompileExhausted {
        CompileExhausted::CarryRepair
    }

    fn judge(&mut self, attempt: &Attempt) -> Judgement {
        match attempt.similarity_score() {
            Some(score) if score >= self.threshold => Judgement::Pass,
            _ => Judgement::Continue,
        }
    }
}

/// Critique-driven: passes on a high aggregate with no major issue, gives up on a plateau.
#[derive(Debug, Clone)]
pub struct CritiquePolicy {
    pass_threshold: f64,
    previous: f64,
    plateau_count: usize,
}

impl CritiquePolicy {
    pub const COMPILE_ATTEMPTS: usize = 3;

    pub fn new(pass_threshold: f64) -> Self {
        Self {
            pass_threshold,
            previous: -1.0,
            plateau_count: 0,
        }
    }
}

impl StoppingPolicy for CritiquePolicy {
    fn strategy(&self) -> Strategy {
        Strategy::Critique
    }

    fn wants_plan(&self) -> bool {
        true
    }

    fn wants_critique(&self) -> bool {
        true
    }

    fn compile_attempts_per_step(&self) -> usize {
        Self::COMPILE_ATTEMPTS
    }

    fn on_compile_exhausted(&self) -> CompileExhausted {
        CompileExhausted::AbortRun
    }

    fn judge(&mut self, attempt: &Attempt) -> Judgement {
        // A rejected critique leaves the plateau tracker untouched.
        let (Some(critique), Some(score)) = (attempt.critique(), attempt.aggregate_score()) else {
            return Judgement::Continue;
        };
        if critique.passes(self.pass_threshold) {
            return Judgement::Pass;
        }
        if score <= self.previous {
            self.plateau_count += 1;
        } else {
            self.plateau_count = 0;
        }
        self.previous = score;
        if self.plateau_count >= PLATEAU_LIMIT {
            Judgement::Plateau
        } else {
            Judgement::Continue
        }
    }
}
