//! The bounded generate → render → score → refine loop.
//!
//! Checks that can fail without spending anything (options, target image,
//! external tools) run before the first generation call. From then on every
//! render is recorded as an attempt, and only `InvalidInput`, `ToolMissing`,
//! generation transport failures, scoring failures and io errors escape.

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tikzloop_contracts::events::{EventKind, EventLog, EventPayload};
use tikzloop_contracts::figure::FigurePlan;
use tikzloop_contracts::runs::{
    Attempt, Raster, RenderFailure, RenderOutcome, Run, RunBuilder, TargetImage, Verdict,
};
use tracing::{debug, info, warn};

use crate::config::LoopOptions;
use crate::error::{EngineError, GenerationError, RenderError};
use crate::generation::{Feedback, FigureGenerator};
use crate::policy::{policy_for, CompileExhausted, Judgement, StoppingPolicy};
use crate::recorder::prepare_work_dir;
use crate::render::Renderer;
use crate::similarity::SimilarityScorer;

pub const EVENTS_FILE_NAME: &str = "events.jsonl";

pub struct ConvergenceController {
    generator: Box<dyn FigureGenerator>,
    renderer: Box<dyn Renderer>,
    scorer: Box<dyn SimilarityScorer>,
}

impl ConvergenceController {
    pub fn new(
        generator: Box<dyn FigureGenerator>,
        renderer: Box<dyn Renderer>,
        scorer: Box<dyn SimilarityScorer>,
    ) -> Self {
        Self {
            generator,
            renderer,
            scorer,
        }
    }

    pub fn run(&self, target: &Path, options: &LoopOptions) -> Result<Run, EngineError> {
        options.validate()?;
        let target_image = load_target(target)?;
        self.renderer.check_tools().map_err(|err| match err {
            RenderError::ToolMissing { program } => EngineError::ToolMissing { program },
            other => EngineError::InvalidOptions(other.to_string()),
        })?;

        let work_dir = prepare_work_dir(&options.work_dir)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let events = EventLog::create(work_dir.join(EVENTS_FILE_NAME), run_id.clone())?;
        let mut policy = policy_for(options);
        let strategy = policy.strategy();

        info!(
            run_id = %run_id,
            target = %target.display(),
            strategy = strategy.as_str(),
            max_attempts = options.max_attempts,
            "run started"
        );
        events.record(
            EventKind::RunStarted,
            map_object(json!({
                "target": target.display().to_string(),
                "width": target_image.width,
                "height": target_image.height,
                "strategy": strategy.as_str(),
                "max_attempts": options.max_attempts,
                "threshold": options.threshold,
                "pass_threshold": options.pass_threshold,
                "work_dir": work_dir.display().to_string(),
            })),
        )?;

        let mut builder =
            RunBuilder::new(run_id, strategy.as_str(), options.max_attempts, target_image);
        let mut session = Session {
            controller: self,
            target,
            options,
            events: &events,
            work_dir: &work_dir,
            builder: &mut builder,
        };
        let verdict = session.drive(policy.as_mut())?;

        let run = builder.seal(verdict, options.selection);
        info!(
            verdict = run.verdict().as_str(),
            attempts = run.attempts().len(),
            rendered = run.rendered_count(),
            "run finished"
        );
        events.record(
            EventKind::RunFinished,
            map_object(json!({
                "verdict": run.verdict().as_str(),
                "attempts": run.attempts().len(),
                "rendered": run.rendered_count(),
                "final_attempt": run.final_artifact().map(|artifact| artifact.attempt_index),
            })),
        )?;
        Ok(run)
    }
}

/// Mutable state of one run while the loop executes.
struct Session<'a> {
    controller: &'a ConvergenceController,
    target: &'a Path,
    options: &'a LoopOptions,
    events: &'a EventLog,
    work_dir: &'a Path,
    builder: &'a mut RunBuilder,
}

enum StepOutcome {
    Rendered(Raster),
    Exhausted,
    Abort,
}

impl Session<'_> {
    fn drive(&mut self, policy: &mut dyn StoppingPolicy) -> Result<Verdict, EngineError> {
        let plan = if policy.wants_plan() {
            self.plan()?
        } else {
            None
        };
        let mut artifact = self
            .controller
            .generator
            .generate(plan.as_ref(), self.target)
            .map_err(generation_failed("generate"))?;
        self.emit_artifact("generate", &artifact)?;

        let mut passed = false;
        for step in 0..self.options.max_attempts {
            let last_step = step + 1 == self.options.max_attempts;
            let raster = match self.render_step(&mut artifact, policy, last_step)? {
                StepOutcome::Rendered(raster) => raster,
                StepOutcome::Exhausted => continue,
                StepOutcome::Abort => return Ok(Verdict::FailedCompile),
            };

            let attempt = self.score_and_record(&artifact, raster, policy.wants_critique())?;
            match policy.judge(&attempt) {
                Judgement::Pass => {
                    passed = true;
                    break;
                }
                Judgement::Plateau => {
                    info!(attempt = attempt.index(), "score plateau, stopping early");
                    break;
                }
                Judgement::Continue if last_step => break,
                Judgement::Continue => {
                    if let Some(feedback) = policy.feedback(&attempt) {
                        artifact = self.refine(&artifact, &feedback, attempt.index())?;
                    }
                }
            }
        }

        Ok(if passed {
            Verdict::Passed
        } else if self.builder.has_rendered() {
            Verdict::FailedQuality
        } else {
            Verdict::FailedCompile
        })
    }

    fn plan(&mut self) -> Result<Option<FigurePlan>, EngineError> {
        match self
            .controller
            .generator
            .plan(self.target, self.options.clean)
        {
            Ok(plan) => {
                self.events.record(
                    EventKind::PlanCreated,
                    map_object(json!({
                        "figure_type": plan.figure_type,
                        "elements": plan.elements.len(),
                        "connections": plan.connections.len(),
                    })),
                )?;
                self.builder.set_plan(plan.clone());
                Ok(Some(plan))
            }
            Err(err) if err.is_malformed() => {
                warn!(error = %err, "plan rejected; generating from the image alone");
                self.events.record(
                    EventKind::PlanRejected,
                    map_object(json!({"reason": err.to_string()})),
                )?;
                Ok(None)
            }
            Err(err) => Err(generation_failed("plan")(err)),
        }
    }

    /// Renders `artifact`, repairing compile failures within the policy's inner budget.
    fn render_step(
        &mut self,
        artifact: &mut String,
        policy: &dyn StoppingPolicy,
        last_step: bool,
    ) -> Result<StepOutcome, EngineError> {
        let mut tries = 0usize;
        loop {
            tries += 1;
            let dir = self.attempt_dir(self.builder.next_index());
            let failure = match self.render(artifact, &dir)? {
                Ok(raster) => return Ok(StepOutcome::Rendered(raster)),
                Err(failure) => failure,
            };
            let diagnostic = RenderOutcome::from(failure.clone())
                .failure_text()
                .unwrap_or_default();
            let index = self.builder.push_failed(artifact.clone(), failure).index();
            warn!(attempt = index, try_in_step = tries, "render failed");
            self.emit_attempt(index)?;

            if tries >= policy.compile_attempts_per_step() {
                match policy.on_compile_exhausted() {
                    CompileExhausted::AbortRun => return Ok(StepOutcome::Abort),
                    CompileExhausted::CarryRepair if last_step => {
                        return Ok(StepOutcome::Exhausted)
                    }
                    CompileExhausted::CarryRepair => {
                        *artifact = self.refine(
                            artifact,
                            &Feedback::CompileError { diagnostic },
                            index,
                        )?;
                        return Ok(StepOutcome::Exhausted);
                    }
                }
            }
            *artifact = self.refine(artifact, &Feedback::CompileError { diagnostic }, index)?;
        }
    }

    fn render(
        &self,
        artifact: &str,
        dir: &Path,
    ) -> Result<Result<Raster, RenderFailure>, EngineError> {
        match self.controller.renderer.render(artifact, dir) {
            Ok(raster) => Ok(Ok(raster)),
            Err(RenderError::CompileFailed { diagnostic, .. }) => {
                Ok(Err(RenderFailure::CompileFailed { diagnostic }))
            }
            Err(RenderError::Timeout { stage, seconds }) => {
                Ok(Err(RenderFailure::Timeout { stage, seconds }))
            }
            Err(RenderError::ToolMissing { program }) => Err(EngineError::ToolMissing { program }),
            Err(RenderError::Io(err)) => Err(EngineError::Io(err)),
        }
    }

    fn score_and_record(
        &mut self,
        artifact: &str,
        raster: Raster,
        wants_critique: bool,
    ) -> Result<Attempt, EngineError> {
        let similarity = self.controller.scorer.score(self.target, &raster.path)?;
        let critique = if wants_critique {
            match self.controller.generator.critique(self.target, &raster.path) {
                Ok(critique) => Some(critique),
                Err(err) if err.is_malformed() => {
                    warn!(error = %err, "critique rejected");
                    self.events.record(
                        EventKind::CritiqueRejected,
                        map_object(json!({
                            "attempt": self.builder.next_index(),
                            "reason": err.to_string(),
                        })),
                    )?;
                    None
                }
                Err(err) => return Err(generation_failed("critique")(err)),
            }
        } else {
            None
        };

        let attempt = self
            .builder
            .push_rendered(artifact.to_string(), raster, similarity, critique)
            .clone();
        info!(
            attempt = attempt.index(),
            similarity = attempt.similarity_score().unwrap_or_default(),
            aggregate = attempt.aggregate_score(),
            "attempt rendered"
        );
        self.emit_attempt(attempt.index())?;
        Ok(attempt)
    }

    fn refine(
        &self,
        artifact: &str,
        feedback: &Feedback,
        from_attempt: usize,
    ) -> Result<String, EngineError> {
        debug!(from_attempt, feedback = feedback.kind(), "refine requested");
        self.events.record(
            EventKind::RefineRequested,
            map_object(json!({
                "from_attempt": from_attempt,
                "feedback": feedback.kind(),
            })),
        )?;
        let next = self
            .controller
            .generator
            .refine(artifact, feedback, self.target)
            .map_err(generation_failed("refine"))?;
        self.emit_artifact("refine", &next)?;
        Ok(next)
    }

    fn emit_artifact(&self, source: &str, artifact: &str) -> Result<(), EngineError> {
        self.events.record(
            EventKind::ArtifactGenerated,
            map_object(json!({
                "source": source,
                "chars": artifact.chars().count(),
            })),
        )?;
        Ok(())
    }

    fn emit_attempt(&self, index: usize) -> Result<(), EngineError> {
        let Some(attempt) = self.builder.attempts().get(index) else {
            return Ok(());
        };
        let mut payload = EventPayload::new();
        payload.insert("index".to_string(), json!(attempt.index()));
        payload.insert(
            "outcome".to_string(),
            json!(attempt.render_outcome().label()),
        );
        payload.insert("similarity".to_string(), json!(attempt.similarity_score()));
        payload.insert("aggregate".to_string(), json!(attempt.aggregate_score()));
        if let Some(diagnostic) = attempt.render_outcome().failure_text() {
            payload.insert("diagnostic".to_string(), Value::String(diagnostic));
        }
        if let Some(critique) = attempt.critique() {
            payload.insert("issues".to_string(), json!(critique.issues.len()));
        }
        self.events.record(EventKind::AttemptRecorded, payload)?;
        Ok(())
    }

    fn attempt_dir(&self, index: usize) -> PathBuf {
        attempt_dir(self.work_dir, index)
    }
}

pub fn attempt_dir(work_dir: &Path, index: usize) -> PathBuf {
    work_dir.join(format!("attempt_{index:02}"))
}

fn load_target(path: &Path) -> Result<TargetImage, EngineError> {
    if !path.is_file() {
        return Err(EngineError::InvalidInput {
            path: path.to_path_buf(),
            reason: "file not found".to_string(),
        });
    }
    let decoded = image::open(path).map_err(|err| EngineError::InvalidInput {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    // run.json stores this path verbatim.
    let resolved = path.canonicalize()?;
    Ok(TargetImage {
        path: resolved,
        width: decoded.width(),
        height: decoded.height(),
    })
}

fn generation_failed(operation: &'static str) -> impl Fn(GenerationError) -> EngineError {
    move |source| EngineError::Generation { operation, source }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use image::{Rgb, RgbImage};
    use tikzloop_contracts::events::{read_event_kinds, EventKind};
    use tikzloop_contracts::figure::{Critique, FigurePlan, RubricScores};
    use tikzloop_contracts::runs::{FinalSelection, Raster, RenderOutcome, Run, Verdict};

    use super::{ConvergenceController, EVENTS_FILE_NAME};
    use crate::config::{LoopOptions, Strategy};
    use crate::error::{EngineError, GenerationError, RenderError, ScoringError};
    use crate::generation::{Feedback, FigureGenerator};
    use crate::render::{Renderer, RENDERED_FILE_NAME};
    use crate::similarity::{SimilarityScorer, SsimScorer};

    #[derive(Default)]
    struct Calls {
        plan: usize,
        generate: usize,
        critique: usize,
        refine: Vec<&'static str>,
        generated_with_plan: Option<bool>,
    }

    enum Scripted<T> {
        Ok(T),
        Malformed,
        Transport,
    }

    struct FakeGenerator {
        calls: Arc<Mutex<Calls>>,
        plan: Mutex<Option<Scripted<FigurePlan>>>,
        generate_fails: bool,
        critiques: Mutex<VecDeque<Scripted<f64>>>,
    }

    impl FakeGenerator {
        fn new(calls: &Arc<Mutex<Calls>>) -> Self {
            Self {
                calls: Arc::clone(calls),
                plan: Mutex::new(None),
                generate_fails: false,
                critiques: Mutex::new(VecDeque::new()),
            }
        }

        fn with_critiques(self, scripted: Vec<Scripted<f64>>) -> Self {
            *self.critiques.lock().expect("lock") = scripted.into();
            self
        }

        fn with_plan(self, plan: Scripted<FigurePlan>) -> Self {
            *self.plan.lock().expect("lock") = Some(plan);
            self
        }
    }

    fn malformed(operation: &'static str) -> GenerationError {
        GenerationError::MalformedResponse {
            operation,
            reason: "not json".to_string(),
        }
    }

    fn transport() -> GenerationError {
        GenerationError::Transport {
            provider: "fake".to_string(),
            message: "connection refused".to_string(),
        }
    }

    fn critique_scoring(score: f64) -> Critique {
        Critique {
            scores: RubricScores {
                completeness: score,
                structural_match: score,
                text_accuracy: score,
                aesthetic_quality: score,
            },
            issues: Vec::new(),
        }
    }

    impl FigureGenerator for FakeGenerator {
        fn plan(&self, _target: &Path, _clean: bool) -> Result<FigurePlan, GenerationError> {
            self.calls.lock().expect("lock").plan += 1;
            match self.plan.lock().expect("lock").take() {
                Some(Scripted::Ok(plan)) => Ok(plan),
                Some(Scripted::Transport) => Err(transport()),
                _ => Err(malformed("plan")),
            }
        }

        fn generate(
            &self,
            plan: Option<&FigurePlan>,
            _target: &Path,
        ) -> Result<String, GenerationError> {
            let mut calls = self.calls.lock().expect("lock");
            calls.generate += 1;
            calls.generated_with_plan = Some(plan.is_some());
            if self.generate_fails {
                return Err(transport());
            }
            Ok("\\draw (0,0) -- (1,1); % v0".to_string())
        }

        fn critique(&self, _target: &Path, _rendered: &Path) -> Result<Critique, GenerationError> {
            self.calls.lock().expect("lock").critique += 1;
            match self.critiques.lock().expect("lock").pop_front() {
                Some(Scripted::Ok(score)) => Ok(critique_scoring(score)),
                Some(Scripted::Malformed) => Err(malformed("critique")),
                Some(Scripted::Transport) => Err(transport()),
                None => Ok(critique_scoring(5.0)),
            }
        }

        fn refine(
            &self,
            _source_code: &str,
            feedback: &Feedback,
            _target: &Path,
        ) -> Result<String, GenerationError> {
            let mut calls = self.calls.lock().expect("lock");
            calls.refine.push(feedback.kind());
            Ok(format!("\\draw (0,0) -- (1,1); % v{}", calls.refine.len()))
        }
    }

    /// Copies the target as the rendered raster unless a failure is scripted.
    struct FakeRenderer {
        target: PathBuf,
        tools_present: bool,
        script: Mutex<VecDeque<Option<RenderError>>>,
        always_fail: bool,
    }

    impl FakeRenderer {
        fn new(target: &Path) -> Self {
            Self {
                target: target.to_path_buf(),
                tools_present: true,
                script: Mutex::new(VecDeque::new()),
                always_fail: false,
            }
        }

        fn scripted(self, script: Vec<Option<RenderError>>) -> Self {
            *self.script.lock().expect("lock") = script.into();
            self
        }
    }

    fn compile_failed(diagnostic: &str) -> RenderError {
        RenderError::CompileFailed {
            stage: "compile".to_string(),
            diagnostic: diagnostic.to_string(),
        }
    }

    impl Renderer for FakeRenderer {
        fn check_tools(&self) -> Result<(), RenderError> {
            if self.tools_present {
                Ok(())
            } else {
                Err(RenderError::ToolMissing {
                    program: "pdflatex".to_string(),
                })
            }
        }

        fn render(&self, _source_code: &str, out_dir: &Path) -> Result<Raster, RenderError> {
            if self.always_fail {
                return Err(compile_failed("! Emergency stop."));
            }
            if let Some(Some(err)) = self.script.lock().expect("lock").pop_front() {
                return Err(err);
            }
            std::fs::create_dir_all(out_dir)?;
            let dest = out_dir.join(RENDERED_FILE_NAME);
            std::fs::copy(&self.target, &dest)?;
            Ok(Raster {
                path: dest,
                width: 100,
                height: 100,
            })
        }
    }

    struct FakeScorer {
        scores: Mutex<VecDeque<f64>>,
        fallback: f64,
    }

    impl FakeScorer {
        fn sequence(scores: &[f64]) -> Self {
            Self {
                scores: Mutex::new(scores.iter().copied().collect()),
                fallback: scores.last().copied().unwrap_or(0.0),
            }
        }
    }

    impl SimilarityScorer for FakeScorer {
        fn score(&self, _a: &Path, _b: &Path) -> Result<f64, ScoringError> {
            Ok(self
                .scores
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(self.fallback))
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        target: PathBuf,
        work_dir: PathBuf,
        calls: Arc<Mutex<Calls>>,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let temp = tempfile::tempdir()?;
        let target = temp.path().join("target.png");
        RgbImage::from_pixel(100, 100, Rgb([0, 0, 255])).save(&target)?;
        let work_dir = temp.path().join("run");
        Ok(Fixture {
            target,
            work_dir,
            calls: Arc::new(Mutex::new(Calls::default())),
            _temp: temp,
        })
    }

    fn options(fixture: &Fixture, strategy: Strategy, max_attempts: usize) -> LoopOptions {
        LoopOptions {
            max_attempts,
            strategy,
            work_dir: fixture.work_dir.clone(),
            ..LoopOptions::default()
        }
    }

    fn assert_run_invariants(run: &Run) {
        for (position, attempt) in run.attempts().iter().enumerate() {
            assert_eq!(attempt.index(), position);
            if !attempt.is_rendered() {
                assert!(attempt.similarity_score().is_none());
                assert!(attempt.aggregate_score().is_none());
            }
        }
    }

    fn event_kinds(work_dir: &Path) -> anyhow::Result<Vec<EventKind>> {
        Ok(read_event_kinds(&work_dir.join(EVENTS_FILE_NAME))?)
    }

    #[test]
    fn identical_render_passes_on_first_attempt() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(SsimScorer::default()),
        );
        let run = controller.run(&fx.target, &options(&fx, Strategy::Similarity, 3))?;

        assert_eq!(run.verdict(), Verdict::Passed);
        assert_eq!(run.attempts().len(), 1);
        assert!(run.attempts()[0].similarity_score().unwrap_or_default() > 0.99);
        assert_eq!(run.final_artifact().map(|item| item.attempt_index), Some(0));
        assert!(fx.calls.lock().expect("lock").refine.is_empty());
        assert_run_invariants(&run);
        Ok(())
    }

    #[test]
    fn flat_similarity_exhausts_budget_with_failed_quality() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[0.3])),
        );
        let run = controller.run(
            &fx.target,
            &LoopOptions {
                threshold: 0.99,
                ..options(&fx, Strategy::Similarity, 3)
            },
        )?;

        assert_eq!(run.verdict(), Verdict::FailedQuality);
        assert_eq!(run.attempts().len(), 3);
        let calls = fx.calls.lock().expect("lock");
        assert_eq!(calls.refine, vec!["visual", "visual"]);
        assert_eq!(calls.plan, 0);
        assert_eq!(calls.generated_with_plan, Some(false));
        assert_run_invariants(&run);
        Ok(())
    }

    #[test]
    fn loop_stops_once_threshold_is_crossed() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[0.5, 0.95])),
        );
        let run = controller.run(&fx.target, &options(&fx, Strategy::Similarity, 5))?;

        assert_eq!(run.verdict(), Verdict::Passed);
        assert_eq!(run.attempts().len(), 2);
        assert_eq!(fx.calls.lock().expect("lock").refine.len(), 1);
        assert_eq!(run.attempts()[1].source_code(), "\\draw (0,0) -- (1,1); % v1");
        assert_run_invariants(&run);
        Ok(())
    }

    #[test]
    fn compile_repair_does_not_consume_similarity_budget() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(
                FakeRenderer::new(&fx.target)
                    .scripted(vec![Some(compile_failed("! Undefined control"))]),
            ),
            Box::new(FakeScorer::sequence(&[0.95])),
        );
        let run = controller.run(&fx.target, &options(&fx, Strategy::Similarity, 1))?;

        assert_eq!(run.verdict(), Verdict::Passed);
        assert_eq!(run.attempts().len(), 2);
        assert_eq!(
            run.attempts()[0].render_outcome(),
            &RenderOutcome::CompileFailed {
                diagnostic: "! Undefined control".to_string()
            }
        );
        assert!(run.attempts()[1].is_rendered());
        assert_eq!(fx.calls.lock().expect("lock").refine, vec!["compile_error"]);
        assert!(!fx.work_dir.join("attempt_00").exists());
        assert!(fx.work_dir.join("attempt_01").join("rendered.png").is_file());
        assert_run_invariants(&run);
        Ok(())
    }

    #[test]
    fn compile_repair_is_charged_to_the_critique_iteration() -> anyhow::Result<()> {
        let fx = fixture()?;
        let plan: FigurePlan = serde_json::from_value(serde_json::json!({
            "figure_type": "pipeline",
            "elements": [{"id": "e1", "type": "rect", "label": "A"}]
        }))?;
        let controller = ConvergenceController::new(
            Box::new(
                FakeGenerator::new(&fx.calls)
                    .with_plan(Scripted::Ok(plan))
                    .with_critiques(vec![Scripted::Ok(9.0)]),
            ),
            Box::new(
                FakeRenderer::new(&fx.target)
                    .scripted(vec![Some(compile_failed("! Undefined control"))]),
            ),
            Box::new(FakeScorer::sequence(&[0.4])),
        );
        let run = controller.run(&fx.target, &options(&fx, Strategy::Critique, 1))?;

        assert_eq!(run.verdict(), Verdict::Passed);
        assert_eq!(run.attempts().len(), 2);
        assert!(run.plan().is_some());
        assert!(run.attempts()[1].aggregate_score().unwrap_or_default() >= 8.0);
        let calls = fx.calls.lock().expect("lock");
        assert_eq!(calls.refine, vec!["compile_error"]);
        assert_eq!(calls.generated_with_plan, Some(true));
        assert_run_invariants(&run);
        Ok(())
    }

    #[test]
    fn missing_compiler_fails_before_any_generation_or_file() -> anyhow::Result<()> {
        let fx = fixture()?;
        let mut renderer = FakeRenderer::new(&fx.target);
        renderer.tools_present = false;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(renderer),
            Box::new(FakeScorer::sequence(&[1.0])),
        );
        let result = controller.run(&fx.target, &options(&fx, Strategy::Critique, 3));

        assert!(matches!(result, Err(EngineError::ToolMissing { ref program }) if program == "pdflatex"));
        let calls = fx.calls.lock().expect("lock");
        assert_eq!(calls.plan + calls.generate + calls.critique, 0);
        assert!(!fx.work_dir.exists());
        Ok(())
    }

    #[test]
    fn missing_target_is_invalid_input() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[1.0])),
        );
        let missing = fx.target.with_file_name("nope.png");
        let result = controller.run(&missing, &options(&fx, Strategy::Similarity, 3));
        assert!(matches!(result, Err(EngineError::InvalidInput { .. })));

        let garbage = fx.target.with_file_name("garbage.png");
        std::fs::write(&garbage, b"not a png")?;
        let result = controller.run(&garbage, &options(&fx, Strategy::Similarity, 3));
        assert!(matches!(result, Err(EngineError::InvalidInput { .. })));
        assert_eq!(fx.calls.lock().expect("lock").generate, 0);
        Ok(())
    }

    #[test]
    fn zero_attempts_is_rejected() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[1.0])),
        );
        let result = controller.run(&fx.target, &options(&fx, Strategy::Similarity, 0));
        assert!(matches!(result, Err(EngineError::InvalidOptions(_))));
        Ok(())
    }

    #[test]
    fn critique_plateau_stops_before_budget() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls).with_critiques(vec![
                Scripted::Ok(6.0),
                Scripted::Ok(5.0),
                Scripted::Ok(5.0),
                Scripted::Ok(9.0),
            ])),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[0.5])),
        );
        let run = controller.run(&fx.target, &options(&fx, Strategy::Critique, 5))?;

        assert_eq!(run.verdict(), Verdict::FailedQuality);
        assert_eq!(run.attempts().len(), 3);
        let calls = fx.calls.lock().expect("lock");
        assert_eq!(calls.refine, vec!["critique", "critique"]);
        assert_eq!(calls.plan, 1);
        assert_eq!(calls.generated_with_plan, Some(false));
        drop(calls);

        let kinds = event_kinds(&fx.work_dir)?;
        assert!(kinds.contains(&EventKind::PlanRejected));
        assert_eq!(kinds.first(), Some(&EventKind::RunStarted));
        assert_eq!(kinds.last(), Some(&EventKind::RunFinished));
        assert_run_invariants(&run);
        Ok(())
    }

    #[test]
    fn exhausted_critique_compiles_abort_with_failed_compile() -> anyhow::Result<()> {
        let fx = fixture()?;
        let mut renderer = FakeRenderer::new(&fx.target);
        renderer.always_fail = true;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(renderer),
            Box::new(FakeScorer::sequence(&[1.0])),
        );
        let run = controller.run(&fx.target, &options(&fx, Strategy::Critique, 4))?;

        assert_eq!(run.verdict(), Verdict::FailedCompile);
        assert_eq!(run.attempts().len(), 3);
        assert!(run.final_artifact().is_none());
        assert_eq!(fx.calls.lock().expect("lock").refine.len(), 2);
        assert_run_invariants(&run);
        Ok(())
    }

    #[test]
    fn similarity_loop_never_rendering_is_bounded() -> anyhow::Result<()> {
        let fx = fixture()?;
        let mut renderer = FakeRenderer::new(&fx.target);
        renderer.always_fail = true;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(renderer),
            Box::new(FakeScorer::sequence(&[1.0])),
        );
        let run = controller.run(&fx.target, &options(&fx, Strategy::Similarity, 2))?;

        assert_eq!(run.verdict(), Verdict::FailedCompile);
        // Two steps, each with one retry on top of the first render.
        assert_eq!(run.attempts().len(), 4);
        assert_eq!(fx.calls.lock().expect("lock").refine.len(), 3);
        assert_run_invariants(&run);
        Ok(())
    }

    #[test]
    fn rejected_critique_is_neutral_and_recorded() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(
                FakeGenerator::new(&fx.calls)
                    .with_critiques(vec![Scripted::Malformed, Scripted::Malformed]),
            ),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[0.2])),
        );
        let run = controller.run(&fx.target, &options(&fx, Strategy::Critique, 2))?;

        assert_eq!(run.verdict(), Verdict::FailedQuality);
        assert_eq!(run.attempts().len(), 2);
        assert!(run.attempts().iter().all(|attempt| attempt.critique().is_none()));
        assert_eq!(fx.calls.lock().expect("lock").refine, vec!["visual"]);
        let kinds = event_kinds(&fx.work_dir)?;
        assert_eq!(
            kinds
                .iter()
                .filter(|kind| **kind == EventKind::CritiqueRejected)
                .count(),
            2
        );
        Ok(())
    }

    #[test]
    fn unreachable_service_aborts_the_run() -> anyhow::Result<()> {
        let fx = fixture()?;
        let mut generator = FakeGenerator::new(&fx.calls);
        generator.generate_fails = true;
        let controller = ConvergenceController::new(
            Box::new(generator),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[1.0])),
        );
        let result = controller.run(&fx.target, &options(&fx, Strategy::Similarity, 2));
        assert!(matches!(
            result,
            Err(EngineError::Generation {
                operation: "generate",
                ..
            })
        ));

        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls).with_plan(Scripted::Transport)),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[1.0])),
        );
        let result = controller.run(&fx.target, &options(&fx, Strategy::Critique, 2));
        assert!(matches!(
            result,
            Err(EngineError::Generation {
                operation: "plan",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn best_scoring_selection_keeps_the_peak_render() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[0.7, 0.4, 0.5])),
        );
        let base = options(&fx, Strategy::Similarity, 3);
        let run = controller.run(
            &fx.target,
            &LoopOptions {
                selection: FinalSelection::BestScoring,
                ..base
            },
        )?;
        assert_eq!(run.verdict(), Verdict::FailedQuality);
        assert_eq!(run.final_artifact().map(|item| item.attempt_index), Some(0));
        Ok(())
    }

    #[test]
    fn rerun_in_same_work_dir_starts_clean() -> anyhow::Result<()> {
        let fx = fixture()?;
        let first = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[0.95])),
        );
        first.run(&fx.target, &options(&fx, Strategy::Similarity, 1))?;
        assert!(fx.work_dir.join("attempt_00").join("rendered.png").is_file());
        std::fs::write(fx.work_dir.join("final.png"), b"old")?;
        std::fs::write(fx.work_dir.join("run.json"), b"{}")?;
        std::fs::write(fx.work_dir.join("notes.txt"), b"keep me")?;

        let mut failing = FakeRenderer::new(&fx.target);
        failing.always_fail = true;
        let second = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(failing),
            Box::new(FakeScorer::sequence(&[1.0])),
        );
        let run = second.run(&fx.target, &options(&fx, Strategy::Similarity, 1))?;

        assert_eq!(run.verdict(), Verdict::FailedCompile);
        assert!(!fx.work_dir.join("attempt_00").exists());
        assert!(!fx.work_dir.join("final.png").exists());
        assert!(!fx.work_dir.join("run.json").exists());
        assert!(fx.work_dir.join("notes.txt").is_file());
        let kinds = event_kinds(&fx.work_dir)?;
        assert_eq!(
            kinds
                .iter()
                .filter(|kind| **kind == EventKind::RunStarted)
                .count(),
            1
        );
        Ok(())
    }

    #[test]
    fn recorded_paths_are_absolute_and_normalized() -> anyhow::Result<()> {
        let fx = fixture()?;
        let controller = ConvergenceController::new(
            Box::new(FakeGenerator::new(&fx.calls)),
            Box::new(FakeRenderer::new(&fx.target)),
            Box::new(FakeScorer::sequence(&[0.95])),
        );
        let winding = fx.work_dir.join("..").join("run");
        let run = controller.run(
            &fx.target,
            &LoopOptions {
                work_dir: winding,
                ..options(&fx, Strategy::Similarity, 1)
            },
        )?;

        let no_parent_refs = |path: &Path| {
            path.is_absolute()
                && path
                    .components()
                    .all(|part| part != std::path::Component::ParentDir)
        };
        assert!(no_parent_refs(&run.target().path));
        let raster = run
            .final_artifact()
            .map(|artifact| artifact.raster.path.clone())
            .unwrap_or_default();
        assert!(no_parent_refs(&raster));
        assert!(raster.is_file());
        Ok(())
    }
}
