//! Generation service adapter: plan, generate, critique and refine.
//!
//! `FigureGenerator` is the capability the controller consumes. The real
//! implementation, `PromptedGenerator`, turns each operation into one
//! `VisionRequest` against a `VisionBackend` and parses the answer strictly.

mod anthropic;
mod dryrun;
mod http;
mod openai;
pub mod parse;
pub mod prompts;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tikzloop_contracts::figure::{Critique, FigurePlan};
use tikzloop_contracts::models::{ModelSelector, VISION};
use tracing::{debug, info, warn};

pub use anthropic::AnthropicBackend;
pub use dryrun::DryrunBackend;
pub use openai::OpenAiBackend;

use crate::config::GenerationConfig;
use crate::error::GenerationError;

/// What the refine operation is asked to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Feedback {
    /// The current source failed to compile or rasterize.
    CompileError { diagnostic: String },
    /// Compare the rendered output with the target.
    Visual { rendered: PathBuf },
    /// Fix the issues of a structured critique.
    Critique {
        critique: Critique,
        rendered: Option<PathBuf>,
    },
}

impl Feedback {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CompileError { .. } => "compile_error",
            Self::Visual { .. } => "visual",
            Self::Critique { .. } => "critique",
        }
    }
}

pub trait FigureGenerator {
    fn plan(&self, target: &Path, clean: bool) -> Result<FigurePlan, GenerationError>;

    fn generate(
        &self,
        plan: Option<&FigurePlan>,
        target: &Path,
    ) -> Result<String, GenerationError>;

    fn critique(&self, target: &Path, rendered: &Path) -> Result<Critique, GenerationError>;

    fn refine(
        &self,
        source_code: &str,
        feedback: &Feedback,
        target: &Path,
    ) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisionImage {
    pub label: Option<&'static str>,
    pub path: PathBuf,
}

impl VisionImage {
    fn plain(path: &Path) -> Self {
        Self {
            label: None,
            path: path.to_path_buf(),
        }
    }

    fn labeled(label: &'static str, path: &Path) -> Self {
        Self {
            label: Some(label),
            path: path.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisionRequest {
    pub operation: &'static str,
    pub model: String,
    pub system: String,
    pub user: String,
    pub images: Vec<VisionImage>,
    pub expect_json: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisionResponse {
    pub text: String,
    pub model: String,
}

/// One request/response round trip against a vision-capable text model.
pub trait VisionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Fails fast on missing credentials, before any request is sent.
    fn ensure_ready(&self) -> Result<(), GenerationError> {
        Ok(())
    }

    fn complete(&self, request: &VisionRequest) -> Result<VisionResponse, GenerationError>;
}

impl<T: VisionBackend + ?Sized> VisionBackend for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn ensure_ready(&self) -> Result<(), GenerationError> {
        (**self).ensure_ready()
    }

    fn complete(&self, request: &VisionRequest) -> Result<VisionResponse, GenerationError> {
        (**self).complete(request)
    }
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn VisionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<B: VisionBackend + 'static>(&mut self, backend: B) {
        self.backends
            .insert(backend.name().to_string(), Arc::new(backend));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VisionBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

pub fn default_backend_registry(config: &GenerationConfig) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(DryrunBackend::new());
    registry.register(OpenAiBackend::new(config));
    registry.register(AnthropicBackend::new(config));
    registry
}

/// Resolves provider and model from `config` and returns a ready generator.
pub fn build_generator(
    config: &GenerationConfig,
    preamble: &str,
) -> Result<PromptedGenerator<Arc<dyn VisionBackend>>, GenerationError> {
    let registry = default_backend_registry(config);
    let backend = registry
        .get(&config.provider)
        .ok_or_else(|| GenerationError::UnknownProvider {
            name: config.provider.clone(),
            available: registry.names().join(", "),
        })?;
    backend.ensure_ready()?;

    let selection = ModelSelector::new(None)
        .select(config.model.as_deref(), VISION, Some(&config.provider))
        .map_err(GenerationError::ModelUnavailable)?;
    match (&selection.requested, &selection.fallback_reason) {
        (Some(_), Some(reason)) => warn!(model = %selection.model.name, "{reason}"),
        (None, Some(reason)) => debug!(model = %selection.model.name, "{reason}"),
        _ => {}
    }
    info!(
        provider = %config.provider,
        model = %selection.model.name,
        "generation backend ready"
    );

    Ok(PromptedGenerator::new(
        backend,
        selection.model.name,
        preamble.to_string(),
    ))
}

pub struct PromptedGenerator<B> {
    backend: B,
    model: String,
    preamble: String,
}

impl<B: VisionBackend> PromptedGenerator<B> {
    pub fn new(backend: B, model: impl Into<String>, preamble: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            preamble: preamble.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn ask(
        &self,
        operation: &'static str,
        system: &str,
        user: String,
        images: Vec<VisionImage>,
        expect_json: bool,
    ) -> Result<String, GenerationError> {
        let request = VisionRequest {
            operation,
            model: self.model.clone(),
            system: system.to_string(),
            user,
            images,
            expect_json,
        };
        debug!(
            operation,
            backend = self.backend.name(),
            images = request.images.len(),
            "vision request"
        );
        let response = self.backend.complete(&request)?;
        if response.text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse {
                provider: self.backend.name().to_string(),
            });
        }
        Ok(response.text)
    }
}

impl<B: VisionBackend> FigureGenerator for PromptedGenerator<B> {
    fn plan(&self, target: &Path, clean: bool) -> Result<FigurePlan, GenerationError> {
        let text = self.ask(
            "plan",
            prompts::PLANNER_SYSTEM,
            prompts::planner_user(clean),
            vec![VisionImage::plain(target)],
            true,
        )?;
        parse::parse_plan(&text)
    }

    fn generate(
        &self,
        plan: Option<&FigurePlan>,
        target: &Path,
    ) -> Result<String, GenerationError> {
        let plan_json = plan
            .map(serde_json::to_string_pretty)
            .transpose()
            .map_err(|err| GenerationError::MalformedResponse {
                operation: "generate",
                reason: format!("plan does not serialize: {err}"),
            })?;
        let text = self.ask(
            "generate",
            prompts::GENERATOR_SYSTEM,
            prompts::generator_user(plan_json.as_deref(), &self.preamble),
            vec![VisionImage::plain(target)],
            false,
        )?;
        Ok(parse::extract_code_block(&text))
    }

    fn critique(&self, target: &Path, rendered: &Path) -> Result<Critique, GenerationError> {
        let text = self.ask(
            "critique",
            prompts::EVALUATOR_SYSTEM,
            prompts::EVALUATOR_USER.to_string(),
            vec![
                VisionImage::labeled("ORIGINAL (target):", target),
                VisionImage::labeled("RENDERED (current output):", rendered),
            ],
            true,
        )?;
        parse::parse_critique(&text)
    }

    fn refine(
        &self,
        source_code: &str,
        feedback: &Feedback,
        target: &Path,
    ) -> Result<String, GenerationError> {
        let original = VisionImage::labeled("ORIGINAL (target):", target);
        let (system, user, images) = match feedback {
            Feedback::CompileError { diagnostic } => (
                prompts::COMPILE_FIX_SYSTEM,
                prompts::compile_fix_user(source_code, diagnostic),
                vec![original],
            ),
            Feedback::Visual { rendered } => (
                prompts::VISUAL_REFINER_SYSTEM,
                prompts::visual_refiner_user(source_code),
                vec![
                    original,
                    VisionImage::labeled("RENDERED (current output):", rendered),
                ],
            ),
            Feedback::Critique { critique, rendered } => {
                let critique_json = serde_json::to_string_pretty(critique).map_err(|err| {
                    GenerationError::MalformedResponse {
                        operation: "refine",
                        reason: format!("critique does not serialize: {err}"),
                    }
                })?;
                let mut images = vec![original];
                if let Some(rendered) = rendered {
                    images.push(VisionImage::labeled("RENDERED (current output):", rendered));
                }
                (
                    prompts::REFINER_SYSTEM,
                    prompts::refiner_user(source_code, &critique_json),
                    images,
                )
            }
        };
        let text = self.ask("refine", system, user, images, false)?;
        Ok(parse::extract_code_block(&text))
    }
}
