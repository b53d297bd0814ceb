use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tikzloop_contracts::runs::FinalSelection;

use crate::error::EngineError;

pub const DEFAULT_MAX_ATTEMPTS: usize = 5;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.9;
pub const DEFAULT_PASS_THRESHOLD: f64 = 8.0;
pub const DEFAULT_DPI: u32 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub provider: String,
    pub model: Option<String>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub max_output_tokens: u64,
    pub temperature: f64,
    pub image_max_dim: u32,
    pub transport_retries: usize,
    pub retry_backoff: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            api_base: None,
            api_key: None,
            request_timeout: Duration::from_secs(120),
            max_output_tokens: 4096,
            temperature: 0.2,
            image_max_dim: 1024,
            transport_retries: 2,
            retry_backoff: Duration::from_millis(1200),
        }
    }
}

impl GenerationConfig {
    /// Fills missing credentials from the provider's conventional environment variables.
    pub fn with_env_credentials(mut self) -> Self {
        let (key_var, base_var) = match self.provider.as_str() {
            "openai" => ("OPENAI_API_KEY", "OPENAI_API_BASE"),
            "anthropic" => ("ANTHROPIC_API_KEY", "ANTHROPIC_API_BASE"),
            _ => return self,
        };
        if self.api_key.is_none() {
            self.api_key = non_empty_env(key_var);
        }
        if self.api_base.is_none() {
            self.api_base = non_empty_env(base_var);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Rasterizer {
    #[default]
    Pdftoppm,
    Ghostscript,
}

impl Rasterizer {
    pub fn program(&self) -> &'static str {
        match self {
            Self::Pdftoppm => "pdftoppm",
            Self::Ghostscript => "gs",
        }
    }
}

impl FromStr for Rasterizer {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pdftoppm" | "poppler" => Ok(Self::Pdftoppm),
            "gs" | "ghostscript" => Ok(Self::Ghostscript),
            other => Err(EngineError::InvalidOptions(format!(
                "unknown rasterizer '{other}' (expected pdftoppm or gs)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    pub compiler: String,
    pub rasterizer: Rasterizer,
    pub dpi: u32,
    pub compile_timeout: Duration,
    pub rasterize_timeout: Duration,
    pub preamble: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            compiler: "pdflatex".to_string(),
            rasterizer: Rasterizer::default(),
            dpi: DEFAULT_DPI,
            compile_timeout: Duration::from_secs(30),
            rasterize_timeout: Duration::from_secs(30),
            preamble: String::new(),
        }
    }
}

/// Named stopping strategy; see `policy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    #[default]
    Similarity,
    Critique,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Similarity => "similarity",
            Self::Critique => "critique",
        }
    }
}

impl FromStr for Strategy {
    type Err = EngineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "similarity" => Ok(Self::Similarity),
            "critique" => Ok(Self::Critique),
            other => Err(EngineError::InvalidOptions(format!(
                "unknown strategy '{other}' (expected similarity or critique)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopOptions {
    pub max_attempts: usize,
    pub strategy: Strategy,
    pub threshold: f64,
    pub pass_threshold: f64,
    pub clean: bool,
    pub selection: FinalSelection,
    pub work_dir: PathBuf,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            strategy: Strategy::default(),
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            clean: false,
            selection: FinalSelection::default(),
            work_dir: PathBuf::from("runs"),
        }
    }
}

impl LoopOptions {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_attempts < 1 {
            return Err(EngineError::InvalidOptions(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(EngineError::InvalidOptions(format!(
                "similarity threshold {} is outside [0, 1]",
                self.threshold
            )));
        }
        if !self.pass_threshold.is_finite() {
            return Err(EngineError::InvalidOptions(
                "pass threshold must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
