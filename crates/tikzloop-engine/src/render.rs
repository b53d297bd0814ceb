//! LaTeX compile and rasterize pipeline.
//!
//! Every render gets a fresh temp directory; only the first-page PNG survives,
//! copied into the caller's attempt directory as `rendered.png`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tikzloop_contracts::runs::Raster;
use tracing::debug;

use crate::config::{Rasterizer, RenderConfig};
use crate::error::RenderError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const LOG_TAIL_CHARS: usize = 1500;
const CONTEXT_BEFORE: usize = 1;
const CONTEXT_AFTER: usize = 5;
const LINE_REF_SEARCH: usize = 10;

pub const RENDERED_FILE_NAME: &str = "rendered.png";

pub trait Renderer {
    /// Verifies external tools exist. Must not touch the filesystem.
    fn check_tools(&self) -> Result<(), RenderError>;

    /// Compiles `source_code` and writes the first-page raster into `out_dir`.
    fn render(&self, source_code: &str, out_dir: &Path) -> Result<Raster, RenderError>;
}

#[derive(Debug, Clone)]
pub struct LatexRenderer {
    config: RenderConfig,
}

impl LatexRenderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    fn compile(&self, workspace: &Path) -> Result<PathBuf, RenderError> {
        let mut command = Command::new(&self.config.compiler);
        command
            .arg("-interaction=nonstopmode")
            .arg("-halt-on-error")
            .arg("figure.tex")
            .current_dir(workspace);
        let output = run_with_deadline(
            command,
            &self.config.compiler,
            "compile",
            workspace,
            self.config.compile_timeout,
        )?;

        let pdf_path = workspace.join("figure.pdf");
        if !pdf_path.is_file() {
            debug!(status = ?output.status, "compiler produced no pdf");
            return Err(RenderError::CompileFailed {
                stage: "compile".to_string(),
                diagnostic: diagnostic_text(&output.combined()),
            });
        }
        Ok(pdf_path)
    }

    fn rasterize(&self, pdf_path: &Path, workspace: &Path) -> Result<PathBuf, RenderError> {
        let dpi = self.config.dpi.to_string();
        let program = self.config.rasterizer.program();
        let mut command = Command::new(program);
        let png_path = match self.config.rasterizer {
            Rasterizer::Pdftoppm => {
                command
                    .arg("-png")
                    .arg("-r")
                    .arg(&dpi)
                    .arg("-f")
                    .arg("1")
                    .arg("-l")
                    .arg("1")
                    .arg("-singlefile")
                    .arg(pdf_path)
                    .arg(workspace.join("page"));
                workspace.join("page.png")
            }
            Rasterizer::Ghostscript => {
                let png_path = workspace.join("page.png");
                command
                    .arg("-dSAFER")
                    .arg("-dBATCH")
                    .arg("-dNOPAUSE")
                    .arg("-sDEVICE=png16m")
                    .arg(format!("-r{dpi}"))
                    .arg("-dFirstPage=1")
                    .arg("-dLastPage=1")
                    .arg(format!("-sOutputFile={}", png_path.display()))
                    .arg(pdf_path);
                png_path
            }
        };
        command.current_dir(workspace);
        let output = run_with_deadline(
            command,
            program,
            "rasterize",
            workspace,
            self.config.rasterize_timeout,
        )?;

        if !output.status.success() || !png_path.is_file() {
            return Err(RenderError::CompileFailed {
                stage: "rasterize".to_string(),
                diagnostic: tail_chars(&output.combined(), LOG_TAIL_CHARS),
            });
        }
        Ok(png_path)
    }
}

impl Renderer for LatexRenderer {
    fn check_tools(&self) -> Result<(), RenderError> {
        for program in [
            self.config.compiler.as_str(),
            self.config.rasterizer.program(),
        ] {
            if !command_available(program) {
                return Err(RenderError::ToolMissing {
                    program: program.to_string(),
                });
            }
        }
        Ok(())
    }

    fn render(&self, source_code: &str, out_dir: &Path) -> Result<Raster, RenderError> {
        let workspace = tempfile::Builder::new().prefix("tikzloop-").tempdir()?;
        let document = standalone_document(source_code, &self.config.preamble);
        fs::write(workspace.path().join("figure.tex"), document)?;

        let pdf_path = self.compile(workspace.path())?;
        let png_path = self.rasterize(&pdf_path, workspace.path())?;

        fs::create_dir_all(out_dir)?;
        let dest = out_dir.join(RENDERED_FILE_NAME);
        fs::copy(&png_path, &dest)?;
        let (width, height) =
            image::image_dimensions(&dest).map_err(|err| RenderError::CompileFailed {
                stage: "rasterize".to_string(),
                diagnostic: format!("rasterizer output is not a readable image: {err}"),
            })?;
        Ok(Raster {
            path: dest,
            width,
            height,
        })
    }
}

/// First error block found in a compiler log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatexDiagnostic {
    pub message: String,
    pub line: Option<u32>,
    pub context: String,
}

impl LatexDiagnostic {
    pub fn summary(&self) -> String {
        match self.line {
            Some(line) => format!("Line {line}: {}\n{}", self.message, self.context),
            None => format!("{}\n{}", self.message, self.context),
        }
    }
}

/// Only the first `!` marker is reported; later ones usually cascade from it.
pub fn parse_first_error(log: &str) -> Option<LatexDiagnostic> {
    let lines: Vec<&str> = log.lines().collect();
    let index = lines
        .iter()
        .position(|line| line.trim_start().starts_with('!'))?;

    let message = lines[index]
        .trim_start()
        .trim_start_matches('!')
        .trim()
        .to_string();
    let search_end = (index + LINE_REF_SEARCH).min(lines.len());
    let line = lines[index + 1..search_end]
        .iter()
        .find_map(|candidate| line_reference(candidate));
    let context_start = index.saturating_sub(CONTEXT_BEFORE);
    let context_end = (index + CONTEXT_AFTER).min(lines.len());
    let context = lines[context_start..context_end].join("\n");

    Some(LatexDiagnostic {
        message,
        line,
        context,
    })
}

/// Diagnostic handed to the repair step: the first error, else the log tail.
pub fn diagnostic_text(log: &str) -> String {
    match parse_first_error(log) {
        Some(diagnostic) => diagnostic.summary(),
        None => tail_chars(log, LOG_TAIL_CHARS),
    }
}

/// Wraps a picture in the standalone document shell.
pub fn standalone_document(source_code: &str, preamble: &str) -> String {
    let body = ensure_tikzpicture(source_code);
    format!(
        "\\documentclass[border=5pt]{{standalone}}\n\
         \\usepackage{{tikz}}\n\
         \\usetikzlibrary{{calc,positioning,arrows.meta,shapes,backgrounds,fit,math}}\n\
         \\usepackage{{amsmath,amssymb}}\n\
         {preamble}\n\
         \\begin{{document}}\n\
         {body}\n\
         \\end{{document}}\n"
    )
}

pub fn ensure_tikzpicture(source_code: &str) -> String {
    let trimmed = source_code.trim();
    if trimmed.contains("\\begin{tikzpicture}") {
        return trimmed.to_string();
    }
    format!("\\begin{{tikzpicture}}\n{trimmed}\n\\end{{tikzpicture}}")
}

pub fn command_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .is_ok()
}

struct ProcessOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl ProcessOutput {
    fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

fn run_with_deadline(
    mut command: Command,
    program: &str,
    stage: &str,
    logs_dir: &Path,
    timeout: Duration,
) -> Result<ProcessOutput, RenderError> {
    let stdout_path = logs_dir.join(format!("{stage}.stdout"));
    let stderr_path = logs_dir.join(format!("{stage}.stderr"));
    command
        .stdin(Stdio::null())
        .stdout(File::create(&stdout_path)?)
        .stderr(File::create(&stderr_path)?);

    let mut child = command.spawn().map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => RenderError::ToolMissing {
            program: program.to_string(),
        },
        _ => RenderError::Io(err),
    })?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RenderError::Timeout {
                stage: stage.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(ProcessOutput {
        status,
        stdout: read_lossy(&stdout_path),
        stderr: read_lossy(&stderr_path),
    })
}

fn read_lossy(path: &Path) -> String {
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn line_reference(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("l.")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let follows_whitespace = rest[digits.len()..]
        .chars()
        .next()
        .map(char::is_whitespace)
        .unwrap_or(false);
    if !follows_whitespace {
        return None;
    }
    digits.parse().ok()
}

fn tail_chars(value: &str, max_chars: usize) -> String {
    let count = value.chars().count();
    if count <= max_chars {
        return value.to_string();
    }
    value.chars().skip(count - max_chars).collect()
}
