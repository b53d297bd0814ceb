//! Writes a sealed run to its work directory and reads it back for export.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tikzloop_contracts::runs::history::attempt_diffs;
use tikzloop_contracts::runs::summary::{write_summary, RunSummary};
use tikzloop_contracts::runs::Run;
use tracing::debug;

use crate::controller::{attempt_dir, EVENTS_FILE_NAME};
use crate::render::standalone_document;

pub const RUN_FILE_NAME: &str = "run.json";
pub const SUMMARY_FILE_NAME: &str = "summary.json";
pub const REPORT_FILE_NAME: &str = "report.html";

/// Top-level files a run writes besides `original.<ext>` and `attempt_NN/`.
const RUN_FILES: [&str; 7] = [
    EVENTS_FILE_NAME,
    RUN_FILE_NAME,
    SUMMARY_FILE_NAME,
    REPORT_FILE_NAME,
    "final.tex",
    "final_standalone.tex",
    "final.png",
];

/// What `run.json` holds: the run plus everything a report needs without the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run: Run,
    pub original: PathBuf,
    pub target_sha256: String,
    pub diffs: Vec<Option<Vec<String>>>,
    #[serde(default)]
    pub final_source: Option<PathBuf>,
    #[serde(default)]
    pub final_image: Option<PathBuf>,
}

pub struct RunRecorder {
    work_dir: PathBuf,
    preamble: String,
}

impl RunRecorder {
    pub fn new(work_dir: impl Into<PathBuf>, preamble: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            preamble: preamble.into(),
        }
    }

    pub fn persist(&self, run: &Run) -> Result<RunRecord> {
        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("failed to create {}", self.work_dir.display()))?;
        let work_dir = self
            .work_dir
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", self.work_dir.display()))?;

        let target = &run.target().path;
        let bytes =
            fs::read(target).with_context(|| format!("failed reading {}", target.display()))?;
        let target_sha256 = hex::encode(Sha256::digest(&bytes));
        let original = work_dir.join(original_file_name(target));
        write_file(&original, &bytes)?;

        for attempt in run.attempts() {
            let dir = attempt_dir(&work_dir, attempt.index());
            write_file(&dir.join("figure.tex"), attempt.source_code().as_bytes())?;
            if let Some(failure) = attempt.render_outcome().failure_text() {
                write_file(&dir.join("latex_error.txt"), failure.as_bytes())?;
            }
        }

        let mut final_source = None;
        let mut final_image = None;
        if let Some(artifact) = run.final_artifact() {
            let source_path = work_dir.join("final.tex");
            write_file(&source_path, artifact.source_code.as_bytes())?;
            write_file(
                &work_dir.join("final_standalone.tex"),
                standalone_document(&artifact.source_code, &self.preamble).as_bytes(),
            )?;
            let image_path = work_dir.join("final.png");
            fs::copy(&artifact.raster.path, &image_path).with_context(|| {
                format!(
                    "failed to copy {} to {}",
                    artifact.raster.path.display(),
                    image_path.display()
                )
            })?;
            final_source = Some(source_path);
            final_image = Some(image_path);
        }

        let record = RunRecord {
            run: run.clone(),
            original,
            target_sha256,
            diffs: attempt_diffs(run.attempts()),
            final_source,
            final_image,
        };
        let run_path = work_dir.join(RUN_FILE_NAME);
        write_file(
            &run_path,
            serde_json::to_string_pretty(&record)
                .context("failed to serialize run record")?
                .as_bytes(),
        )?;

        let extra = summary_extra(&record);
        write_summary(
            &work_dir.join(SUMMARY_FILE_NAME),
            &RunSummary::from_run(run),
            Some(&extra),
        )?;
        debug!(dir = %work_dir.display(), "run persisted");
        Ok(record)
    }
}

/// Creates `dir` if needed and removes whatever an earlier run left there.
/// Files the loop never writes are kept. Returns the absolute directory.
pub fn prepare_work_dir(dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let dir = dir.canonicalize()?;
    let mut cleared = 0usize;
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            if is_attempt_dir_name(name) {
                fs::remove_dir_all(&path)?;
                cleared += 1;
            }
        } else if RUN_FILES.contains(&name) || is_original_file_name(name) {
            fs::remove_file(&path)?;
            cleared += 1;
        }
    }
    if cleared > 0 {
        debug!(dir = %dir.display(), cleared, "cleared previous run");
    }
    Ok(dir)
}

fn is_attempt_dir_name(name: &str) -> bool {
    name.strip_prefix("attempt_")
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

fn is_original_file_name(name: &str) -> bool {
    name == "original" || name.starts_with("original.")
}

/// Loads `run.json` from a run directory written by [`RunRecorder::persist`].
pub fn load_run(dir: &Path) -> Result<RunRecord> {
    let path = dir.join(RUN_FILE_NAME);
    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed parsing {}", path.display()))
}

fn original_file_name(target: &Path) -> String {
    match target.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if !ext.is_empty() => format!("original.{}", ext.to_ascii_lowercase()),
        _ => "original".to_string(),
    }
}

fn summary_extra(record: &RunRecord) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert(
        "target".to_string(),
        json!(record.run.target().path.display().to_string()),
    );
    extra.insert("target_sha256".to_string(), json!(record.target_sha256));
    extra.insert(
        "final_source".to_string(),
        json!(record
            .final_source
            .as_ref()
            .map(|path| path.display().to_string())),
    );
    extra
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}
