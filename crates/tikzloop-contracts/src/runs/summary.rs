use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::attempt::Run;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub strategy: String,
    pub verdict: String,
    pub max_attempts: u64,
    pub total_attempts: u64,
    pub rendered_attempts: u64,
    pub failed_attempts: u64,
    pub final_attempt: Option<u64>,
    pub final_similarity: Option<f64>,
    pub final_aggregate: Option<f64>,
    pub best_attempt: Option<u64>,
    pub best_score: Option<f64>,
}

impl RunSummary {
    pub fn from_run(run: &Run) -> Self {
        let final_attempt = run
            .final_artifact()
            .and_then(|artifact| run.attempts().get(artifact.attempt_index));
        let best = run.best_attempt();
        Self {
            run_id: run.run_id().to_string(),
            started_at: run.started_at().to_string(),
            finished_at: run.finished_at().to_string(),
            strategy: run.strategy().to_string(),
            verdict: run.verdict().as_str().to_string(),
            max_attempts: run.max_attempts() as u64,
            total_attempts: run.attempts().len() as u64,
            rendered_attempts: run.rendered_count() as u64,
            failed_attempts: run.failed_count() as u64,
            final_attempt: final_attempt.map(|attempt| attempt.index() as u64),
            final_similarity: final_attempt.and_then(|attempt| attempt.similarity_score()),
            final_aggregate: final_attempt.and_then(|attempt| attempt.aggregate_score()),
            best_attempt: best.map(|attempt| attempt.index() as u64),
            best_score: best.and_then(|attempt| attempt.ranking_score()),
        }
    }
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
