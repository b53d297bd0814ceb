//! Per-run structured event log (`events.jsonl`).
//!
//! Every line is one compact JSON object carrying `type`, `run_id` and `ts`
//! followed by the event's own fields. Event kinds form a closed set.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Keys owned by the log itself; payload entries with these names are dropped.
const RESERVED_KEYS: [&str; 3] = ["type", "run_id", "ts"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    PlanCreated,
    PlanRejected,
    ArtifactGenerated,
    AttemptRecorded,
    CritiqueRejected,
    RefineRequested,
    RunFinished,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        Self::RunStarted,
        Self::PlanCreated,
        Self::PlanRejected,
        Self::ArtifactGenerated,
        Self::AttemptRecorded,
        Self::CritiqueRejected,
        Self::RefineRequested,
        Self::RunFinished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::PlanCreated => "plan_created",
            Self::PlanRejected => "plan_rejected",
            Self::ArtifactGenerated => "artifact_generated",
            Self::AttemptRecorded => "attempt_recorded",
            Self::CritiqueRejected => "critique_rejected",
            Self::RefineRequested => "refine_requested",
            Self::RunFinished => "run_finished",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| format!("unknown event kind '{raw}'"))
    }
}

/// Event log of exactly one run. Opening it truncates whatever a previous
/// run left at the same path.
#[derive(Debug)]
pub struct EventLog {
    run_id: String,
    file: Mutex<File>,
}

impl EventLog {
    pub fn create(path: impl Into<PathBuf>, run_id: impl Into<String>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            run_id: run_id.into(),
            file: Mutex::new(file),
        })
    }

    pub fn record(&self, kind: EventKind, payload: EventPayload) -> io::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        event.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        event.extend(
            payload
                .into_iter()
                .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str())),
        );

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("event log lock poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(Value::Object(event))
    }
}

/// Parses an `events.jsonl` file. A missing file reads as empty; unparseable
/// lines are skipped.
pub fn read_events(path: &Path) -> io::Result<Vec<Value>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect())
}

/// Kinds of the events in `path`, in append order.
pub fn read_event_kinds(path: &Path) -> io::Result<Vec<EventKind>> {
    Ok(read_events(path)?
        .iter()
        .filter_map(|row| row.get("type").and_then(Value::as_str))
        .filter_map(|raw| raw.parse().ok())
        .collect())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
