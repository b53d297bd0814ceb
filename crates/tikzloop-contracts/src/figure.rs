//! Structured payloads exchanged with the generation service.
//!
//! Both types are deserialized strictly at the adapter boundary; nothing
//! downstream ever sees the raw response text.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Weighted rubric used to fold critique sub-scores into one aggregate.
pub const RUBRIC_WEIGHTS: [(&str, f64); 4] = [
    ("completeness", 0.30),
    ("structural_match", 0.25),
    ("text_accuracy", 0.20),
    ("aesthetic_quality", 0.15),
];

/// Granted to every critique: the figure rendered at all (0.10 weight at a full 10).
pub const COMPILABILITY_BONUS: f64 = 1.0;

pub const SUB_SCORE_MIN: f64 = 1.0;
pub const SUB_SCORE_MAX: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigurePlan {
    pub figure_type: String,
    #[serde(default)]
    pub layout: Option<String>,
    pub elements: Vec<PlanElement>,
    #[serde(default)]
    pub connections: Vec<PlanConnection>,
    #[serde(default)]
    pub color_scheme: Option<String>,
    #[serde(default)]
    pub aesthetic_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanElement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub position_hint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConnection {
    pub from: String,
    pub to: String,
    #[serde(rename = "type", default = "default_connection_kind")]
    pub kind: String,
}

impl FigurePlan {
    /// Rejects plans whose element graph does not hold together.
    pub fn validate(&self) -> Result<(), String> {
        if self.figure_type.trim().is_empty() {
            return Err("plan is missing figure_type".to_string());
        }
        let mut ids = HashSet::new();
        for element in &self.elements {
            if element.id.trim().is_empty() {
                return Err("plan element has an empty id".to_string());
            }
            if !ids.insert(element.id.as_str()) {
                return Err(format!("duplicate plan element id '{}'", element.id));
            }
        }
        for connection in &self.connections {
            for endpoint in [&connection.from, &connection.to] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(format!(
                        "connection references unknown element '{endpoint}'"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Only `major` blocks a pass. Any other label, in any case, reads as minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    Minor,
    Major,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Structural,
    Text,
    Aesthetic,
    MissingElement,
    #[default]
    #[serde(other)]
    Other,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
        }
    }
}

impl From<String> for Severity {
    fn from(raw: String) -> Self {
        if raw.trim().eq_ignore_ascii_case("major") {
            Self::Major
        } else {
            Self::Minor
        }
    }
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structural => "structural",
            Self::Text => "text",
            Self::Aesthetic => "aesthetic",
            Self::MissingElement => "missing_element",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    #[serde(default)]
    pub category: IssueCategory,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RubricScores {
    pub completeness: f64,
    pub structural_match: f64,
    pub text_accuracy: f64,
    pub aesthetic_quality: f64,
}

impl RubricScores {
    pub fn get(&self, key: &str) -> Option<f64> {
        match key {
            "completeness" => Some(self.completeness),
            "structural_match" => Some(self.structural_match),
            "text_accuracy" => Some(self.text_accuracy),
            "aesthetic_quality" => Some(self.aesthetic_quality),
            _ => None,
        }
    }

    fn clamped(self) -> Self {
        let clamp = |value: f64| value.clamp(SUB_SCORE_MIN, SUB_SCORE_MAX);
        Self {
            completeness: clamp(self.completeness),
            structural_match: clamp(self.structural_match),
            text_accuracy: clamp(self.text_accuracy),
            aesthetic_quality: clamp(self.aesthetic_quality),
        }
    }

    fn all_finite(&self) -> bool {
        [
            self.completeness,
            self.structural_match,
            self.text_accuracy,
            self.aesthetic_quality,
        ]
        .iter()
        .all(|value| value.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub scores: RubricScores,
    #[serde(default)]
    pub issues: Vec<Issue>,
}

impl Critique {
    /// Clamps sub-scores into the rubric range. Non-finite scores are rejected.
    pub fn normalized(self) -> Result<Self, String> {
        if !self.scores.all_finite() {
            return Err("critique contains a non-finite sub-score".to_string());
        }
        Ok(Self {
            scores: self.scores.clamped(),
            issues: self.issues,
        })
    }

    pub fn aggregate(&self) -> f64 {
        RUBRIC_WEIGHTS
            .iter()
            .map(|(key, weight)| self.scores.get(key).unwrap_or(0.0) * weight)
            .sum::<f64>()
            + COMPILABILITY_BONUS
    }

    pub fn has_major_issue(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == Severity::Major)
    }

    pub fn passes(&self, pass_threshold: f64) -> bool {
        self.aggregate() >= pass_threshold && !self.has_major_issue()
    }
}

fn default_connection_kind() -> String {
    "arrow".to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Critique, FigurePlan, IssueCategory, Severity};

    fn critique(scores: [f64; 4], issues: serde_json::Value) -> Critique {
        serde_json::from_value(json!({
            "scores": {
                "completeness": scores[0],
                "structural_match": scores[1],
                "text_accuracy": scores[2],
                "aesthetic_quality": scores[3],
                "overall": 99.0,
            },
            "issues": issues,
            "pass": true,
        }))
        .expect("critique fixture")
    }

    #[test]
    fn aggregate_applies_weights_and_compilability_bonus() {
        let perfect = critique([10.0, 10.0, 10.0, 10.0], json!([]));
        assert!((perfect.aggregate() - 10.0).abs() < 1e-9);

        let mixed = critique([8.0, 6.0, 10.0, 4.0], json!([]));
        let expected = 0.30 * 8.0 + 0.25 * 6.0 + 0.20 * 10.0 + 0.15 * 4.0 + 1.0;
        assert!((mixed.aggregate() - expected).abs() < 1e-9);
    }

    #[test]
    fn major_issue_blocks_pass_even_with_high_score() {
        let blocked = critique(
            [10.0, 10.0, 10.0, 10.0],
            json!([{"severity": "major", "category": "missing_element", "description": "arrow"}]),
        );
        assert!(!blocked.passes(8.0));
        assert!(blocked.has_major_issue());
        assert_eq!(blocked.issues[0].severity, Severity::Major);
        assert_eq!(blocked.issues[0].category, IssueCategory::MissingElement);

        let minor_only = critique(
            [9.0, 9.0, 9.0, 9.0],
            json!([{"severity": "minor", "category": "spacing"}]),
        );
        assert!(minor_only.passes(8.0));
        assert_eq!(minor_only.issues[0].category, IssueCategory::Other);
    }

    #[test]
    fn normalized_clamps_out_of_range_scores() -> Result<(), String> {
        let loud = critique([42.0, 0.0, 5.0, -3.0], json!([])).normalized()?;
        assert_eq!(loud.scores.completeness, 10.0);
        assert_eq!(loud.scores.structural_match, 1.0);
        assert_eq!(loud.scores.aesthetic_quality, 1.0);
        Ok(())
    }

    #[test]
    fn severity_labels_are_case_insensitive() -> anyhow::Result<()> {
        let parsed = critique(
            [9.0, 9.0, 9.0, 9.0],
            json!([
                {"severity": "Minor"},
                {"severity": " MINOR "},
                {"severity": "critical"},
            ]),
        );
        assert!(parsed
            .issues
            .iter()
            .all(|issue| issue.severity == Severity::Minor));
        assert!(parsed.passes(8.0));

        let blocked = critique([9.0, 9.0, 9.0, 9.0], json!([{"severity": "Major"}]));
        assert!(blocked.has_major_issue());
        assert!(!blocked.passes(8.0));
        assert_eq!(
            serde_json::to_value(blocked.issues[0].severity)?,
            json!("major")
        );
        Ok(())
    }

    #[test]
    fn issue_without_severity_is_rejected() {
        let parsed = serde_json::from_value::<Critique>(json!({
            "scores": {"completeness": 5, "structural_match": 5, "text_accuracy": 5, "aesthetic_quality": 5},
            "issues": [{"description": "no label"}],
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn plan_validation_catches_dangling_connections() {
        let plan: FigurePlan = serde_json::from_value(json!({
            "figure_type": "pipeline",
            "layout": "horizontal_flow",
            "elements": [
                {"id": "e1", "type": "rect", "label": "Input"},
                {"id": "e2", "type": "rect", "label": "Output"}
            ],
            "connections": [{"from": "e1", "to": "e3"}],
        }))
        .expect("plan fixture");
        assert_eq!(plan.connections[0].kind, "arrow");
        assert_eq!(
            plan.validate(),
            Err("connection references unknown element 'e3'".to_string())
        );
    }

    #[test]
    fn plan_without_elements_field_does_not_parse() {
        let parsed = serde_json::from_value::<FigurePlan>(json!({"figure_type": "graph"}));
        assert!(parsed.is_err());
    }
}
