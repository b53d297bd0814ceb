use serde_json::json;
use sha2::{Digest, Sha256};

use super::{VisionBackend, VisionRequest, VisionResponse};
use crate::error::GenerationError;

/// Offline backend with deterministic canned answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunBackend;

impl DryrunBackend {
    pub fn new() -> Self {
        Self
    }
}

impl VisionBackend for DryrunBackend {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn complete(&self, request: &VisionRequest) -> Result<VisionResponse, GenerationError> {
        let text = match request.operation {
            "plan" => json!({
                "figure_type": "pipeline",
                "layout": "horizontal_flow",
                "elements": [
                    {"id": "e1", "type": "rect", "label": "Input", "position_hint": "left"},
                    {"id": "e2", "type": "rect", "label": "Output", "position_hint": "right of e1"}
                ],
                "connections": [{"from": "e1", "to": "e2", "type": "arrow"}],
                "color_scheme": "black outlines on white",
                "aesthetic_notes": "boxes share a baseline"
            })
            .to_string(),
            "critique" => json!({
                "scores": {
                    "completeness": 9,
                    "structural_match": 8,
                    "text_accuracy": 9,
                    "aesthetic_quality": 8,
                    "overall": 8.65
                },
                "issues": [{
                    "severity": "minor",
                    "category": "aesthetic",
                    "description": "arrow head slightly small",
                    "suggestion": "use >=Stealth"
                }],
                "pass": true
            })
            .to_string(),
            _ => format!(
                "```latex\n\\begin{{tikzpicture}}[box/.style={{draw, thick, minimum width=2cm, minimum height=1cm}}]\n  % dryrun {}\n  \\node[box] (e1) at (0,0) {{Input}};\n  \\node[box] (e2) at (3,0) {{Output}};\n  \\draw[->, thick] (e1) -- (e2);\n\\end{{tikzpicture}}\n```",
                short_id(&request.user)
            ),
        };
        Ok(VisionResponse {
            text,
            model: request.model.clone(),
        })
    }
}

fn short_id(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(&hasher.finalize()[..4])
}
