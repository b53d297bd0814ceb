use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tikzloop_contracts::runs::history::diff_stats;
use tikzloop_contracts::runs::Attempt;
use tikzloop_engine::RunRecord;

/// Similarity at or above this is highlighted in the attempt cards.
const HIGH_SIMILARITY: f64 = 0.9;

pub fn write_report(record: &RunRecord, out_path: &Path) -> Result<()> {
    let html_doc = render_report(record);
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(out_path, html_doc).with_context(|| format!("failed to write {}", out_path.display()))
}

pub fn render_report(record: &RunRecord) -> String {
    let run = &record.run;
    let final_index = run.final_artifact().map(|artifact| artifact.attempt_index);

    let mut cards = String::new();
    let mut prev_source: Option<&str> = None;
    for (position, attempt) in run.attempts().iter().enumerate() {
        let diff = record.diffs.get(position).cloned().flatten();
        cards.push_str(&attempt_card(
            attempt,
            prev_source,
            diff.as_deref(),
            final_index == Some(attempt.index()),
        ));
        prev_source = Some(attempt.source_code());
    }

    let original = image_tag(&record.original, "original");
    let final_image = record
        .final_image
        .as_deref()
        .map(|path| image_tag(path, "final"))
        .unwrap_or_else(|| "<div class='empty'>no final render</div>".to_string());
    let summary = format!(
        "<table class='summary'>\
         <tr><th>run</th><td>{run_id}</td></tr>\
         <tr><th>verdict</th><td class='verdict {verdict}'>{verdict}</td></tr>\
         <tr><th>strategy</th><td>{strategy}</td></tr>\
         <tr><th>attempts</th><td>{total} of {max} ({rendered} rendered, {failed} failed)</td></tr>\
         <tr><th>final attempt</th><td>{final_attempt}</td></tr>\
         <tr><th>target sha256</th><td><code>{sha}</code></td></tr>\
         <tr><th>started</th><td>{started}</td></tr>\
         <tr><th>finished</th><td>{finished}</td></tr>\
         </table>",
        run_id = escape_html(run.run_id()),
        verdict = run.verdict().as_str(),
        strategy = escape_html(run.strategy()),
        total = run.attempts().len(),
        max = run.max_attempts(),
        rendered = run.rendered_count(),
        failed = run.failed_count(),
        final_attempt = final_index
            .map(|index| index.to_string())
            .unwrap_or_else(|| "none".to_string()),
        sha = escape_html(&record.target_sha256),
        started = escape_html(run.started_at()),
        finished = escape_html(run.finished_at()),
    );
    let plan = run
        .plan()
        .map(|plan| {
            format!(
                "<p class='plan'>plan: {} with {} elements and {} connections</p>",
                escape_html(&plan.figure_type),
                plan.elements.len(),
                plan.connections.len()
            )
        })
        .unwrap_or_default();

    format!(
        "<!doctype html>\n<html>\n<head>\n  <meta charset='utf-8'>\n  <title>tikzloop report</title>\n  <style>\n    body {{ font-family: Arial, sans-serif; background: #f6f6f6; margin: 0; padding: 20px; }}\n    .pair {{ display: grid; grid-template-columns: 1fr 1fr; gap: 16px; margin-bottom: 24px; }}\n    .pair img, .card img {{ max-width: 100%; background: white; }}\n    .summary th {{ text-align: left; padding-right: 12px; color: #444; }}\n    .verdict.passed {{ color: #1a7f37; }}\n    .verdict.failed_quality {{ color: #9a6700; }}\n    .verdict.failed_compile {{ color: #cf222e; }}\n    .card {{ background: white; border-radius: 10px; padding: 12px; margin-bottom: 16px; box-shadow: 0 2px 8px rgba(0,0,0,0.08); }}\n    .card.final {{ border: 2px solid #1a7f37; }}\n    .score {{ font-weight: bold; }}\n    .score.high {{ color: #1a7f37; }}\n    .issue.major {{ color: #cf222e; }}\n    .empty {{ color: #888; font-style: italic; }}\n    pre {{ background: #f0f0f0; padding: 8px; overflow-x: auto; font-size: 12px; }}\n    .diff .add {{ color: #1a7f37; }}\n    .diff .del {{ color: #cf222e; }}\n  </style>\n</head>\n<body>\n  <h1>tikzloop run</h1>\n  {summary}\n  {plan}\n  <div class='pair'>\n    <div><h3>original</h3>{original}</div>\n    <div><h3>final</h3>{final_image}</div>\n  </div>\n  <h2>attempts</h2>\n  {cards}\n</body>\n</html>\n"
    )
}

fn attempt_card(
    attempt: &Attempt,
    prev_source: Option<&str>,
    diff: Option<&[String]>,
    is_final: bool,
) -> String {
    let outcome = attempt.render_outcome();
    let similarity = attempt
        .similarity_score()
        .map(|score| {
            let class = if score >= HIGH_SIMILARITY {
                "score high"
            } else {
                "score"
            };
            format!("<span class='{class}'>similarity {score:.4}</span>")
        })
        .unwrap_or_default();
    let aggregate = attempt
        .aggregate_score()
        .map(|score| format!(" <span class='score'>aggregate {score:.2}</span>"))
        .unwrap_or_default();

    let body = match outcome.raster() {
        Some(raster) => image_tag(&raster.path, "rendered"),
        None => format!(
            "<pre class='error'>{}</pre>",
            escape_html(&outcome.failure_text().unwrap_or_default())
        ),
    };

    let issues = attempt
        .critique()
        .map(|critique| {
            let items: String = critique
                .issues
                .iter()
                .map(|issue| {
                    let suggestion = issue
                        .suggestion
                        .as_deref()
                        .map(|text| format!(" → {}", escape_html(text)))
                        .unwrap_or_default();
                    format!(
                        "<li class='issue {severity}'>[{severity}/{category}] {description}{suggestion}</li>",
                        severity = issue.severity.as_str(),
                        category = issue.category.as_str(),
                        description = escape_html(&issue.description),
                    )
                })
                .collect();
            if items.is_empty() {
                "<p class='empty'>no issues reported</p>".to_string()
            } else {
                format!("<ul>{items}</ul>")
            }
        })
        .unwrap_or_default();

    let diff_block = match (prev_source, diff) {
        (Some(prev), Some(lines)) => {
            let stats = diff_stats(prev, attempt.source_code());
            let rendered: String = lines
                .iter()
                .map(|line| {
                    let class = if line.starts_with('+') && !line.starts_with("+++") {
                        "add"
                    } else if line.starts_with('-') && !line.starts_with("---") {
                        "del"
                    } else {
                        "ctx"
                    };
                    format!("<span class='{class}'>{}</span>\n", escape_html(line))
                })
                .collect();
            format!(
                "<details><summary>diff +{} -{}</summary><pre class='diff'>{rendered}</pre></details>",
                stats.inserted, stats.deleted
            )
        }
        _ => String::new(),
    };

    format!(
        "<div class='card{final_class}'><h3>attempt {index} <small>{label}</small></h3><div>{similarity}{aggregate}</div>{body}{issues}<details><summary>source</summary><pre>{source}</pre></details>{diff_block}</div>\n",
        final_class = if is_final { " final" } else { "" },
        index = attempt.index(),
        label = outcome.label(),
        source = escape_html(attempt.source_code()),
    )
}

fn image_tag(path: &Path, alt: &str) -> String {
    match fs::read(path) {
        Ok(bytes) => format!(
            "<img src='data:{};base64,{}' alt='{}'>",
            image_mime(path),
            BASE64.encode(bytes),
            escape_html(alt)
        ),
        Err(_) => format!(
            "<div class='empty'>missing {}</div>",
            escape_html(&path.display().to_string())
        ),
    }
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/png",
    }
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}
