//! Prompt templates for the four generation operations.

pub const PLANNER_SYSTEM: &str = r#"You analyze scientific and technical figures and describe them so that a TikZ code generator can rebuild them.

Pay close attention to alignment, symmetry and spacing. When elements look intended to be evenly spaced or aligned but are slightly off, describe the intended layout rather than the imperfect one.

Return ONLY a JSON object (no markdown fences) with this shape:
{
  "figure_type": "pipeline | architecture | state_diagram | comparison | graph | other",
  "layout": "horizontal_flow | vertical_flow | grid | freeform",
  "elements": [
    {
      "id": "e1",
      "type": "rect | circle | arrow | text | curve | shaded_region | diamond",
      "label": "text content or empty string",
      "position_hint": "where this element sits relative to the others"
    }
  ],
  "connections": [
    {"from": "e1", "to": "e2", "type": "arrow | line | dashed_arrow | bidirectional"}
  ],
  "color_scheme": "colors used and what they mean",
  "aesthetic_notes": "alignment, spacing and style intent"
}"#;

const PLANNER_USER: &str = "Describe the figure in the image as the JSON object above. \
List every visual element with its label, the layout, the connections and the aesthetic properties.";

const PLANNER_CLEAN_SUFFIX: &str = "Also note where alignment, symmetry or spacing could be \
improved even if the input is imperfect, and flag elements that look meant to be uniformly \
spaced or aligned but are not.";

pub fn planner_user(clean: bool) -> String {
    if clean {
        format!("{PLANNER_USER}\n\n{PLANNER_CLEAN_SUFFIX}")
    } else {
        PLANNER_USER.to_string()
    }
}

pub const GENERATOR_SYSTEM: &str = r#"You are an expert TikZ programmer. Given the original figure image and, when available, a structured plan of it, write TikZ code that recreates the figure as closely as possible.

Rules:
- Output ONLY the \begin{tikzpicture}...\end{tikzpicture} block.
- No \documentclass, \usepackage or other preamble lines.
- Define every style inside the picture (\tikzset{} or picture options).
- Use standard anchors only (north, south, east, west, center, north west, ...).
- Do not rely on tikz-cd or macros from external preambles.
- Prefer relative positioning (right=of, below=of); use calc for precise offsets.
- Use \tikzmath{\name=value;} for repeated numeric constants.
- Draw fills before borders so outlines stay visible.
- Use fit nodes for group frames and -| or |- paths for corner routing.
- Wrap the answer in a ```latex code fence."#;

pub fn generator_user(plan_json: Option<&str>, preamble: &str) -> String {
    let preamble_section = if preamble.trim().is_empty() {
        "(no custom preamble; use standard TikZ only)"
    } else {
        preamble.trim()
    };
    let plan_section = match plan_json {
        Some(plan) => format!("Structured plan of the figure:\n\n<plan>\n{plan}\n</plan>\n\n"),
        None => "No structured plan is available; work from the image alone.\n\n".to_string(),
    };
    format!(
        "{plan_section}These preamble definitions are available:\n\n<preamble>\n{preamble_section}\n</preamble>\n\n\
         Produce the TikZ code for this figure. Output only the \\begin{{tikzpicture}}...\\end{{tikzpicture}} \
         block inside a ```latex code fence."
    )
}

pub const EVALUATOR_SYSTEM: &str = r#"You evaluate TikZ renderings against the figure they were meant to reproduce. The first image is the original input, the second is the rendered TikZ output.

Be specific. Vague feedback such as "looks off" is not actionable. Output the JSON object directly with no prose before it.

overall = 0.30*completeness + 0.25*structural_match + 0.20*text_accuracy + 0.15*aesthetic_quality + 0.10*10
(compilability is always 10 because you are looking at a rendered output)

Return ONLY JSON (no markdown fences):
{
  "scores": {
    "completeness": <1-10, are all elements present?>,
    "structural_match": <1-10, do layout and proportions match?>,
    "text_accuracy": <1-10, are labels correct?>,
    "aesthetic_quality": <1-10, is it clean and publication-ready?>,
    "overall": <weighted average>
  },
  "issues": [
    {
      "severity": "major | minor",
      "category": "structural | text | aesthetic | missing_element",
      "description": "what exactly is wrong",
      "suggestion": "concrete TikZ fix"
    }
  ],
  "pass": <true when overall >= 8 and there are no major issues>
}"#;

pub const EVALUATOR_USER: &str = "The first image is the original figure and the second is the \
TikZ rendering. Assess how well the rendering reproduces the original and answer with the JSON object.";

pub const REFINER_SYSTEM: &str = r#"You are an expert TikZ programmer refining existing code from an evaluator's critique.

Rules:
- Make targeted edits; do not rewrite from scratch.
- The current code compiles, so keep its overall structure.
- Address only the issues listed in the critique.
- Output ONLY the updated \begin{tikzpicture}...\end{tikzpicture} block in a ```latex code fence."#;

pub fn refiner_user(source_code: &str, critique_json: &str) -> String {
    format!(
        "Current TikZ code:\n\n<current_code>\n{source_code}\n</current_code>\n\n\
         Evaluator critique with the issues to fix:\n\n<critique>\n{critique_json}\n</critique>\n\n\
         Make targeted edits for these issues and return the updated \
         \\begin{{tikzpicture}}...\\end{{tikzpicture}} block in a ```latex code fence."
    )
}

pub const VISUAL_REFINER_SYSTEM: &str = r#"You refine TikZ code so its rendering matches a target diagram.

You receive the ORIGINAL target diagram, the RENDERED output of the current code, and the current code. Compare the two images, find the differences (position, size, color, line style, text) and return corrected code that matches the original more closely.

Rules:
- Output ONLY the corrected \begin{tikzpicture}...\end{tikzpicture} block in a ```latex code fence.
- No document boilerplate.
- Fix the most significant visual differences first."#;

pub fn visual_refiner_user(source_code: &str) -> String {
    format!(
        "Current TikZ code:\n\n<current_code>\n{source_code}\n</current_code>\n\n\
         Compare the ORIGINAL image with the RENDERED image and return corrected TikZ code."
    )
}

pub const COMPILE_FIX_SYSTEM: &str = r#"You are an expert TikZ programmer. The code below failed to compile with pdflatex. Fix the error with the smallest possible change.

Rules:
- Change only what the compilation error requires.
- Do not restructure or improve unrelated code.
- Output ONLY the fixed \begin{tikzpicture}...\end{tikzpicture} block in a ```latex code fence."#;

pub fn compile_fix_user(source_code: &str, diagnostic: &str) -> String {
    format!(
        "This TikZ code failed to compile:\n\n<code>\n{source_code}\n</code>\n\n\
         The compiler error:\n\n<error>\n{diagnostic}\n</error>\n\n\
         Fix the error and return the corrected \\begin{{tikzpicture}}...\\end{{tikzpicture}} \
         block in a ```latex code fence."
    )
}
