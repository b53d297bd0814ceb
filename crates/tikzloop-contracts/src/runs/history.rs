use similar::{ChangeTag, TextDiff};

use super::attempt::Attempt;

/// Unified diff of `curr` against `prev`, one entry per line. `None` for the first version.
pub fn source_diff(prev: Option<&str>, curr: &str) -> Option<Vec<String>> {
    let prev = prev?;
    let diff = TextDiff::from_lines(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    let lines = rendered
        .lines()
        .map(str::to_string)
        .collect::<Vec<String>>();
    Some(lines)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub inserted: usize,
    pub deleted: usize,
}

pub fn diff_stats(prev: &str, curr: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for change in TextDiff::from_lines(prev, curr).iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stats.inserted += 1,
            ChangeTag::Delete => stats.deleted += 1,
            ChangeTag::Equal => {}
        }
    }
    stats
}

/// Pairs every attempt with the diff against the attempt before it.
pub fn attempt_diffs(attempts: &[Attempt]) -> Vec<Option<Vec<String>>> {
    let mut prev: Option<&str> = None;
    attempts
        .iter()
        .map(|attempt| {
            let diff = source_diff(prev, attempt.source_code());
            prev = Some(attempt.source_code());
            diff
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{diff_stats, source_diff};

    #[test]
    fn first_version_has_no_diff() {
        assert!(source_diff(None, "\\draw (0,0);").is_none());
    }

    #[test]
    fn diff_marks_changed_lines() {
        let prev = "\\begin{tikzpicture}\n\\draw (0,0) -- (1,1);\n\\end{tikzpicture}\n";
        let curr = "\\begin{tikzpicture}\n\\draw[thick] (0,0) -- (1,1);\n\\end{tikzpicture}\n";
        let lines = source_diff(Some(prev), curr).unwrap_or_default();
        assert!(lines.iter().any(|line| line == "-\\draw (0,0) -- (1,1);"));
        assert!(lines.iter().any(|line| line == "+\\draw[thick] (0,0) -- (1,1);"));

        let stats = diff_stats(prev, curr);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.deleted, 1);
    }
}
