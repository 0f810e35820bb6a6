//! Text splitting used to pace agent-to-agent exchanges.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How outbound text is cut into batches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Fixed-size groups of non-blank lines.
    #[default]
    Lines,
    /// Sections that start with a numbered heading ("1.", "2)", "3:" ...),
    /// falling back to line batches when fewer than two headings exist.
    Numbered,
}

/// Split text into batches of `size` consecutive non-blank lines.
///
/// Trailing whitespace is trimmed from every line and blank lines are dropped.
/// A line is never split; the last batch may be shorter. Text without any
/// non-blank line yields no batches.
///
/// # Examples
///
/// ```
/// use copilot_hub::core::chunking::make_line_batches;
///
/// let batches = make_line_batches("a\nb\n\nc", 2);
/// assert_eq!(batches, vec!["a\nb".to_string(), "c".to_string()]);
/// ```
pub fn make_line_batches(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let lines: Vec<&str> = text
        .lines()
        .map(|l| l.trim_end())
        .filter(|l| !l.is_empty())
        .collect();

    lines.chunks(size).map(|chunk| chunk.join("\n")).collect()
}

/// Split text into sections that each begin with a numbered heading.
///
/// Returns `None` when fewer than two headings are present.
pub fn split_by_numbering(text: &str) -> Option<Vec<String>> {
    let heading = Regex::new(r"^\s*\d{1,3}[.):\-–—]\s+").ok()?;

    let mut sections = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut headings = 0;

    for line in text.lines() {
        if heading.is_match(line) {
            headings += 1;
            if !current.is_empty() {
                sections.push(current.join("\n"));
            }
            current = vec![line];
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        sections.push(current.join("\n"));
    }

    if headings < 2 {
        return None;
    }

    Some(
        sections
            .into_iter()
            .map(|s| s.trim_matches('\n').to_string())
            .filter(|s| !s.trim().is_empty())
            .collect(),
    )
}

/// Batch text according to `mode`.
pub fn make_batches(text: &str, size: usize, mode: BatchMode) -> Vec<String> {
    match mode {
        BatchMode::Lines => make_line_batches(text, size),
        BatchMode::Numbered => {
            split_by_numbering(text).unwrap_or_else(|| make_line_batches(text, size))
        }
    }
}
