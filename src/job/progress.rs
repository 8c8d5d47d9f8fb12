/// Classification of one line of worker stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine {
    /// The whole trimmed line was a base-10 non-negative integer.
    Progress(u64),
    /// Anything else: banners, summaries, blank lines.
    Diagnostic(String),
}

/// Classify a single line of worker output.
///
/// Only a line that is *entirely* a count (after trimming) is progress;
/// `"42 items"`, `"-1"` and `"+3"` are diagnostics.
pub fn parse_line(line: &str) -> WorkerLine {
    let trimmed = line.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(count) = trimmed.parse::<u64>() {
            return WorkerLine::Progress(count);
        }
    }
    WorkerLine::Diagnostic(trimmed.to_string())
}
