use std::sync::OnceLock;

use regex::Regex;

use crate::types::{ContextLine, DiffLine};

/// The three line projections extracted from one file's unified-diff patch.
#[derive(Debug, Clone, Default)]
pub struct ParsedPatch {
    pub added_lines: Vec<DiffLine>,
    pub removed_lines: Vec<DiffLine>,
    pub context_lines: Vec<ContextLine>,
}

fn hunk_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"@@\s*-(\d+)(?:,\d+)?\s*\+(\d+)(?:,\d+)?\s*@@").unwrap()
    })
}

/// Parse a unified-diff patch into added/removed/context projections.
///
/// Hunk headers `@@ -a,b +c,d @@` reset both line counters. `+` lines (not
/// `+++`) advance only the new counter, `-` lines (not `---`) only the old
/// counter; everything else is context and advances both.
pub fn parse_patch(patch: &str) -> ParsedPatch {
    let mut parsed = ParsedPatch::default();
    let mut old_line: u32 = 0;
    let mut new_line: u32 = 0;

    for line in patch.split('\n') {
        if line.starts_with("@@") {
            if let Some(caps) = hunk_header().captures(line) {
                old_line = caps[1].parse().unwrap_or(0);
                new_line = caps[2].parse().unwrap_or(0);
            }
            continue;
        }
        if line.starts_with('+') && !line.starts_with("+++") {
            parsed.added_lines.push(DiffLine {
                line_number: new_line,
                content: line[1..].to_string(),
            });
            new_line += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            parsed.removed_lines.push(DiffLine {
                line_number: old_line,
                content: line[1..].to_string(),
            });
            old_line += 1;
        } else {
            let content = line.strip_prefix(' ').unwrap_or(line);
            parsed.context_lines.push(ContextLine {
                old_line_number: old_line,
                new_line_number: new_line,
                content: content.to_string(),
            });
            old_line += 1;
            new_line += 1;
        }
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_hunk() {
        let patch = "@@ -10,2 +10,3 @@\n ctx\n-old\n+new1\n+new2";
        let parsed = parse_patch(patch);

        assert_eq!(parsed.added_lines.len(), 2);
        assert_eq!(parsed.added_lines[0].line_number, 11);
        assert_eq!(parsed.added_lines[0].content, "new1");
        assert_eq!(parsed.added_lines[1].line_number, 12);
        assert_eq!(parsed.added_lines[1].content, "new2");

        assert_eq!(parsed.removed_lines.len(), 1);
        assert_eq!(parsed.removed_lines[0].line_number, 11);
        assert_eq!(parsed.removed_lines[0].content, "old");

        assert_eq!(parsed.context_lines.len(), 1);
        assert_eq!(parsed.context_lines[0].old_line_number, 10);
        assert_eq!(parsed.context_lines[0].new_line_number, 10);
        assert_eq!(parsed.context_lines[0].content, "ctx");
    }

    #[test]
    fn header_without_counts_is_accepted() {
        let patch = "@@ -1 +1 @@\n-a\n+b";
        let parsed = parse_patch(patch);
        assert_eq!(parsed.removed_lines[0].line_number, 1);
        assert_eq!(parsed.added_lines[0].line_number, 1);
    }

    #[test]
    fn multiple_hunks_reset_counters() {
        let patch = "@@ -1,1 +1,1 @@\n+first\n@@ -50,1 +60,1 @@\n+second";
        let parsed = parse_patch(patch);
        assert_eq!(parsed.added_lines[0].line_number, 1);
        assert_eq!(parsed.added_lines[1].line_number, 60);
    }

    #[test]
    fn file_markers_are_not_line_changes() {
        let patch = "--- a/f.py\n+++ b/f.py\n@@ -1,1 +1,1 @@\n+x";
        let parsed = parse_patch(patch);
        assert_eq!(parsed.added_lines.len(), 1);
        assert_eq!(parsed.removed_lines.len(), 0);
        // The ---/+++ markers fall through to context.
        assert_eq!(parsed.context_lines.len(), 2);
    }

    #[test]
    fn context_lines_are_contiguous_and_increasing_within_hunk() {
        let patch = "@@ -5,4 +5,4 @@\n a\n b\n-c\n+C\n d";
        let parsed = parse_patch(patch);
        let olds: Vec<u32> = parsed.context_lines.iter().map(|c| c.old_line_number).collect();
        let news: Vec<u32> = parsed.context_lines.iter().map(|c| c.new_line_number).collect();
        assert_eq!(olds, vec![5, 6, 8]);
        assert_eq!(news, vec![5, 6, 8]);
        for w in olds.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn empty_patch_yields_nothing_added() {
        let parsed = parse_patch("");
        assert!(parsed.added_lines.is_empty());
        assert!(parsed.removed_lines.is_empty());
    }
}
