//! Unified diff extraction
//!
//! Some models answer with unified diffs instead of operations. Each
//! `--- a/<path>` header starts a patch for that path; the patch runs until
//! the next header or the end of the response.

use regex_lite::Regex;
use std::sync::OnceLock;

/// Header line opening a patch
pub const DIFF_HEADER: &str = "--- a/";

/// A patch for one file, headers included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub diff: String,
}

fn hunk_header() -> &'static Regex {
    static HUNK: OnceLock<Regex> = OnceLock::new();
    HUNK.get_or_init(|| Regex::new(r"^@@ -\d+(,\d+)? \+\d+(,\d+)? @@").expect("valid regex"))
}

/// Split a model response into per-file patches
pub fn parse_unified_diffs(response: &str) -> Vec<FileDiff> {
    let mut patches = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in response.trim().lines() {
        if let Some(path) = line.strip_prefix(DIFF_HEADER) {
            if let Some((path, lines)) = current.take() {
                patches.push(FileDiff {
                    path,
                    diff: lines.join("\n"),
                });
            }
            current = Some((path.trim_end().to_string(), vec![line]));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }

    if let Some((path, lines)) = current {
        patches.push(FileDiff {
            path,
            diff: lines.join("\n"),
        });
    }

    patches
}

/// Whether a patch has both file headers and at least one hunk
pub fn is_valid_unified_diff(diff: &str) -> bool {
    let lines: Vec<&str> = diff.trim().lines().collect();
    if lines.len() < 3 {
        return false;
    }
    if !(lines[0].starts_with("--- ") && lines[1].starts_with("+++ ")) {
        return false;
    }
    lines[2..].iter().any(|line| hunk_header().is_match(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = "Here are the patches:\n\
--- a/docs/install.md\n\
+++ b/docs/install.md\n\
@@ -1,2 +1,2 @@\n\
 # Install\n\
-Use v1.0\n\
+Use v2.0\n\
--- a/docs/usage.md\n\
+++ b/docs/usage.md\n\
@@ -3 +3,2 @@ ## Usage\n\
 Call run.\n\
+Call stop.";

    #[test]
    fn test_split_per_file() {
        let patches = parse_unified_diffs(RESPONSE);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].path, "docs/install.md");
        assert!(patches[0].diff.starts_with("--- a/docs/install.md\n+++ b/docs/install.md"));
        assert!(patches[0].diff.ends_with("+Use v2.0"));
        assert_eq!(patches[1].path, "docs/usage.md");
        assert!(patches[1].diff.ends_with("+Call stop."));
    }

    #[test]
    fn test_validate() {
        for patch in parse_unified_diffs(RESPONSE) {
            assert!(is_valid_unified_diff(&patch.diff), "{}", patch.path);
        }
        assert!(!is_valid_unified_diff("--- a/x.md\n+++ b/x.md"));
        assert!(!is_valid_unified_diff("--- a/x.md\n+++ b/x.md\n just context"));
        assert!(!is_valid_unified_diff("+++ b/x.md\n--- a/x.md\n@@ -1 +1 @@"));
    }

    #[test]
    fn test_no_headers() {
        assert!(parse_unified_diffs("No changes needed.").is_empty());
    }
}
