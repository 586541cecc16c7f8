//! Conflict detection logic.
//!
//! A change carries the text it expects to replace. The detector verifies
//! that expectation against the file as it is now: at the declared line
//! range when one is given, otherwise as a fragment that must occur exactly
//! once. A mismatch becomes a [`Conflict`]; a change whose new text is
//! already in place is reported as already applied.

use tracing::debug;

use super::lines::LineIndex;
use super::text;
use super::types::{Conflict, ConflictType, Severity};
use crate::errors::ChangeError;
use crate::models::{Change, ChangeKind};

/// Lines of context captured on each side of a conflict.
const CONTEXT_LINES: usize = 3;

/// Where a change applies, as a byte range into the current text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub start: usize,
    pub end: usize,
    /// 1-indexed line of `start`.
    pub line: usize,
    /// Pure insertion: the new text goes in as whole lines at `start`.
    pub insertion: bool,
}

/// Verdict for one change against the current text.
#[derive(Debug, Clone)]
pub enum ChangeCheck {
    /// Expected content found; replace `location` with the new content.
    Clean(Location),
    /// The new content is already present.
    AlreadyApplied,
    /// Expected content differs from what the file holds at `location`.
    Conflict {
        conflict: Box<Conflict>,
        location: Location,
    },
}

/// Stateless detector.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Check a single change against `text`.
    ///
    /// `line_offset` shifts the declared range to account for earlier
    /// changes in the same file that added or removed lines.
    pub fn check_change(
        path: &str,
        text: &str,
        change: &Change,
        line_offset: isize,
        breaking: bool,
    ) -> Result<ChangeCheck, ChangeError> {
        let old = strip_terminator(&change.old_content);
        let new = strip_terminator(&change.new_content);

        if change.has_range() {
            Self::check_range(path, text, change, old, new, line_offset, breaking)
        } else {
            Self::check_fragment(path, text, change, old, new, breaking)
        }
    }

    fn check_range(
        path: &str,
        text: &str,
        change: &Change,
        old: &str,
        new: &str,
        line_offset: isize,
        breaking: bool,
    ) -> Result<ChangeCheck, ChangeError> {
        let index = LineIndex::build(text);
        let start = shift(change.line_start, line_offset);
        let end = shift(change.line_end.max(change.line_start), line_offset);
        let out_of_bounds = || ChangeError::LineRange {
            path: path.to_string(),
            start,
            end,
            len: index.line_count(),
        };

        if old.is_empty() {
            // Insertion before `start`; one past the last line appends.
            if start == index.line_count() + 1 {
                return Ok(ChangeCheck::Clean(Location {
                    start: text.len(),
                    end: text.len(),
                    line: start,
                    insertion: true,
                }));
            }
            let at = index.start_byte_of_line(start).ok_or_else(out_of_bounds)?;
            let span = new.lines().count();
            let last = start + span.saturating_sub(1);
            let in_place = span > 0
                && index
                    .byte_range(start, last, text)
                    .is_some_and(|(s, e)| lines_equal(&text[s..e], new));
            if in_place {
                return Ok(ChangeCheck::AlreadyApplied);
            }
            return Ok(ChangeCheck::Clean(Location {
                start: at,
                end: at,
                line: start,
                insertion: true,
            }));
        }

        let (s, e) = index.byte_range(start, end, text).ok_or_else(out_of_bounds)?;
        let region = &text[s..e];

        if lines_equal(region, old) {
            return Ok(ChangeCheck::Clean(Location {
                start: s,
                end: e,
                line: start,
                insertion: false,
            }));
        }

        // The generator may pin a line range but only quote the part of it
        // that changes.
        if let [pos] = *bounded_positions(region, old).as_slice() {
            return Ok(ChangeCheck::Clean(Location {
                start: s + pos,
                end: s + pos + old.len(),
                line: start + region[..pos].matches('\n').count(),
                insertion: false,
            }));
        }

        if is_applied(region, old, new) {
            debug!(path, line = start, "change already applied");
            return Ok(ChangeCheck::AlreadyApplied);
        }

        let location = Location {
            start: s,
            end: e,
            line: start,
            insertion: false,
        };
        let conflict = build_conflict(path, text, &index, location, region, new, change, breaking);
        Ok(ChangeCheck::Conflict {
            conflict: Box::new(conflict),
            location,
        })
    }

    fn check_fragment(
        path: &str,
        text: &str,
        change: &Change,
        old: &str,
        new: &str,
        breaking: bool,
    ) -> Result<ChangeCheck, ChangeError> {
        let index = LineIndex::build(text);

        if old.is_empty() {
            if !new.is_empty() && ends_with_lines(text, new) {
                return Ok(ChangeCheck::AlreadyApplied);
            }
            return Ok(ChangeCheck::Clean(Location {
                start: text.len(),
                end: text.len(),
                line: index.line_count() + 1,
                insertion: true,
            }));
        }

        match *bounded_positions(text, old).as_slice() {
            [pos] => {
                return Ok(ChangeCheck::Clean(Location {
                    start: pos,
                    end: pos + old.len(),
                    line: index.line_of_byte(pos),
                    insertion: false,
                }));
            }
            [] => {}
            ref many => {
                return Err(ChangeError::AmbiguousMatch {
                    path: path.to_string(),
                    occurrences: many.len(),
                })
            }
        }

        // Fall back to the first line that still contains the fragment's
        // leading line; the block below it is what drifted.
        let anchor = old.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
        let hit = (1..=index.line_count()).find(|&n| {
            index
                .byte_range(n, n, text)
                .map(|(s, e)| text[s..e].contains(anchor))
                .unwrap_or(false)
        });

        let Some(first) = hit else {
            return Err(ChangeError::FragmentNotFound {
                path: path.to_string(),
            });
        };

        let span = old.lines().count().max(1);
        let last = (first + span - 1).min(index.line_count());
        let (s, e) = index
            .byte_range(first, last, text)
            .ok_or_else(|| ChangeError::FragmentNotFound {
                path: path.to_string(),
            })?;
        let region = &text[s..e];
        // Only the anchored region counts; the new text elsewhere in the
        // file says nothing about this change.
        if is_applied(region, old, new) {
            debug!(path, line = first, "change already applied");
            return Ok(ChangeCheck::AlreadyApplied);
        }

        let location = Location {
            start: s,
            end: e,
            line: first,
            insertion: false,
        };
        let conflict = build_conflict(path, text, &index, location, region, new, change, breaking);
        Ok(ChangeCheck::Conflict {
            conflict: Box::new(conflict),
            location,
        })
    }
}

/// Pick the conflict category for a pair of texts.
pub fn classify(current: &str, incoming: &str) -> ConflictType {
    if !text::brackets_balanced(current) || !text::brackets_balanced(incoming) {
        return ConflictType::Syntactic;
    }
    if text::structural_token_count(current) != text::structural_token_count(incoming) {
        return ConflictType::Structural;
    }
    let declares = |s: &str| text::has_function_declaration(s) || text::has_variable_declaration(s);
    if declares(current) || declares(incoming) {
        return ConflictType::Semantic;
    }
    ConflictType::Content
}

/// Severity policy for a mismatch.
pub fn assess_severity(current: &str, incoming: &str, change: &Change, breaking: bool) -> Severity {
    if breaking && change.kind == ChangeKind::Api {
        return Severity::Critical;
    }
    if text::differs_only_in_whitespace(current, incoming) {
        return Severity::Low;
    }
    if change.kind == ChangeKind::Api || change.confidence < 0.5 {
        return Severity::High;
    }
    Severity::Medium
}

#[allow(clippy::too_many_arguments)]
fn build_conflict(
    path: &str,
    text: &str,
    index: &LineIndex,
    location: Location,
    current: &str,
    incoming: &str,
    change: &Change,
    breaking: bool,
) -> Conflict {
    let span = current.lines().count().max(1);
    let first = location.line.saturating_sub(CONTEXT_LINES).max(1);
    let last = (location.line + span - 1 + CONTEXT_LINES).min(index.line_count());
    let context_text = index
        .byte_range(first, last, text)
        .map(|(s, e)| text[s..e].to_string())
        .unwrap_or_default();

    let kind = classify(current, incoming);
    let mut conflict = Conflict::new(path, kind, location.line, current, incoming);
    conflict.context_text = context_text;
    conflict.severity = assess_severity(current, incoming, change, breaking);
    conflict.confidence = change.confidence;
    conflict
}

fn shift(line: usize, offset: isize) -> usize {
    (line as isize + offset).max(0) as usize
}

/// Drop a single trailing line terminator.
pub(crate) fn strip_terminator(s: &str) -> &str {
    s.strip_suffix('\n')
        .map(|s| s.strip_suffix('\r').unwrap_or(s))
        .unwrap_or(s)
}

/// Whether `region` already holds `new` in place of `old`: the whole region
/// equals `new`, or `new` occurs exactly once as a complete token run and
/// `old` no longer does.
fn is_applied(region: &str, old: &str, new: &str) -> bool {
    if new.is_empty() {
        return false;
    }
    if lines_equal(region, new) {
        return true;
    }
    bounded_occurrences(region, new) == 1 && bounded_occurrences(region, old) == 0
}

/// Byte offsets of `needle` in `hay` where it is not glued to a
/// neighbouring identifier or version character, so `version = 2` is not
/// found inside `version = 25`.
fn bounded_positions(hay: &str, needle: &str) -> Vec<usize> {
    if needle.is_empty() {
        return Vec::new();
    }
    let glued = |c: char| c.is_alphanumeric() || matches!(c, '_' | '.' | '-');
    let starts_glued = needle.chars().next().is_some_and(glued);
    let ends_glued = needle.chars().next_back().is_some_and(glued);
    hay.match_indices(needle)
        .map(|(pos, _)| pos)
        .filter(|&pos| {
            let before = hay[..pos].chars().next_back();
            let after = hay[pos + needle.len()..].chars().next();
            !(starts_glued && before.is_some_and(glued))
                && !(ends_glued && after.is_some_and(glued))
        })
        .collect()
}

fn bounded_occurrences(hay: &str, needle: &str) -> usize {
    bounded_positions(hay, needle).len()
}

/// Whether the last lines of `text` equal `tail`.
fn ends_with_lines(text: &str, tail: &str) -> bool {
    let want = tail.lines().count();
    let have: Vec<&str> = text.lines().collect();
    want > 0 && have.len() >= want && lines_equal(&have[have.len() - want..].join("\n"), tail)
}

/// Line-wise equality ignoring trailing whitespace.
fn lines_equal(a: &str, b: &str) -> bool {
    let mut la = a.lines();
    let mut lb = b.lines();
    loop {
        match (la.next(), lb.next()) {
            (None, None) => return true,
            (Some(x), Some(y)) if x.trim_end() == y.trim_end() => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(old: &str, new: &str, start: usize, end: usize) -> Change {
        Change {
            old_content: old.into(),
            new_content: new.into(),
            line_start: start,
            line_end: end,
            kind: ChangeKind::Dependency,
            reason: String::new(),
            confidence: 0.9,
        }
    }

    const MANIFEST: &str =
        "[package]\nname = \"demo\"\n\n[dependencies]\nserde = \"1.0.100\"\ntokio = \"1.0\"\n";

    #[test]
    fn test_range_match_is_clean() {
        let c = change("serde = \"1.0.100\"", "serde = \"1.0.200\"", 5, 5);
        match ConflictDetector::check_change("Cargo.toml", MANIFEST, &c, 0, false).unwrap() {
            ChangeCheck::Clean(loc) => {
                assert_eq!(&MANIFEST[loc.start..loc.end], "serde = \"1.0.100\"");
                assert_eq!(loc.line, 5);
            }
            other => panic!("expected clean, got {:?}", other),
        }
    }

    #[test]
    fn test_range_partial_fragment() {
        let c = change("1.0.100", "1.0.200", 5, 5);
        match ConflictDetector::check_change("Cargo.toml", MANIFEST, &c, 0, false).unwrap() {
            ChangeCheck::Clean(loc) => assert_eq!(&MANIFEST[loc.start..loc.end], "1.0.100"),
            other => panic!("expected clean, got {:?}", other),
        }
    }

    #[test]
    fn test_range_mismatch_is_conflict() {
        let c = change("serde = \"1.0.90\"", "serde = \"1.0.200\"", 5, 5);
        match ConflictDetector::check_change("Cargo.toml", MANIFEST, &c, 0, false).unwrap() {
            ChangeCheck::Conflict { conflict, .. } => {
                assert_eq!(conflict.current_text, "serde = \"1.0.100\"");
                assert_eq!(conflict.incoming_text, "serde = \"1.0.200\"");
                assert_eq!(conflict.line, 5);
                assert!(conflict.context_text.contains("[dependencies]"));
                assert_eq!(conflict.conflict_type, ConflictType::Content);
                assert_eq!(conflict.severity, Severity::Medium);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_already_applied() {
        let c = change("serde = \"1.0.50\"", "serde = \"1.0.100\"", 5, 5);
        assert!(matches!(
            ConflictDetector::check_change("Cargo.toml", MANIFEST, &c, 0, false).unwrap(),
            ChangeCheck::AlreadyApplied
        ));
    }

    #[test]
    fn test_range_out_of_bounds() {
        let c = change("x", "y", 40, 41);
        assert!(matches!(
            ConflictDetector::check_change("Cargo.toml", MANIFEST, &c, 0, false),
            Err(ChangeError::LineRange { .. })
        ));
    }

    #[test]
    fn test_offset_shifts_range() {
        let c = change("tokio = \"1.0\"", "tokio = \"1.40\"", 5, 5);
        match ConflictDetector::check_change("Cargo.toml", MANIFEST, &c, 1, false).unwrap() {
            ChangeCheck::Clean(loc) => assert_eq!(loc.line, 6),
            other => panic!("expected clean, got {:?}", other),
        }
    }

    #[test]
    fn test_fragment_ambiguous() {
        let text = "a = 1\nb = 1\n";
        let c = change("= 1", "= 2", 0, 0);
        assert!(matches!(
            ConflictDetector::check_change("x", text, &c, 0, false),
            Err(ChangeError::AmbiguousMatch { occurrences: 2, .. })
        ));
    }

    #[test]
    fn test_fragment_anchor_conflict() {
        let text = "fn main() {\n    run(1);\n}\n";
        let c = change("fn main() {\n    run(0);", "fn main() {\n    run(2);", 0, 0);
        match ConflictDetector::check_change("main.rs", text, &c, 0, false).unwrap() {
            ChangeCheck::Conflict { conflict, location } => {
                assert_eq!(location.line, 1);
                assert_eq!(conflict.current_text, "fn main() {\n    run(1);");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_fragment_not_found() {
        let c = change("nothing here", "x", 0, 0);
        assert!(matches!(
            ConflictDetector::check_change("x", MANIFEST, &c, 0, false),
            Err(ChangeError::FragmentNotFound { .. })
        ));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("foo(", "foo()"), ConflictType::Syntactic);
        assert_eq!(classify("a", "a()"), ConflictType::Structural);
        assert_eq!(classify("let a = 1", "let a = 2"), ConflictType::Semantic);
        assert_eq!(classify("v1", "v2"), ConflictType::Content);
    }

    #[test]
    fn test_severity_policy() {
        let mut c = change("a", "b", 1, 1);
        assert_eq!(assess_severity("a", "b", &c, false), Severity::Medium);
        assert_eq!(assess_severity("a  b", "a b", &c, false), Severity::Low);
        c.kind = ChangeKind::Api;
        assert_eq!(assess_severity("a", "b", &c, false), Severity::High);
        assert_eq!(assess_severity("a", "b", &c, true), Severity::Critical);
    }

    #[test]
    fn test_longer_version_on_range_is_conflict() {
        let c = change("version = 1", "version = 2", 1, 1);
        match ConflictDetector::check_change("a.toml", "version = 25\n", &c, 0, false).unwrap() {
            ChangeCheck::Conflict { conflict, .. } => {
                assert_eq!(conflict.current_text, "version = 25");
                assert_eq!(conflict.incoming_text, "version = 2");
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_range_insertion_needs_whole_lines() {
        let c = change("", "version = 2", 1, 1);
        assert!(matches!(
            ConflictDetector::check_change("a.toml", "version = 25\n", &c, 0, false).unwrap(),
            ChangeCheck::Clean(Location { insertion: true, .. })
        ));
        assert!(matches!(
            ConflictDetector::check_change("a.toml", "version = 2\n", &c, 0, false).unwrap(),
            ChangeCheck::AlreadyApplied
        ));
    }

    #[test]
    fn test_fragment_new_text_on_another_line_is_not_applied() {
        let text = "[foo]\nversion = \"2.0\"\n\n[bar]\nversion = \"1.5\"\n";
        let c = change("[bar]\nversion = \"1.0\"", "[bar]\nversion = \"2.0\"", 0, 0);
        match ConflictDetector::check_change("deps.toml", text, &c, 0, false).unwrap() {
            ChangeCheck::Conflict { conflict, location } => {
                assert_eq!(location.line, 4);
                assert_eq!(conflict.current_text, "[bar]\nversion = \"1.5\"");
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let lone = change("version = \"1.0\"", "version = \"2.0\"", 0, 0);
        assert!(matches!(
            ConflictDetector::check_change("deps.toml", text, &lone, 0, false),
            Err(ChangeError::FragmentNotFound { .. })
        ));
    }

    #[test]
    fn test_fragment_applied_at_anchor() {
        let text = "[bar]\nversion = \"2.0\"\n";
        let c = change("[bar]\nversion = \"1.0\"", "[bar]\nversion = \"2.0\"", 0, 0);
        assert!(matches!(
            ConflictDetector::check_change("deps.toml", text, &c, 0, false).unwrap(),
            ChangeCheck::AlreadyApplied
        ));
    }

    #[test]
    fn test_bounded_occurrences() {
        assert_eq!(bounded_occurrences("version = 25", "version = 2"), 0);
        assert_eq!(bounded_occurrences("serde = \"1.0.200\"", "1.0.200"), 1);
        assert_eq!(bounded_occurrences("serde = \"1.0.2000\"", "1.0.200"), 0);
    }
}
