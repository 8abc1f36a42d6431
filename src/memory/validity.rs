//! Validity of fragments taken from watched sources.
//!
//! A fragment stays valid as long as its verbatim content is still a substring of its source.
//! When the source shifted, the fragment moves to the line range where its content now is.

use crate::memory::types::MemoryWithMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Content found at the recorded line range.
    Valid,
    /// Content found at a different line range.
    Moved { start_line: usize, end_line: usize },
    /// Content no longer present.
    Gone,
}

/// Check `fragment` against the current text of its source.
///
/// With several occurrences the one closest to the recorded start line wins.
pub fn check(fragment: &MemoryWithMeta, current: &str) -> Validity {
    let content = &fragment.meta.content;
    if content.is_empty() {
        return Validity::Valid;
    }
    let span = content.matches('\n').count();
    let recorded = fragment.memory.start_line;

    // Matches come in increasing offset order; count newlines since the previous one only.
    let mut line = 1;
    let mut scanned = 0;
    let best = current
        .match_indices(content.as_str())
        .map(|(offset, _)| {
            line += current[scanned..offset].matches('\n').count();
            scanned = offset;
            line
        })
        .min_by_key(|start| start.abs_diff(recorded));

    match best {
        None => Validity::Gone,
        Some(start) if start == recorded && start + span == fragment.memory.end_line => {
            Validity::Valid
        }
        Some(start) => Validity::Moved {
            start_line: start,
            end_line: start + span,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Memory, MemoryMeta};

    fn fragment(content: &str, start: usize, end: usize) -> MemoryWithMeta {
        MemoryWithMeta::new(
            Memory {
                start_line: start,
                end_line: end,
                title: "t".into(),
                relevant_questions: vec![],
                tags: vec![],
                context: None,
                symbol_id: None,
            },
            MemoryMeta::new("f.txt", content, "root", true),
        )
    }

    #[test]
    fn closest_of_many_occurrences_wins() {
        let source = "x\n".repeat(20_000);
        assert_eq!(check(&fragment("x", 15_000, 15_000), &source), Validity::Valid);

        let alternating = "x\ny\nx\ny\nx";
        assert_eq!(
            check(&fragment("x", 4, 4), alternating),
            Validity::Moved {
                start_line: 3,
                end_line: 3
            }
        );
        assert_eq!(check(&fragment("x", 5, 5), alternating), Validity::Valid);
    }

    #[test]
    fn unchanged_is_valid() {
        let f = fragment("b\nc", 2, 3);
        assert_eq!(check(&f, "a\nb\nc\nd"), Validity::Valid);
    }

    #[test]
    fn shifted_content_moves() {
        let f = fragment("b\nc", 2, 3);
        assert_eq!(
            check(&f, "new\nlines\na\nb\nc"),
            Validity::Moved {
                start_line: 4,
                end_line: 5
            }
        );
    }

    #[test]
    fn removed_content_is_gone() {
        let f = fragment("b\nc", 2, 3);
        assert_eq!(check(&f, "a\nb\nd"), Validity::Gone);
    }

    #[test]
    fn nearest_occurrence_wins() {
        let f = fragment("x", 5, 5);
        assert_eq!(
            check(&f, "x\n1\n2\n3\n4\nx"),
            Validity::Moved {
                start_line: 6,
                end_line: 6
            }
        );
    }
}
