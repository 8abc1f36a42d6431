//! Text preparation for extraction: line numbering, hiding memorized ranges, paging.

use crate::memory::types::Memory;
use crate::tokens::count_text;

/// Prefix each line with its 1-based number: `"3: text"`.
pub fn add_line_numbers(text: &str) -> String {
    text.split('\n')
        .enumerate()
        .map(|(i, line)| format!("{}: {line}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lines `start..=end` (1-based) of `text`, or `None` if the range is out of bounds.
pub fn line_range(text: &str, start: usize, end: usize) -> Option<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    if start == 0 || start > end || end > lines.len() {
        return None;
    }
    Some(lines[start - 1..end].join("\n"))
}

/// Line-numbered `text` with every range covered by `memories` collapsed into a marker
/// naming the memory, so the extractor does not memorize it again.
pub fn hide_already_memorized<'a>(
    text: &str,
    memories: impl IntoIterator<Item = &'a Memory>,
) -> String {
    let mut lines: Vec<Option<String>> = add_line_numbers(text)
        .split('\n')
        .map(|line| Some(line.to_string()))
        .collect();

    for memory in memories {
        let (start, end) = (memory.start_line, memory.end_line.min(lines.len()));
        if start == 0 || start > end {
            continue;
        }
        if start == end {
            lines[start - 1] = Some(format!("[Hidden: {}]", memory.title));
            continue;
        }
        let first = text.split('\n').nth(start - 1).unwrap_or_default();
        lines[start - 1] = Some(format!("[{first}\n    Hidden: {}]", memory.title));
        for line in &mut lines[start..end] {
            *line = None;
        }
    }
    lines.into_iter().flatten().collect::<Vec<_>>().join("\n")
}

/// Whether at least three numbered (not yet hidden) lines remain.
pub fn something_to_remember(numbered: &str) -> bool {
    numbered
        .split('\n')
        .filter(|line| line.starts_with(|c: char| c.is_ascii_digit()))
        .count()
        >= 3
}

/// Split `text` into pages of at most `page_tokens`, each starting with up to
/// `overlap_tokens` of the previous page's tail.
pub fn split_document(text: &str, page_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let page_tokens = page_tokens.max(1);
    let overlap_tokens = overlap_tokens.min(page_tokens / 2);
    if count_text(text) < page_tokens {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    for line in text.split_inclusive('\n') {
        if count_text(line) <= page_tokens {
            pieces.push(line.to_string());
        } else {
            pieces.extend(split_words(line, page_tokens - overlap_tokens));
        }
    }

    let mut pages = Vec::new();
    let mut current = String::new();
    let mut fresh = false;
    for piece in pieces {
        if fresh && count_text(&current) + count_text(&piece) > page_tokens {
            pages.push(std::mem::take(&mut current));
            current = tail(&pages[pages.len() - 1], overlap_tokens);
            fresh = false;
        }
        current.push_str(&piece);
        fresh = true;
    }
    if fresh {
        pages.push(current);
    }
    pages
}

/// Word windows of at most `budget` tokens.
fn split_words(line: &str, budget: usize) -> Vec<String> {
    let mut windows = Vec::new();
    let mut window = String::new();
    for word in line.split_inclusive(' ') {
        if !window.is_empty() && count_text(&window) + count_text(word) > budget {
            windows.push(std::mem::take(&mut window));
        }
        window.push_str(word);
    }
    if !window.is_empty() {
        windows.push(window);
    }
    windows
}

/// The last `tokens` worth of whole words of `page`, marked as a continuation.
fn tail(page: &str, tokens: usize) -> String {
    if tokens == 0 {
        return String::new();
    }
    let mut words: Vec<&str> = Vec::new();
    let mut used = 0;
    for word in page.split_inclusive(|c: char| c.is_whitespace()).rev() {
        used += count_text(word);
        if used > tokens {
            break;
        }
        words.push(word);
    }
    words.reverse();
    format!("...{}", words.concat())
}
