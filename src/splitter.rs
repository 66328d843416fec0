//! Recursive character text splitting with overlap.
//!
//! Splits a document into chunks for embedding. The splitter picks the
//! highest-priority separator that actually occurs in the text, splits on it,
//! merges small pieces back together up to the chunk size (carrying a trailing
//! overlap window into the next chunk), and recurses into oversized pieces with
//! the remaining finer-grained separators. A piece that cannot be split any
//! further is emitted verbatim even when oversized.
//!
//! Pure and deterministic; all lengths are measured in characters.

use std::collections::VecDeque;

use tracing::warn;

use crate::errors::AmaError;

/// Separator priority used for documents: paragraphs, lines, words, characters.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl TextSplitter {
    /// Create a splitter with the default separator priority.
    ///
    /// Fails validation when `chunk_overlap >= chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, AmaError> {
        Self::with_separators(
            chunk_size,
            chunk_overlap,
            DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn with_separators(
        chunk_size: usize,
        chunk_overlap: usize,
        separators: Vec<String>,
    ) -> Result<Self, AmaError> {
        if chunk_overlap >= chunk_size {
            return Err(AmaError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators,
        })
    }

    /// Split `text` into ordered, non-empty, whitespace-trimmed chunks.
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let mut final_chunks = Vec::new();

        // Pick the highest-priority separator present in the text. The empty
        // separator always matches and ends the recursion.
        let mut separator = separators.last().cloned().unwrap_or_default();
        let mut next_separators: Option<&[String]> = None;
        for (i, s) in separators.iter().enumerate() {
            if s.is_empty() {
                separator = s.clone();
                break;
            }
            if text.contains(s.as_str()) {
                separator = s.clone();
                next_separators = Some(&separators[i + 1..]);
                break;
            }
        }

        let splits = split_on(text, &separator);
        let mut good_splits: Vec<String> = Vec::new();

        for piece in splits {
            if char_len(&piece) < self.chunk_size {
                good_splits.push(piece);
            } else {
                if !good_splits.is_empty() {
                    final_chunks.extend(self.merge_splits(&good_splits, &separator));
                    good_splits.clear();
                }
                match next_separators {
                    // No finer separators left: emit verbatim even if oversized.
                    None => final_chunks.push(piece),
                    Some(rest) => final_chunks.extend(self.split_recursive(&piece, rest)),
                }
            }
        }

        if !good_splits.is_empty() {
            final_chunks.extend(self.merge_splits(&good_splits, &separator));
        }

        final_chunks
    }

    /// Merge consecutive small pieces up to `chunk_size`, sliding the window so
    /// the trailing `chunk_overlap` characters carry into the next chunk.
    ///
    /// `total` tracks the joined length of the window, separators included, so
    /// the size bound holds for the emitted string.
    fn merge_splits(&self, splits: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in splits {
            let len = char_len(piece);
            let joiner = if window.is_empty() { 0 } else { sep_len };
            if total + len + joiner > self.chunk_size {
                if total > self.chunk_size {
                    warn!(
                        chunk_len = total,
                        chunk_size = self.chunk_size,
                        "produced a chunk longer than the configured size"
                    );
                }
                if !window.is_empty() {
                    push_joined(&mut docs, &window, separator);
                    // Drop pieces from the front until only the overlap remains
                    // (or until the incoming piece, joiner included, fits).
                    loop {
                        let joiner = if window.is_empty() { 0 } else { sep_len };
                        let keep_sliding = total > self.chunk_overlap
                            || (total + len + joiner > self.chunk_size && total > 0);
                        if !keep_sliding {
                            break;
                        }
                        match window.pop_front() {
                            Some(front) => {
                                total -= char_len(front);
                                if !window.is_empty() {
                                    total -= sep_len;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            if !window.is_empty() {
                total += sep_len;
            }
            window.push_back(piece);
            total += len;
        }

        push_joined(&mut docs, &window, separator);
        docs
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_on(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split(separator).map(str::to_string).collect()
    }
}

fn push_joined(docs: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window
        .iter()
        .copied()
        .collect::<Vec<_>>()
        .join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlap_not_smaller_than_chunk_size() {
        assert!(TextSplitter::new(100, 100).is_err());
        assert!(TextSplitter::new(100, 150).is_err());
        assert!(TextSplitter::new(100, 99).is_ok());
    }

    #[test]
    fn splits_on_highest_priority_separator_present() {
        let splitter = TextSplitter::new(16, 2).unwrap();
        let chunks = splitter.split_text("alpha beta\n\ngamma delta");
        // Paragraph separator wins; each paragraph fits a chunk.
        assert_eq!(chunks, vec!["alpha beta", "gamma delta"]);
    }

    #[test]
    fn merges_small_pieces_up_to_chunk_size() {
        let splitter = TextSplitter::new(12, 3).unwrap();
        let chunks = splitter.split_text("aa bb cc dd ee");
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 12, "oversized chunk: {:?}", chunk);
        }
        // Every input word survives somewhere.
        for word in ["aa", "bb", "cc", "dd", "ee"] {
            assert!(chunks.iter().any(|c| c.contains(word)), "lost {:?}", word);
        }
    }

    #[test]
    fn consecutive_chunks_share_overlap() {
        let splitter = TextSplitter::new(10, 5).unwrap();
        let chunks = splitter.split_text("aa bb cc dd ee ff gg hh");
        assert_eq!(
            chunks,
            vec!["aa bb cc", "bb cc dd", "cc dd ee", "dd ee ff", "ee ff gg", "ff gg hh"]
        );
    }

    #[test]
    fn unsplittable_unit_is_emitted_verbatim() {
        // One long word with only word-level separators available: once the
        // empty separator is reached it is split per character; with no empty
        // separator configured the piece is emitted as-is.
        let splitter =
            TextSplitter::with_separators(8, 2, vec![" ".to_string()]).unwrap();
        let long = "abcdefghijklmnop";
        let chunks = splitter.split_text(long);
        assert_eq!(chunks, vec![long.to_string()]);
    }

    #[test]
    fn separatorless_text_honors_size_and_overlap() {
        let splitter = TextSplitter::new(1024, 100).unwrap();
        let text = "x".repeat(3000);
        let chunks = splitter.split_text(&text);

        // 1024-char chunks at a 924-char stride cover 3000 chars in four chunks.
        assert_eq!(chunks.len(), 4);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 1024);
        }
        for pair in chunks.windows(2) {
            let prev = &pair[0];
            let next = &pair[1];
            let overlap_from_prev: String =
                prev.chars().skip(prev.chars().count() - 100).collect();
            let next_head: String = next.chars().take(100).collect();
            assert_eq!(overlap_from_prev, next_head);
        }
        // Full coverage: the stitched chunks reproduce the original length.
        let covered: usize = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let len = c.chars().count();
                if i == 0 {
                    len
                } else {
                    len - 100
                }
            })
            .sum();
        assert_eq!(covered, 3000);
    }

    #[test]
    fn drops_empty_chunks() {
        let splitter = TextSplitter::new(50, 10).unwrap();
        let chunks = splitter.split_text("\n\n\n\n   \n\n");
        assert!(chunks.is_empty());
    }

    #[test]
    fn is_deterministic() {
        let splitter = TextSplitter::new(64, 16).unwrap();
        let text = "Lorem ipsum dolor sit amet.\n\nConsectetur adipiscing elit.\nSed do eiusmod tempor incididunt ut labore et dolore magna aliqua.";
        assert_eq!(splitter.split_text(text), splitter.split_text(text));
    }
}
