//! Word-budget chunking of document text for embedding and retrieval.
//!
//! Passages are accumulated paragraph-by-paragraph and flushed against word
//! budgets; each flush seeds the next passage with the trailing overlap words
//! so answers near a chunk boundary are not starved of context.

use crate::config::ChunkingConfig;

/// Split raw document text into overlapping, size-bounded passages.
///
/// Pure function of the text and the config: the same input always yields
/// the same output.
pub fn chunk(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let paragraphs = split_paragraphs(text);
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<String> = Vec::new();
    // Current passage as words, plus how many of them are fresh content
    // (not carried over from the previous flush).
    let mut current: Vec<String> = Vec::new();
    let mut fresh_words = 0usize;

    let mut flush = |current: &mut Vec<String>, fresh_words: &mut usize, chunks: &mut Vec<String>| {
        if *fresh_words > 0 && current.len() >= config.min_words {
            chunks.push(current.join(" "));
        }
        // Seed the next passage with the trailing overlap words.
        let keep = config.overlap_words.min(current.len());
        let seed: Vec<String> = current[current.len() - keep..].to_vec();
        *current = seed;
        *fresh_words = 0;
    };

    for paragraph in &paragraphs {
        let words: Vec<&str> = paragraph.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }

        if !current.is_empty() && current.len() + words.len() > config.max_words {
            flush(&mut current, &mut fresh_words, &mut chunks);
        }

        if current.len() + words.len() > config.max_words {
            // Oversized paragraph even after a flush: clamp on whitespace
            // boundaries, filling each passage up to the hard budget.
            for word in words {
                current.push(word.to_string());
                fresh_words += 1;
                if current.len() >= config.max_words {
                    flush(&mut current, &mut fresh_words, &mut chunks);
                }
            }
        } else {
            current.extend(words.iter().map(|w| w.to_string()));
            fresh_words += words.len();
        }

        // Opportunistic flush at a paragraph boundary once the target is hit.
        if current.len() >= config.target_words {
            flush(&mut current, &mut fresh_words, &mut chunks);
        }
    }

    // Final remainder: only worth keeping if it carries enough new content.
    if fresh_words > 0 && current.len() >= config.min_words {
        chunks.push(current.join(" "));
    }

    chunks
}

/// Split text into paragraphs on blank lines and heading markers.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else if trimmed.starts_with('#') {
            // A heading starts a new semantic unit.
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
            current.push(trimmed);
        } else {
            current.push(trimmed);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }

    paragraphs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkingConfig {
        ChunkingConfig::default()
    }

    fn words(s: &str) -> usize {
        s.split_whitespace().count()
    }

    /// N paragraphs of `per_paragraph` numbered words each.
    fn numbered_text(paragraph_count: usize, per_paragraph: usize) -> String {
        let mut n = 0;
        (0..paragraph_count)
            .map(|_| {
                (0..per_paragraph)
                    .map(|_| {
                        n += 1;
                        format!("w{n}")
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn test_empty_and_whitespace_input() {
        assert!(chunk("", &config()).is_empty());
        assert!(chunk("  \n\n  \t ", &config()).is_empty());
    }

    #[test]
    fn test_short_remainder_discarded() {
        // Fewer than min_words in total, nothing emitted.
        assert!(chunk("too short to index", &config()).is_empty());
    }

    #[test]
    fn test_single_small_document_is_one_chunk() {
        let text = numbered_text(1, 50);
        let chunks = chunk(&text, &config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(words(&chunks[0]), 50);
    }

    #[test]
    fn test_deterministic() {
        let text = numbered_text(10, 150);
        assert_eq!(chunk(&text, &config()), chunk(&text, &config()));
    }

    #[test]
    fn test_no_chunk_under_min_words() {
        let text = numbered_text(12, 137);
        for c in chunk(&text, &config()) {
            assert!(words(&c) >= config().min_words);
        }
    }

    #[test]
    fn test_consecutive_chunks_share_overlap() {
        let cfg = config();
        let text = numbered_text(10, 150);
        let chunks = chunk(&text, &cfg);
        assert!(chunks.len() > 1);

        for pair in chunks.windows(2) {
            let prev: Vec<&str> = pair[0].split_whitespace().collect();
            let next: Vec<&str> = pair[1].split_whitespace().collect();
            let tail = &prev[prev.len() - cfg.overlap_words..];
            assert_eq!(&next[..cfg.overlap_words], tail);
        }
    }

    #[test]
    fn test_word_coverage() {
        // Deduplicating the overlap must reconstruct the original word
        // sequence: no paragraph content dropped or reordered.
        let cfg = config();
        let text = numbered_text(8, 150);
        let chunks = chunk(&text, &cfg);

        let mut reconstructed: Vec<String> = Vec::new();
        for (i, c) in chunks.iter().enumerate() {
            let ws: Vec<&str> = c.split_whitespace().collect();
            let skip = if i == 0 { 0 } else { cfg.overlap_words };
            reconstructed.extend(ws[skip..].iter().map(|w| w.to_string()));
        }

        let original: Vec<String> = text.split_whitespace().map(|w| w.to_string()).collect();
        assert_eq!(reconstructed, original);
    }

    #[test]
    fn test_chunks_respect_max_words() {
        let cfg = config();
        let text = numbered_text(6, 550);
        for c in chunk(&text, &cfg) {
            assert!(words(&c) <= cfg.max_words + cfg.overlap_words);
        }
    }

    #[test]
    fn test_oversized_paragraph_clamped_on_whitespace() {
        let cfg = config();
        // One giant paragraph, well past the hard budget.
        let text = numbered_text(1, 2000);
        let chunks = chunk(&text, &cfg);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(words(c) <= cfg.max_words);
        }
    }

    #[test]
    fn test_heading_starts_new_paragraph() {
        let paragraphs = split_paragraphs("intro line\n# Heading\nbody line\n\nnext");
        assert_eq!(
            paragraphs,
            vec!["intro line", "# Heading body line", "next"]
        );
    }

    #[test]
    fn test_expected_chunk_count_for_2000_words() {
        // A ~2000-word document with 400-600 word chunks and 60-word overlap
        // should land in the 4-6 chunk range.
        let text = numbered_text(20, 100);
        let count = chunk(&text, &config()).len();
        assert!((4..=6).contains(&count), "got {count} chunks");
    }
}
