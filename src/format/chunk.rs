/// Split `content` into ordered chunks of at most `max_len` characters.
///
/// Splits prefer the last newline inside the limit, then the last space,
/// then a hard cut. Whitespace at the start of each following chunk is
/// dropped. Content already within the limit comes back as a single chunk.
pub fn chunk_message(content: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut remaining = content;

    loop {
        // Byte offset of the first char past the limit; None means it all fits
        let limit = match remaining.char_indices().nth(max_len) {
            Some((offset, _)) => offset,
            None => {
                if chunks.is_empty() || !remaining.is_empty() {
                    chunks.push(remaining.to_string());
                }
                break;
            }
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .filter(|&p| p > 0)
            .or_else(|| window.rfind(' ').filter(|&p| p > 0))
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
        if remaining.is_empty() {
            break;
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Check that `chunks` reproduce `original` when the whitespace dropped
    /// at each split is put back.
    fn reassembles(original: &str, chunks: &[String]) -> bool {
        let mut rest = original;
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                rest = rest.trim_start();
            }
            match rest.strip_prefix(chunk.as_str()) {
                Some(after) => rest = after,
                None => return false,
            }
        }
        rest.trim().is_empty()
    }

    #[test]
    fn test_short_message_unchanged() {
        assert_eq!(chunk_message("hello", 100), vec!["hello"]);
        assert_eq!(chunk_message("hello", 5), vec!["hello"]);
        assert_eq!(chunk_message("", 10), vec![""]);
    }

    #[test]
    fn test_splits_at_newline() {
        let chunks = chunk_message("line1\nline2\nline3", 10);
        assert_eq!(chunks, vec!["line1", "line2", "line3"]);
    }

    #[test]
    fn test_splits_at_space() {
        let chunks = chunk_message("hello world foo bar", 10);
        assert_eq!(chunks, vec!["hello", "world foo", "bar"]);
    }

    #[test]
    fn test_newline_preferred_over_space() {
        let chunks = chunk_message("ab cd\nef gh ij", 10);
        assert_eq!(chunks[0], "ab cd");
    }

    #[test]
    fn test_hard_cut_without_whitespace() {
        let chunks = chunk_message("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        let text = "привет мир";
        let chunks = chunk_message(text, 6);
        assert_eq!(chunks, vec!["привет", "мир"]);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 6);
        }
    }

    #[test]
    fn test_zero_limit_treated_as_one() {
        assert_eq!(chunk_message("abc", 0), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_every_chunk_within_limit_and_reassembles() {
        let text = "The quick brown fox jumps over the lazy dog.\n\n\
                    Pack my box with five dozen liquor jugs. \
                    Sphinx of black quartz, judge my vow.\n\
                    averyveryverylongwordwithoutanybreaksinsideofit end";
        for max_len in [1, 3, 7, 16, 40, 200] {
            let chunks = chunk_message(text, max_len);
            assert!(!chunks.is_empty());
            for chunk in &chunks {
                assert!(chunk.chars().count() <= max_len, "{:?} > {}", chunk, max_len);
            }
            assert!(reassembles(text, &chunks), "max_len {}: {:?}", max_len, chunks);
        }
    }
}
