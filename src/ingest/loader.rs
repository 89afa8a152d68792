// Loader
// Best-effort content reading: binary sniffing, decode policy, minified
// detection, and head+tail sampling for oversized bodies. The loader never
// fails a file outright; it classifies it so the orchestrator can persist
// the right metadata row.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::{DecodePolicy, IndexingConfig};
use crate::types::ParseReason;

/// Longest line and average line length beyond which a file is treated as
/// generated/minified rather than source.
const MINIFIED_MAX_LINE: usize = 5000;
const MINIFIED_AVG_LINE: usize = 300;

/// Bytes inspected for the NUL-byte binary heuristic.
const SNIFF_WINDOW: usize = 8192;

/// Outcome of loading one file.
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    /// Decoded body; None when the file should keep a metadata-only row.
    pub body: Option<String>,
    pub is_binary: bool,
    pub sampled: bool,
    /// Set when the loader decided the file is skipped, with the reason.
    pub skip: Option<ParseReason>,
    pub content_hash: u64,
}

/// Read and classify one file.
pub fn load(abs_path: &Path, config: &IndexingConfig) -> Result<LoadOutcome> {
    let bytes = std::fs::read(abs_path)
        .with_context(|| format!("failed to read {}", abs_path.display()))?;
    Ok(classify(&bytes, config))
}

/// Classification core, separated from I/O for testability.
pub fn classify(bytes: &[u8], config: &IndexingConfig) -> LoadOutcome {
    let content_hash = xxhash_rust::xxh3::xxh3_64(bytes);

    let sniff = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    if sniff.contains(&0) {
        return LoadOutcome {
            body: None,
            is_binary: true,
            sampled: false,
            skip: Some(ParseReason::Binary),
            content_hash,
        };
    }

    if bytes.is_empty() {
        return LoadOutcome {
            body: None,
            is_binary: false,
            sampled: false,
            skip: Some(ParseReason::NoParse),
            content_hash,
        };
    }

    let text = match config.decode_policy {
        DecodePolicy::Strong => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => {
                return LoadOutcome {
                    body: None,
                    is_binary: true,
                    sampled: false,
                    skip: Some(ParseReason::Binary),
                    content_hash,
                }
            }
        },
        DecodePolicy::Ignore => String::from_utf8_lossy(bytes).to_string(),
    };

    if looks_minified(&text) {
        return LoadOutcome {
            body: None,
            is_binary: false,
            sampled: false,
            skip: Some(ParseReason::Minified),
            content_hash,
        };
    }

    // Oversized bodies keep a head+tail sample so path and signature-level
    // search still works.
    let limit = config.parse_limit_bytes as usize;
    if limit > 0 && text.len() > limit {
        let head_len = limit * 3 / 5;
        let tail_len = limit - head_len;
        let mut head_end = head_len.min(text.len());
        while head_end > 0 && !text.is_char_boundary(head_end) {
            head_end -= 1;
        }
        let mut tail_start = text.len().saturating_sub(tail_len);
        while tail_start < text.len() && !text.is_char_boundary(tail_start) {
            tail_start += 1;
        }
        let sample = format!("{}\n…\n{}", &text[..head_end], &text[tail_start..]);
        return LoadOutcome {
            body: Some(sample),
            is_binary: false,
            sampled: true,
            skip: None,
            content_hash,
        };
    }

    LoadOutcome {
        body: Some(text),
        is_binary: false,
        sampled: false,
        skip: None,
        content_hash,
    }
}

fn looks_minified(text: &str) -> bool {
    let mut lines = 0usize;
    let mut total = 0usize;
    let mut longest = 0usize;
    for line in text.lines() {
        lines += 1;
        total += line.len();
        longest = longest.max(line.len());
    }
    if lines == 0 {
        return false;
    }
    longest > MINIFIED_MAX_LINE || total / lines > MINIFIED_AVG_LINE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IndexingConfig {
        IndexingConfig::default()
    }

    #[test]
    fn test_binary_detection_via_nul() {
        let outcome = classify(&[0x41, 0x00, 0x42], &config());
        assert!(outcome.is_binary);
        assert_eq!(outcome.skip, Some(ParseReason::Binary));
        assert!(outcome.body.is_none());
    }

    #[test]
    fn test_empty_file_is_skipped_no_parse() {
        let outcome = classify(b"", &config());
        assert!(!outcome.is_binary);
        assert_eq!(outcome.skip, Some(ParseReason::NoParse));
    }

    #[test]
    fn test_strong_decode_rejects_invalid_utf8() {
        let mut strong = config();
        strong.decode_policy = DecodePolicy::Strong;
        let outcome = classify(&[0xff, 0xfe, 0x41], &strong);
        assert_eq!(outcome.skip, Some(ParseReason::Binary));

        let mut lossy = config();
        lossy.decode_policy = DecodePolicy::Ignore;
        let outcome = classify(&[0xff, 0xfe, 0x41], &lossy);
        assert!(outcome.skip.is_none());
        assert!(outcome.body.expect("body").contains('A'));
    }

    #[test]
    fn test_minified_single_line_is_skipped() {
        let blob = format!("var a={};", "x".repeat(6000));
        let outcome = classify(blob.as_bytes(), &config());
        assert_eq!(outcome.skip, Some(ParseReason::Minified));
    }

    #[test]
    fn test_oversized_body_keeps_head_tail_sample() {
        let mut small = config();
        small.parse_limit_bytes = 100;
        let text = (0..50)
            .map(|i| format!("line number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let outcome = classify(text.as_bytes(), &small);
        assert!(outcome.sampled);
        let body = outcome.body.expect("sampled body");
        assert!(body.len() < text.len());
        assert!(body.starts_with("line number 0"));
        assert!(body.ends_with("line number 49"));
    }

    #[test]
    fn test_hash_is_content_addressed() {
        let a = classify(b"same", &config());
        let b = classify(b"same", &config());
        let c = classify(b"different", &config());
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
    }
}
