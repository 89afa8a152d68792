// Script-Aware Tokenizer
// Case-folds and compatibility-normalizes text, then segments it by script:
// alphanumeric runs become word tokens, CJK runs emit character bigrams.
// The same folding runs at index and query time so the two sides always
// agree on token identity.

use serde::{Deserialize, Serialize};

/// One token with its position (token index) and byte span in the folded
/// source. Byte spans drive preview extraction; positions drive phrase
/// matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    pub position: u32,
    pub byte_start: u32,
    pub byte_end: u32,
}

/// Parsed query: whitespace-separated terms are ANDed; a quoted group is a
/// phrase. There is no OR, regex, or wildcard in core semantics; regex-ish
/// input is handled as literal tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTerm {
    Token(String),
    Phrase(Vec<String>),
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'   // hiragana, katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified ideographs
        | '\u{AC00}'..='\u{D7AF}' // hangul syllables
        | '\u{F900}'..='\u{FAFF}' // CJK compatibility ideographs
    )
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() && !is_cjk(c) || c == '_'
}

/// Fold one character: lowercase plus the full-width ASCII compatibility
/// range mapped onto ASCII. This is the practically relevant subset of
/// NFKC for mixed CJK/latin source text.
fn fold_char(c: char, out: &mut String) {
    let c = match c {
        '\u{FF01}'..='\u{FF5E}' => {
            char::from_u32(c as u32 - 0xFF01 + 0x21).unwrap_or(c)
        }
        '\u{3000}' => ' ',
        _ => c,
    };
    for lower in c.to_lowercase() {
        out.push(lower);
    }
}

/// Fold a whole string. Query parsing and indexing both run through this.
pub fn fold(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        fold_char(c, &mut out);
    }
    out
}

/// Tokenize folded text.
pub fn tokenize(folded: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut position = 0u32;

    let mut word_start: Option<usize> = None;
    let mut prev_cjk: Option<(usize, char)> = None;

    let mut flush_word = |start: usize, end: usize, tokens: &mut Vec<Token>, position: &mut u32| {
        let text = &folded[start..end];
        if !text.is_empty() {
            tokens.push(Token {
                text: text.to_string(),
                position: *position,
                byte_start: start as u32,
                byte_end: end as u32,
            });
            *position += 1;
        }
    };

    for (idx, c) in folded.char_indices() {
        if is_word_char(c) {
            if word_start.is_none() {
                word_start = Some(idx);
            }
            prev_cjk = None;
            continue;
        }
        if let Some(start) = word_start.take() {
            flush_word(start, idx, &mut tokens, &mut position);
        }
        if is_cjk(c) {
            let end = idx + c.len_utf8();
            if let Some((prev_idx, prev)) = prev_cjk {
                let mut bigram = String::with_capacity(8);
                bigram.push(prev);
                bigram.push(c);
                tokens.push(Token {
                    text: bigram,
                    position,
                    byte_start: prev_idx as u32,
                    byte_end: end as u32,
                });
                position += 1;
            }
            prev_cjk = Some((idx, c));
        } else {
            prev_cjk = None;
        }
    }
    if let Some(start) = word_start {
        flush_word(start, folded.len(), &mut tokens, &mut position);
    }

    tokens
}

/// Fold and tokenize in one step.
pub fn analyze(text: &str) -> Vec<Token> {
    tokenize(&fold(text))
}

/// Parse a query string into AND terms and phrases.
pub fn parse_query(query: &str) -> Vec<QueryTerm> {
    let folded = fold(query);
    let mut terms = Vec::new();
    let mut rest = folded.as_str();

    while let Some(open) = rest.find('"') {
        let before = &rest[..open];
        terms.extend(bare_terms(before));
        let after = &rest[open + 1..];
        match after.find('"') {
            Some(close) => {
                let phrase_tokens: Vec<String> = tokenize(&after[..close])
                    .into_iter()
                    .map(|t| t.text)
                    .collect();
                let mut phrase_tokens = phrase_tokens.into_iter();
                match (phrase_tokens.next(), phrase_tokens.len()) {
                    (None, _) => {}
                    (Some(single), 0) => terms.push(QueryTerm::Token(single)),
                    (Some(first), _) => {
                        let mut tokens = vec![first];
                        tokens.extend(phrase_tokens);
                        terms.push(QueryTerm::Phrase(tokens));
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                // Unbalanced quote: treat the remainder as bare terms.
                terms.extend(bare_terms(after));
                rest = "";
            }
        }
    }
    terms.extend(bare_terms(rest));
    terms
}

fn bare_terms(fragment: &str) -> Vec<QueryTerm> {
    tokenize(fragment)
        .into_iter()
        .map(|t| QueryTerm::Token(t.text))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn test_word_tokens_case_folded() {
        let tokens = analyze("def LoginHandler(user_id):");
        assert_eq!(texts(&tokens), vec!["def", "loginhandler", "user_id"]);
    }

    #[test]
    fn test_positions_and_spans_are_monotonic() {
        let tokens = analyze("alpha beta gamma");
        assert_eq!(tokens[0].position, 0);
        assert_eq!(tokens[2].position, 2);
        assert!(tokens[0].byte_end <= tokens[1].byte_start);
    }

    #[test]
    fn test_cjk_runs_emit_bigrams() {
        let tokens = analyze("検索エンジン");
        let texts = texts(&tokens);
        assert!(texts.contains(&"検索"));
        assert!(texts.contains(&"索エ"));
        assert!(texts.contains(&"エン"));
    }

    #[test]
    fn test_mixed_script_segmentation() {
        let tokens = analyze("handle検索 request");
        let texts = texts(&tokens);
        assert!(texts.contains(&"handle"));
        assert!(texts.contains(&"検索"));
        assert!(texts.contains(&"request"));
    }

    #[test]
    fn test_fullwidth_ascii_folds_to_ascii() {
        let tokens = analyze("ｌｏｇｉｎ");
        assert_eq!(texts(&tokens), vec!["login"]);
    }

    #[test]
    fn test_query_phrases_and_tokens() {
        let terms = parse_query("auth \"token bucket\" limit");
        assert_eq!(
            terms,
            vec![
                QueryTerm::Token("auth".to_string()),
                QueryTerm::Phrase(vec!["token".to_string(), "bucket".to_string()]),
                QueryTerm::Token("limit".to_string()),
            ]
        );
    }

    #[test]
    fn test_unbalanced_quote_degrades_to_tokens() {
        let terms = parse_query("\"dangling phrase");
        assert_eq!(
            terms,
            vec![
                QueryTerm::Token("dangling".to_string()),
                QueryTerm::Token("phrase".to_string()),
            ]
        );
    }
}
