//! Text analysis seam.
//!
//! Full analysis pipelines live outside this crate; the index core only
//! needs a way to turn field text into positioned terms. [`SimpleAnalyzer`]
//! is the default collaborator: lowercase terms split on non-alphanumeric
//! boundaries, with byte offsets preserved for term vectors.

/// A single term produced by analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The term text.
    pub text: String,

    /// Position of the token within the field, starting at 0.
    pub position: u32,

    /// Byte offset of the token's start in the original text.
    pub start_offset: u32,

    /// Byte offset just past the token's end in the original text.
    pub end_offset: u32,
}

/// A pluggable text analyzer.
pub trait Analyzer: Send + Sync + std::fmt::Debug {
    /// Split text into positioned tokens.
    fn analyze(&self, text: &str) -> Vec<Token>;
}

/// Lowercasing analyzer splitting on non-alphanumeric characters.
#[derive(Debug, Clone, Default)]
pub struct SimpleAnalyzer;

impl Analyzer for SimpleAnalyzer {
    fn analyze(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut start = None;
        let mut position = 0u32;

        for (idx, ch) in text.char_indices() {
            if ch.is_alphanumeric() {
                if start.is_none() {
                    start = Some(idx);
                }
            } else if let Some(begin) = start.take() {
                tokens.push(Token {
                    text: text[begin..idx].to_lowercase(),
                    position,
                    start_offset: begin as u32,
                    end_offset: idx as u32,
                });
                position += 1;
            }
        }

        if let Some(begin) = start {
            tokens.push(Token {
                text: text[begin..].to_lowercase(),
                position,
                start_offset: begin as u32,
                end_offset: text.len() as u32,
            });
        }

        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_analyzer_splits_and_lowercases() {
        let tokens = SimpleAnalyzer.analyze("Hello, Kestrel world");

        let texts: Vec<_> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["hello", "kestrel", "world"]);

        let positions: Vec<_> = tokens.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_offsets_point_into_source() {
        let text = "ab  cd";
        let tokens = SimpleAnalyzer.analyze(text);

        assert_eq!(tokens.len(), 2);
        assert_eq!(&text[tokens[0].start_offset as usize..tokens[0].end_offset as usize], "ab");
        assert_eq!(&text[tokens[1].start_offset as usize..tokens[1].end_offset as usize], "cd");
    }

    #[test]
    fn test_empty_and_symbol_only_input() {
        assert!(SimpleAnalyzer.analyze("").is_empty());
        assert!(SimpleAnalyzer.analyze("!!! ---").is_empty());
    }
}
