//! # Text Chunker
//!
//! Splits chapter text into pieces small enough for one synthesis call.
//!
//! Sentences are the packing unit: consecutive sentences share a chunk while
//! they fit. A paragraph break also ends a sentence. A sentence longer than
//! the limit is split between words, and a single word longer than the limit
//! is cut by characters. Lengths are measured in characters.

const WORD_SEPARATOR: &str = " ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChunker {
    max_chars: usize,
}

impl TextChunker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    /// Limit derived from a token budget, e.g. 500 tokens at 4 chars each.
    pub fn from_tokens(max_tokens: usize, chars_per_token: f64) -> Self {
        Self::new((max_tokens as f64 * chars_per_token) as usize)
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let mut builder = ChunkBuilder::new(self.max_chars);

        for paragraph in split_paragraphs(text) {
            for sentence in split_sentences(&paragraph) {
                if char_len(sentence) <= self.max_chars {
                    builder.append(sentence, WORD_SEPARATOR);
                    continue;
                }

                builder.flush();
                for word in sentence.split_whitespace() {
                    if char_len(word) <= self.max_chars {
                        builder.append(word, WORD_SEPARATOR);
                    } else {
                        builder.split_oversized(word);
                    }
                }
                builder.flush();
            }
        }

        builder.finish()
    }
}

struct ChunkBuilder {
    max_chars: usize,
    chunks: Vec<String>,
    current: String,
    current_len: usize,
}

impl ChunkBuilder {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            chunks: Vec::new(),
            current: String::new(),
            current_len: 0,
        }
    }

    fn append(&mut self, piece: &str, separator: &str) {
        let piece_len = char_len(piece);
        if self.current_len == 0 {
            self.current.push_str(piece);
            self.current_len = piece_len;
            return;
        }

        let separator_len = separator.chars().count();
        if self.current_len + separator_len + piece_len <= self.max_chars {
            self.current.push_str(separator);
            self.current.push_str(piece);
            self.current_len += separator_len + piece_len;
        } else {
            self.flush();
            self.current.push_str(piece);
            self.current_len = piece_len;
        }
    }

    fn split_oversized(&mut self, word: &str) {
        self.flush();
        let chars: Vec<char> = word.chars().collect();
        let mut pieces = chars.chunks(self.max_chars).peekable();
        while let Some(piece) = pieces.next() {
            let piece: String = piece.iter().collect();
            if pieces.peek().is_some() {
                self.chunks.push(piece);
            } else {
                self.current_len = char_len(&piece);
                self.current = piece;
            }
        }
    }

    fn flush(&mut self) {
        if self.current_len > 0 {
            self.chunks.push(std::mem::take(&mut self.current));
            self.current_len = 0;
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Paragraphs are separated by blank lines; whitespace inside each one is
/// collapsed to single spaces.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(collapse_whitespace(&current.join(" ")));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(collapse_whitespace(&current.join(" ")));
    }

    paragraphs
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A sentence ends at `.`, `!` or `?`, optionally followed by closing
/// quotes or brackets, when whitespace and then an uppercase letter or an
/// opening quote come next.
fn split_sentences(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        if matches!(chars[i].1, '.' | '!' | '?') {
            let mut end = i + 1;
            while end < chars.len() && is_closing(chars[end].1) {
                end += 1;
            }
            let mut next = end;
            while next < chars.len() && chars[next].1.is_whitespace() {
                next += 1;
            }
            if next > end && next < chars.len() && starts_sentence(chars[next].1) {
                let sentence = text[start..chars[end].0].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = chars[next].0;
                i = next;
                continue;
            }
        }
        i += 1;
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn is_closing(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | '\u{201D}' | '\u{2019}')
}

fn starts_sentence(c: char) -> bool {
    c.is_uppercase() || matches!(c, '"' | '\'' | '\u{201C}' | '\u{2018}')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunker = TextChunker::new(100);
        assert_eq!(
            chunker.chunk("  Hello   there.\n  General Kenobi.  "),
            vec!["Hello there. General Kenobi.".to_string()]
        );
        assert!(chunker.chunk(" \n\n \t").is_empty());
    }

    #[test]
    fn test_from_tokens() {
        assert_eq!(TextChunker::from_tokens(500, 4.0).max_chars(), 2000);
        assert_eq!(TextChunker::from_tokens(0, 4.0).max_chars(), 1);
    }

    #[test]
    fn test_splits_at_sentence_boundaries() {
        let chunker = TextChunker::new(40);
        let chunks = chunker.chunk("First sentence here. Second sentence here. Third one.");

        assert_eq!(
            chunks,
            vec![
                "First sentence here.".to_string(),
                "Second sentence here. Third one.".to_string(),
            ]
        );
    }

    #[test]
    fn test_abbreviation_does_not_end_sentence() {
        let sentences = split_sentences("Use tools, e.g. hammers. Then rest.");
        assert_eq!(sentences, vec!["Use tools, e.g. hammers.", "Then rest."]);

        let quoted = split_sentences("He said \"Stop!\" Then he left.");
        assert_eq!(quoted, vec!["He said \"Stop!\"", "Then he left."]);
    }

    #[test]
    fn test_sentences_pack_across_paragraphs() {
        let chunker = TextChunker::new(30);
        let chunks = chunker.chunk("Alpha beta.\n\nGamma delta.\n\nEpsilon zeta eta theta iota.");

        assert_eq!(
            chunks,
            vec![
                "Alpha beta. Gamma delta.".to_string(),
                "Epsilon zeta eta theta iota.".to_string(),
            ]
        );
    }

    #[test]
    fn test_paragraph_break_ends_sentence() {
        let chunker = TextChunker::new(45);
        let chunks = chunker.chunk(
            "Heading\n\nThe storm rolled in fast. Boats ran for harbor. Nobody slept that night.",
        );

        assert_eq!(
            chunks,
            vec![
                "Heading The storm rolled in fast.".to_string(),
                "Boats ran for harbor.".to_string(),
                "Nobody slept that night.".to_string(),
            ]
        );
    }

    #[test]
    fn test_hard_splits_words_then_characters() {
        let chunker = TextChunker::new(10);
        assert_eq!(
            chunker.chunk("aaaa bbbb cccc dddd"),
            vec!["aaaa bbbb".to_string(), "cccc dddd".to_string()]
        );

        let chunker = TextChunker::new(4);
        assert_eq!(
            chunker.chunk("abcdefghij"),
            vec!["abcd".to_string(), "efgh".to_string(), "ij".to_string()]
        );
    }

    #[test]
    fn test_chunks_respect_limit_and_keep_words() {
        let paragraph = "The quick brown fox jumps over the lazy dog. It was not amused! \
                         Was it tired? Nobody knows.";
        let text = [paragraph; 12].join("\n\n");
        let chunker = TextChunker::new(64);

        let chunks = chunker.chunk(&text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 64, "oversized chunk: {:?}", chunk);
        }
        let rejoined: Vec<&str> = chunks.iter().flat_map(|c| c.split_whitespace()).collect();
        let original: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(rejoined, original);
    }

    #[test]
    fn test_multibyte_text_is_measured_in_chars() {
        let chunker = TextChunker::new(5);
        let chunks = chunker.chunk("ééééé ààààà");
        assert_eq!(chunks, vec!["ééééé".to_string(), "ààààà".to_string()]);
    }
}
