//! Splits a streaming completion into speakable chunks
//!
//! TTS latency scales with input length, so deltas are accumulated and cut
//! at sentence punctuation once enough text exists to sound natural.

/// Minimum chunk length, so abbreviations and "Ok." do not force a cut
const MIN_CHUNK_CHARS: usize = 12;

#[derive(Debug, Default)]
pub struct SentenceChunker {
    pending: String,
}

impl SentenceChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta; returns any complete sentences ready for synthesis.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.pending.push_str(delta);
        let mut ready = Vec::new();
        while let Some(cut) = self.boundary() {
            let rest = self.pending.split_off(cut);
            let sentence = std::mem::replace(&mut self.pending, rest);
            let sentence = sentence.trim().to_string();
            if !sentence.is_empty() {
                ready.push(sentence);
            }
        }
        ready
    }

    /// Whatever is left when the stream ends.
    pub fn finish(mut self) -> String {
        self.pending.truncate(self.pending.trim_end().len());
        self.pending.trim_start().to_string()
    }

    /// Byte offset just past the first usable sentence end, if any.
    fn boundary(&self) -> Option<usize> {
        let mut chars = 0usize;
        let mut iter = self.pending.char_indices().peekable();
        while let Some((i, c)) = iter.next() {
            chars += 1;
            if matches!(c, '.' | '!' | '?') && chars >= MIN_CHUNK_CHARS {
                // Only cut when the punctuation ends a word, not "3.5" or "e.g"
                match iter.peek() {
                    None => return None, // may still be mid-stream, wait for more
                    Some((_, next)) if next.is_whitespace() => return Some(i + c.len_utf8()),
                    _ => {},
                }
            }
        }
        None
    }
}
