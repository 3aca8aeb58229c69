//! Incremental sentence segmentation of streamed text
//!
//! A boundary is a run of `.`, `!` or `?` followed by whitespace. The
//! terminator run stays with its sentence. Abbreviations ("Dr. Smith") and
//! decimals followed by a space are split like any other boundary.

/// A complete sentence and its play order within the turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceUnit {
    /// Strictly increasing, gap-free within a turn
    pub sequence: u64,
    /// Sentence text, trimmed
    pub text: String,
}

const fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Splits an open text stream into sentences
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    next_sequence: u64,
}

impl SentenceSegmenter {
    /// Empty segmenter starting at sequence 0
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return any sentences it completed
    pub fn push(&mut self, fragment: &str) -> Vec<SentenceUnit> {
        if fragment.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(fragment);

        let mut units = Vec::new();
        let mut consumed = 0;
        let mut chars = self.buffer.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            if !is_terminator(c) {
                continue;
            }
            // extend over the whole terminator run
            let mut end = None;
            while let Some(&(i, next)) = chars.peek() {
                if is_terminator(next) {
                    chars.next();
                } else {
                    end = Some((i, next));
                    break;
                }
            }
            let Some((end, next)) = end else {
                break;
            };
            if !next.is_whitespace() {
                continue;
            }

            let sentence = self.buffer[consumed..end].trim();
            if !sentence.is_empty() {
                units.push(SentenceUnit {
                    sequence: self.next_sequence,
                    text: sentence.to_string(),
                });
                self.next_sequence += 1;
            }
            consumed = end;
        }

        if consumed > 0 {
            self.buffer = self.buffer[consumed..].trim_start().to_string();
        }
        units
    }

    /// Flush the remaining fragment as a final sentence
    pub fn finish(&mut self) -> Option<SentenceUnit> {
        let text = std::mem::take(&mut self.buffer);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let unit = SentenceUnit {
            sequence: self.next_sequence,
            text: text.to_string(),
        };
        self.next_sequence += 1;
        Some(unit)
    }

    /// Sequence the next sentence will receive
    #[must_use]
    pub const fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Text not yet emitted
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Clear buffered text and restart numbering for a new turn
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_sequence = 0;
    }
}

/// Segment a complete text in one pass
#[must_use]
pub fn segment_all(text: &str) -> Vec<SentenceUnit> {
    let mut segmenter = SentenceSegmenter::new();
    let mut units = segmenter.push(text);
    units.extend(segmenter.finish());
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(units: &[SentenceUnit]) -> Vec<&str> {
        units.iter().map(|u| u.text.as_str()).collect()
    }

    #[test]
    fn incremental_matches_whole() {
        let mut s = SentenceSegmenter::new();
        let mut units = s.push("Hello. How are");
        units.extend(s.push(" you?"));
        units.extend(s.finish());

        assert_eq!(texts(&units), vec!["Hello.", "How are you?"]);
        assert_eq!(units, segment_all("Hello. How are you?"));
    }

    #[test]
    fn terminator_needs_following_whitespace() {
        let mut s = SentenceSegmenter::new();
        assert!(s.push("Hello.").is_empty());
        assert_eq!(s.pending(), "Hello.");
        let units = s.push(" World");
        assert_eq!(texts(&units), vec!["Hello."]);
        assert_eq!(s.pending(), "World");
    }

    #[test]
    fn consecutive_terminators_collapse() {
        let units = segment_all("Wait!! Really?! Yes...  ok");
        assert_eq!(texts(&units), vec!["Wait!!", "Really?!", "Yes...", "ok"]);
    }

    #[test]
    fn sequences_are_gap_free() {
        let mut s = SentenceSegmenter::new();
        let mut units = s.push("One. Two! ");
        units.extend(s.push(""));
        units.extend(s.push("Three? Four"));
        units.extend(s.finish());

        let seqs: Vec<u64> = units.iter().map(|u| u.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_fragment_is_noop() {
        let mut s = SentenceSegmenter::new();
        assert!(s.push("").is_empty());
        assert!(s.finish().is_none());
        assert_eq!(s.next_sequence(), 0);
    }

    #[test]
    fn whitespace_only_remainder_is_dropped() {
        let mut s = SentenceSegmenter::new();
        let units = s.push("Done.   ");
        assert_eq!(texts(&units), vec!["Done."]);
        assert!(s.finish().is_none());
    }

    #[test]
    fn abbreviations_split_as_documented() {
        let units = segment_all("Dr. Smith paid 3. 5 dollars");
        assert_eq!(texts(&units), vec!["Dr.", "Smith paid 3.", "5 dollars"]);
    }

    #[test]
    fn decimals_without_space_stay_whole() {
        let units = segment_all("It costs 3.50 today. Thanks");
        assert_eq!(texts(&units), vec!["It costs 3.50 today.", "Thanks"]);
    }

    #[test]
    fn reset_restarts_numbering() {
        let mut s = SentenceSegmenter::new();
        s.push("A. B");
        s.reset();
        assert_eq!(s.pending(), "");
        let units = s.push("C. ");
        assert_eq!(units[0].sequence, 0);
        assert_eq!(units[0].text, "C.");
    }

    #[test]
    fn newline_counts_as_whitespace() {
        let units = segment_all("First line.\nSecond line!");
        assert_eq!(texts(&units), vec!["First line.", "Second line!"]);
    }
}
