/// Open/close delimiters for the embedded reasoning span some models emit
/// at the start of their output.
pub const OPEN_TAG: &str = "<think>";
pub const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No classifiable input yet; waiting to see whether the stream opens
    /// with a reasoning tag.
    AwaitingOpenTag,
    /// Inside `<think>...`; close tag not seen yet.
    InReasoning,
    /// Close tag consumed; everything else is answer text.
    InAnswer,
    /// The stream never opened a reasoning tag; everything is answer text.
    PlainAnswer,
}

/// Splits an arbitrarily-chunked token stream into reasoning and answer
/// text, tolerating tags split across chunk boundaries, tags that never
/// close, and streams with no tags at all.
///
/// The render view is prefix-monotone within one stream: each `feed`
/// extends the previously returned text, never rewrites it. Consumers can
/// therefore print or diff suffixes cheaply.
pub struct StreamDemuxer {
    reasoning: String,
    answer: String,
    // Unflushed tail retained to catch a delimiter split across chunks
    pending: String,
    phase: Phase,
    finalized: bool,
}

impl StreamDemuxer {
    pub fn new() -> Self {
        Self {
            reasoning: String::new(),
            answer: String::new(),
            pending: String::new(),
            phase: Phase::AwaitingOpenTag,
            finalized: false,
        }
    }

    /// Consume one chunk and return the current render view.
    /// Empty chunks and feeds after `finalize` are no-ops.
    pub fn feed(&mut self, chunk: &str) -> String {
        if chunk.is_empty() || self.finalized {
            return self.render();
        }

        match self.phase {
            Phase::AwaitingOpenTag => self.feed_awaiting(chunk),
            Phase::InReasoning => self.feed_reasoning(chunk),
            Phase::InAnswer | Phase::PlainAnswer => self.answer.push_str(chunk),
        }

        self.render()
    }

    fn feed_awaiting(&mut self, chunk: &str) {
        self.pending.push_str(chunk);

        if let Some(pos) = self.pending.find(OPEN_TAG) {
            // Drop everything through the tag, reroute the rest as reasoning
            let rest = self.pending.split_off(pos + OPEN_TAG.len());
            self.pending.clear();
            self.phase = Phase::InReasoning;
            if !rest.is_empty() {
                self.feed_reasoning(&rest);
            }
        } else if self.pending.len() < OPEN_TAG.len() && OPEN_TAG.starts_with(self.pending.as_str())
        {
            // Could still be an open tag split across chunks; keep waiting.
            // Lookbehind is bounded: at most OPEN_TAG.len()-1 characters.
        } else {
            // First real content carries no open tag: lock to plain answer
            // for the rest of the stream. A tag arriving later is literal
            // text.
            self.phase = Phase::PlainAnswer;
            self.answer.push_str(&self.pending);
            self.pending.clear();
        }
    }

    fn feed_reasoning(&mut self, chunk: &str) {
        let mut work = std::mem::take(&mut self.pending);
        work.push_str(chunk);

        if let Some(pos) = work.find(CLOSE_TAG) {
            self.reasoning.push_str(&work[..pos]);
            self.answer.push_str(&work[pos + CLOSE_TAG.len()..]);
            self.phase = Phase::InAnswer;
        } else {
            // Withhold the trailing CLOSE_TAG.len()-1 characters so a close
            // tag split across chunks is still caught on the next feed
            let split = tail_boundary(&work, CLOSE_TAG.len() - 1);
            self.reasoning.push_str(&work[..split]);
            self.pending = work.split_off(split);
        }
    }

    /// Flush the residual lookbehind into the buffer matching the current
    /// phase and return the terminal render view. Idempotent: repeated
    /// calls return the same view without mutating state.
    pub fn finalize(&mut self) -> String {
        if !self.finalized {
            self.finalized = true;
            let pending = std::mem::take(&mut self.pending);
            match self.phase {
                Phase::AwaitingOpenTag => {
                    // Tag never opened; whatever we held back is answer text
                    self.answer.push_str(&pending);
                    self.phase = Phase::PlainAnswer;
                }
                Phase::InReasoning => self.reasoning.push_str(&pending),
                Phase::InAnswer | Phase::PlainAnswer => self.answer.push_str(&pending),
            }
        }
        self.render()
    }

    /// Current user-facing reconstruction, tag-wrapped per phase so the UI
    /// can key its fold/unfold presentation on tag presence alone.
    pub fn render(&self) -> String {
        match self.phase {
            Phase::AwaitingOpenTag => String::new(),
            Phase::InReasoning => format!("{}{}", OPEN_TAG, self.reasoning),
            Phase::InAnswer => format!(
                "{}{}{}{}",
                OPEN_TAG, self.reasoning, CLOSE_TAG, self.answer
            ),
            Phase::PlainAnswer => self.answer.clone(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }
}

impl Default for StreamDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte index splitting `s` so that at most `keep_chars` characters remain
/// after it. Always lands on a char boundary.
fn tail_boundary(s: &str, keep_chars: usize) -> usize {
    let total = s.chars().count();
    if total <= keep_chars {
        return 0;
    }
    s.char_indices()
        .nth(total - keep_chars)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> StreamDemuxer {
        let mut demux = StreamDemuxer::new();
        for chunk in chunks {
            demux.feed(chunk);
        }
        demux.finalize();
        demux
    }

    #[test]
    fn test_single_chunk_with_both_tags() {
        let demux = run(&["<think>plan the reply</think>Here it is"]);
        assert_eq!(demux.phase(), Phase::InAnswer);
        assert_eq!(demux.reasoning(), "plan the reply");
        assert_eq!(demux.answer(), "Here it is");
        assert_eq!(demux.render(), "<think>plan the reply</think>Here it is");
    }

    #[test]
    fn test_open_tag_split_across_chunks() {
        let split = run(&["<thi", "nk>hello"]);
        let whole = run(&["<think>hello"]);
        assert_eq!(split.render(), whole.render());
        assert_eq!(split.phase(), whole.phase());
        assert_eq!(split.reasoning(), "hello");
    }

    #[test]
    fn test_close_tag_split_across_chunks() {
        let demux = run(&["<think>abc</thi", "nk>def"]);
        assert_eq!(demux.phase(), Phase::InAnswer);
        assert_eq!(demux.reasoning(), "abc");
        assert_eq!(demux.answer(), "def");
    }

    #[test]
    fn test_close_tag_split_one_char_at_a_time() {
        let demux = run(&["<think>abc", "<", "/", "t", "h", "i", "n", "k", ">", "xy"]);
        assert_eq!(demux.reasoning(), "abc");
        assert_eq!(demux.answer(), "xy");
    }

    #[test]
    fn test_empty_reasoning_span() {
        let demux = run(&["<think></think>answer"]);
        assert_eq!(demux.phase(), Phase::InAnswer);
        assert_eq!(demux.reasoning(), "");
        assert_eq!(demux.answer(), "answer");
    }

    #[test]
    fn test_unterminated_reasoning() {
        let demux = run(&["<think>partial reasoning"]);
        assert_eq!(demux.phase(), Phase::InReasoning);
        assert_eq!(demux.render(), "<think>partial reasoning");
    }

    #[test]
    fn test_plain_answer_locks_on_first_chunk() {
        // Once the first chunk decides PlainAnswer, a later tag is literal
        let demux = run(&["Hi ", "<think> nope"]);
        assert_eq!(demux.phase(), Phase::PlainAnswer);
        assert_eq!(demux.render(), "Hi <think> nope");
    }

    #[test]
    fn test_plain_answer_no_tags_anywhere() {
        let demux = run(&["Hello", " there"]);
        assert_eq!(demux.phase(), Phase::PlainAnswer);
        assert_eq!(demux.render(), "Hello there");
    }

    #[test]
    fn test_finalize_without_any_feed() {
        let mut demux = StreamDemuxer::new();
        assert_eq!(demux.finalize(), "");
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut demux = StreamDemuxer::new();
        demux.feed("<think>half");
        let first = demux.finalize();
        let second = demux.finalize();
        assert_eq!(first, second);
        // A feed after finalize must not change anything either
        let after = demux.feed("extra");
        assert_eq!(after, first);
    }

    #[test]
    fn test_prefix_of_open_tag_flushed_on_finalize() {
        // "<thi" alone is withheld as a possible split tag; finalize must
        // recover it as answer text rather than dropping it
        let demux = run(&["<thi"]);
        assert_eq!(demux.phase(), Phase::PlainAnswer);
        assert_eq!(demux.render(), "<thi");
    }

    #[test]
    fn test_no_loss_across_random_chunking() {
        let input = "<think>first thoughts, still going</think>final answer here";
        let splits: &[&[usize]] = &[&[1, 5, 9, 13], &[6], &[7, 8], &[3, 3, 3, 3, 3, 3]];
        for cuts in splits {
            let mut demux = StreamDemuxer::new();
            let mut rest = input;
            for &cut in cuts.iter() {
                let (head, tail) = rest.split_at(cut.min(rest.len()));
                demux.feed(head);
                rest = tail;
            }
            demux.feed(rest);
            demux.finalize();
            // Every character survives minus exactly the two matched tags
            let recovered = demux.reasoning().len() + demux.answer().len();
            assert_eq!(
                recovered,
                input.len() - OPEN_TAG.len() - CLOSE_TAG.len(),
                "lost or duplicated bytes with cuts {:?}",
                cuts
            );
            assert_eq!(demux.reasoning(), "first thoughts, still going");
            assert_eq!(demux.answer(), "final answer here");
        }
    }

    #[test]
    fn test_no_loss_when_tag_never_closes() {
        let demux = run(&["<think>abc", "def"]);
        assert_eq!(demux.reasoning(), "abcdef");
        assert_eq!(demux.answer(), "");
    }

    #[test]
    fn test_multibyte_text_around_withheld_tail() {
        // The withheld lookbehind must split on char boundaries
        let demux = run(&["<think>naïve café—", "résumé</think>ok"]);
        assert_eq!(demux.reasoning(), "naïve café—résumé");
        assert_eq!(demux.answer(), "ok");
    }

    #[test]
    fn test_render_is_prefix_monotone() {
        let chunks = ["<think>a", "bc</thi", "nk>de", "f"];
        let mut demux = StreamDemuxer::new();
        let mut prev = String::new();
        for chunk in chunks {
            let view = demux.feed(chunk);
            assert!(
                view.starts_with(&prev),
                "render {:?} does not extend {:?}",
                view,
                prev
            );
            prev = view;
        }
        let last = demux.finalize();
        assert!(last.starts_with(&prev));
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut demux = StreamDemuxer::new();
        demux.feed("<think>x");
        let before = demux.render();
        assert_eq!(demux.feed(""), before);
        assert_eq!(demux.phase(), Phase::InReasoning);
    }
}
