//! Sentence segmentation of streamed reply text
//!
//! Fragments arrive at token granularity. Synthesis needs whole sentences,
//! so fragments are buffered and split on `.`, `!` or `?` followed by
//! whitespace. The whitespace run between two sentences belongs to neither
//! of them and is dropped, including when it spans a fragment boundary.

use std::collections::VecDeque;

use futures::{Stream, StreamExt, stream};

use crate::Result;

/// A chunk of reply text ready for synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceUnit {
    pub text: String,
    /// Set on the unterminated tail flushed at end of input
    pub is_final_remainder: bool,
}

impl SentenceUnit {
    #[must_use]
    pub fn sentence(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final_remainder: false,
        }
    }

    #[must_use]
    pub fn remainder(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final_remainder: true,
        }
    }
}

const fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Incremental sentence splitter
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
    /// The last split consumed whitespace up to the end of the buffer
    skip_leading_whitespace: bool,
}

impl SentenceSegmenter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return every sentence it completes
    pub fn push(&mut self, fragment: &str) -> Vec<SentenceUnit> {
        let fragment = if self.skip_leading_whitespace {
            let trimmed = fragment.trim_start();
            if trimmed.is_empty() {
                return Vec::new();
            }
            self.skip_leading_whitespace = false;
            trimmed
        } else {
            fragment
        };
        self.buffer.push_str(fragment);

        let mut units = Vec::new();
        let mut start = 0;
        let mut chars = self.buffer.char_indices().peekable();

        while let Some((i, c)) = chars.next() {
            if !is_terminator(c) {
                continue;
            }
            let Some(&(_, next)) = chars.peek() else {
                break;
            };
            if !next.is_whitespace() {
                continue;
            }

            let sentence = self.buffer[start..i + c.len_utf8()].trim();
            if !sentence.is_empty() {
                units.push(SentenceUnit::sentence(sentence));
            }

            start = self.buffer.len();
            while let Some(&(j, ws)) = chars.peek() {
                if !ws.is_whitespace() {
                    start = j;
                    break;
                }
                chars.next();
            }
        }

        if start > 0 {
            self.skip_leading_whitespace = start == self.buffer.len();
            self.buffer.drain(..start);
        }

        units
    }

    /// Flush the unterminated tail at end of input
    ///
    /// Returns `None` when nothing but whitespace is left.
    pub fn finish(&mut self) -> Option<SentenceUnit> {
        self.skip_leading_whitespace = false;
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| SentenceUnit::remainder(rest))
    }
}

struct Segmenting<S> {
    fragments: S,
    segmenter: SentenceSegmenter,
    ready: VecDeque<SentenceUnit>,
    done: bool,
}

/// Lazily split a fragment stream into sentence units
///
/// The remainder is flushed once the fragments end. An error is passed
/// through and ends the stream without flushing.
pub fn segment<'a, S>(fragments: S) -> impl Stream<Item = Result<SentenceUnit>> + Send + 'a
where
    S: Stream<Item = Result<String>> + Send + 'a,
{
    let state = Segmenting {
        fragments: fragments.boxed(),
        segmenter: SentenceSegmenter::new(),
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(unit) = state.ready.pop_front() {
                return Some((Ok(unit), state));
            }
            if state.done {
                return None;
            }
            match state.fragments.next().await {
                Some(Ok(fragment)) => state.ready.extend(state.segmenter.push(&fragment)),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.segmenter.finish());
                }
            }
        }
    })
}
