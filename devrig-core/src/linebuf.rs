//! Threadsafe line store backing each UI pane: the original messages plus a
//! derived list of display lines wrapped at the current width. One mutex
//! covers both lists.

use std::sync::Mutex;

use crate::lock;

pub struct LineBuffer {
    inner: Mutex<BufferState>,
}

struct BufferState {
    width: usize,
    messages: Vec<String>,
    lines: Vec<String>,
}

impl LineBuffer {
    pub fn new(width: usize) -> Self {
        Self {
            inner: Mutex::new(BufferState {
                width: width.max(1),
                messages: Vec::new(),
                lines: Vec::new(),
            }),
        }
    }

    /// Appends one message and its wrapped fragments. Returns the input
    /// length; never fails.
    pub fn push(&self, message: &str) -> usize {
        let mut st = lock(&self.inner);
        let wrapped = wrap_message(message, st.width);
        st.messages.push(message.to_string());
        st.lines.extend(wrapped);
        message.len()
    }

    /// Byte-oriented variant of [`push`](Self::push); the bytes are one
    /// message, interpreted as UTF-8 lossily.
    pub fn write(&self, bytes: &[u8]) -> usize {
        self.push(&String::from_utf8_lossy(bytes));
        bytes.len()
    }

    /// Rewraps every message at the new width, preserving message order.
    /// No-op when the width is unchanged or below one.
    pub fn set_width(&self, width: usize) {
        if width < 1 {
            return;
        }
        let mut st = lock(&self.inner);
        if width == st.width {
            return;
        }
        st.width = width;
        st.lines = st
            .messages
            .iter()
            .flat_map(|message| wrap_message(message, width))
            .collect();
    }

    /// Snapshot of the wrapped lines in `[from, to)`, both ends clamped to
    /// the buffer; empty when `from >= to`.
    pub fn lines(&self, from: usize, to: usize) -> Vec<String> {
        let st = lock(&self.inner);
        let len = st.lines.len();
        let from = from.min(len);
        let to = to.min(len);
        if from >= to {
            return Vec::new();
        }
        st.lines[from..to].to_vec()
    }

    /// Wrapped-line count.
    pub fn len(&self) -> usize {
        lock(&self.inner).lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn wrap_message(message: &str, width: usize) -> Vec<String> {
    textwrap::wrap(message, width)
        .into_iter()
        .map(|line| line.into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_width_wraps_and_wide_width_restores() {
        let buf = LineBuffer::new(14);
        buf.push("aaaa bbbb cccc");
        assert_eq!(buf.lines(0, buf.len()), vec!["aaaa bbbb cccc"]);

        buf.set_width(5);
        assert_eq!(buf.lines(0, buf.len()), vec!["aaaa", "bbbb", "cccc"]);

        buf.set_width(14);
        assert_eq!(buf.lines(0, buf.len()), vec!["aaaa bbbb cccc"]);
    }

    #[test]
    fn test_set_width_is_idempotent() {
        let buf = LineBuffer::new(20);
        buf.push("one two three four five");
        buf.set_width(7);
        let once = buf.lines(0, buf.len());
        buf.set_width(7);
        assert_eq!(buf.lines(0, buf.len()), once);
    }

    #[test]
    fn test_message_order_survives_width_changes() {
        let buf = LineBuffer::new(80);
        buf.push("first message here");
        buf.push("second message here");
        buf.push("third");
        buf.set_width(8);
        buf.set_width(80);
        assert_eq!(
            buf.lines(0, buf.len()),
            vec!["first message here", "second message here", "third"]
        );
    }

    #[test]
    fn test_lines_with_from_past_to_is_empty() {
        let buf = LineBuffer::new(80);
        buf.push("x");
        assert!(buf.lines(1, 0).is_empty());
    }

    #[test]
    fn test_lines_clamps_out_of_range() {
        let buf = LineBuffer::new(80);
        buf.push("a");
        buf.push("b");
        assert_eq!(buf.lines(1, 99), vec!["b"]);
        assert!(buf.lines(50, 99).is_empty());
    }

    #[test]
    fn test_push_returns_input_length() {
        let buf = LineBuffer::new(80);
        assert_eq!(buf.push("hello"), 5);
        assert_eq!(buf.write("hello\n".as_bytes()), 6);
    }

    #[test]
    fn test_empty_message_still_takes_a_line() {
        let buf = LineBuffer::new(80);
        buf.push("");
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.lines(0, 1), vec![""]);
    }

    #[test]
    fn test_width_below_one_is_ignored() {
        let buf = LineBuffer::new(10);
        buf.push("abcdef");
        buf.set_width(0);
        assert_eq!(buf.lines(0, buf.len()), vec!["abcdef"]);
    }
}
