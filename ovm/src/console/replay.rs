//! Bounded recent-output buffer used to seed newly attached clients.
//!
//! Stored bytes are stripped of ANSI escape sequences so a reconnecting
//! client sees legible recent output instead of replayed cursor movement
//! and colour state.

/// Replay buffer capacity in bytes.
pub const REPLAY_CAPACITY: usize = 8 * 1024;

/// Escape-stripping state, kept across chunk boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum StripState {
    /// Plain output.
    #[default]
    Normal,
    /// Saw `ESC`, next byte decides the sequence kind.
    Escape,
    /// Inside `ESC [`; consume until a final byte in `0x40..=0x7E`.
    Csi,
}

/// Incremental ANSI escape stripper.
///
/// `ESC [` starts a CSI sequence consumed up to and including its final
/// byte (`0x40..=0x7E`); any other `ESC <x>` consumes exactly one byte.
#[derive(Debug, Default)]
pub struct AnsiStripper {
    /// Carry-over state for sequences split across chunks.
    state: StripState,
}

impl AnsiStripper {
    /// Feeds a chunk, appending the surviving bytes to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &b in chunk {
            match self.state {
                StripState::Normal => {
                    if b == 0x1b {
                        self.state = StripState::Escape;
                    } else {
                        out.push(b);
                    }
                }
                StripState::Escape => {
                    self.state = if b == b'[' {
                        StripState::Csi
                    } else {
                        StripState::Normal
                    };
                }
                StripState::Csi => {
                    if (0x40..=0x7e).contains(&b) {
                        self.state = StripState::Normal;
                    }
                }
            }
        }
    }
}

/// Strips a complete byte slice in one shot.
pub fn strip_ansi(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    AnsiStripper::default().feed(input, &mut out);
    out
}

/// Size-bounded append-only byte buffer with suffix-preserving truncation.
#[derive(Debug)]
pub struct ReplayBuffer {
    /// Stored (already stripped) bytes, newest at the back.
    buf: Vec<u8>,
    /// Maximum stored length.
    capacity: usize,
    /// Stripper state carried across appends.
    stripper: AnsiStripper,
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::with_capacity(REPLAY_CAPACITY)
    }
}

impl ReplayBuffer {
    /// Creates a buffer with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
            stripper: AnsiStripper::default(),
        }
    }

    /// Appends a raw chunk; escapes are stripped before storage and the
    /// oldest bytes are dropped once the capacity is exceeded.
    pub fn append(&mut self, chunk: &[u8]) {
        self.stripper.feed(chunk, &mut self.buf);
        if self.buf.len() > self.capacity {
            let excess = self.buf.len() - self.capacity;
            self.buf.drain(..excess);
        }
    }

    /// Current stored bytes, oldest first.
    pub fn contents(&self) -> &[u8] {
        &self.buf
    }

    /// Stored length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// `true` when nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_plain_text_through() {
        assert_eq!(strip_ansi(b"hello world\r\n"), b"hello world\r\n");
    }

    #[test]
    fn strips_csi_sequences() {
        assert_eq!(strip_ansi(b"\x1b[31mred\x1b[0m"), b"red");
        assert_eq!(strip_ansi(b"a\x1b[2J\x1b[Hb"), b"ab");
        // Parameter and intermediate bytes are consumed too.
        assert_eq!(strip_ansi(b"x\x1b[38;5;196my"), b"xy");
    }

    #[test]
    fn strips_two_byte_escapes() {
        assert_eq!(strip_ansi(b"a\x1bcb"), b"ab");
        assert_eq!(strip_ansi(b"a\x1b7b\x1b8c"), b"abc");
    }

    #[test]
    fn handles_sequence_split_across_chunks() {
        let mut buf = ReplayBuffer::with_capacity(64);
        buf.append(b"a\x1b[3");
        buf.append(b"1mb");
        assert_eq!(buf.contents(), b"ab");
    }

    #[test]
    fn trailing_escape_is_held_back() {
        let mut buf = ReplayBuffer::with_capacity(64);
        buf.append(b"ok\x1b");
        assert_eq!(buf.contents(), b"ok");
        buf.append(b"[0mdone");
        assert_eq!(buf.contents(), b"okdone");
    }

    #[test]
    fn caps_at_capacity_keeping_the_suffix() {
        let mut buf = ReplayBuffer::with_capacity(8);
        buf.append(b"0123456789");
        assert_eq!(buf.contents(), b"23456789");
        buf.append(b"ab");
        assert_eq!(buf.contents(), b"456789ab");
        assert!(buf.len() <= 8);
    }

    #[test]
    fn default_capacity_is_8k() {
        let mut buf = ReplayBuffer::default();
        for _ in 0..10 {
            buf.append(&[b'x'; 1024]);
        }
        assert_eq!(buf.len(), REPLAY_CAPACITY);
    }
}
