//! Incremental control-mode protocol parser (spec §4.4).
//!
//! Drives a [`crate::ring::RingBuffer`] to steady state: while the ring's
//! prefix begins with a complete line (or, for `%begin`, a complete framed
//! block), it is consumed and turned into a [`Parsed`] item; the loop stops
//! on the first incomplete prefix and waits for more bytes.

use crate::ring::RingBuffer;
use crate::scheduler::DirtyFlags;

/// Event names recognised at the start of a `%<name> ...\n` line, in the
/// order the candidate table is scanned (spec §4.4).
const CANDIDATES: &[(&str, EventKind)] = &[
    ("begin", EventKind::Begin),
    ("end", EventKind::End),
    ("error", EventKind::Error),
    ("client-session-changed", EventKind::ClientSessionChanged),
    ("exit", EventKind::Exit),
    ("layout-change", EventKind::LayoutChange),
    ("output", EventKind::Output),
    ("pane-mode-changed", EventKind::PaneModeChanged),
    ("session-changed", EventKind::SessionChanged),
    ("session-renamed", EventKind::SessionRenamed),
    ("session-window-changed", EventKind::SessionWindowChanged),
    ("sessions-changed", EventKind::SessionsChanged),
    ("unlinked-window-add", EventKind::UnlinkedWindowAdd),
    ("unlinked-window-close", EventKind::UnlinkedWindowClose),
    ("unlinked-window-renamed", EventKind::UnlinkedWindowRenamed),
    ("window-add", EventKind::WindowAdd),
    ("window-close", EventKind::WindowClose),
    ("window-pane-changed", EventKind::WindowPaneChanged),
    ("window-renamed", EventKind::WindowRenamed),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Begin,
    End,
    Error,
    ClientSessionChanged,
    Exit,
    LayoutChange,
    Output,
    PaneModeChanged,
    SessionChanged,
    SessionRenamed,
    SessionWindowChanged,
    SessionsChanged,
    UnlinkedWindowAdd,
    UnlinkedWindowClose,
    UnlinkedWindowRenamed,
    WindowAdd,
    WindowClose,
    WindowPaneChanged,
    WindowRenamed,
}

impl EventKind {
    /// Dirty bits this event contributes (spec §4.4's dispatch table).
    /// `Begin`/`End`/`Error` never reach here directly — framing is handled
    /// separately by [`Parser::step`] before the generic dispatch runs.
    pub fn dirty_bits(self) -> DirtyFlags {
        match self {
            EventKind::ClientSessionChanged => DirtyFlags::CLIENTS,
            EventKind::LayoutChange | EventKind::PaneModeChanged | EventKind::WindowPaneChanged => {
                DirtyFlags::PANES
            }
            EventKind::SessionsChanged => DirtyFlags::SESSIONS,
            EventKind::SessionWindowChanged
            | EventKind::WindowAdd
            | EventKind::WindowClose
            | EventKind::UnlinkedWindowAdd
            | EventKind::UnlinkedWindowClose => DirtyFlags::WINDOWS,
            EventKind::Output
            | EventKind::WindowRenamed
            | EventKind::UnlinkedWindowRenamed
            | EventKind::SessionChanged
            | EventKind::SessionRenamed
            | EventKind::Exit => DirtyFlags::NONE,
            EventKind::Begin | EventKind::End | EventKind::Error => DirtyFlags::NONE,
        }
    }
}

/// One item produced by a single call to [`Parser::step`].
#[derive(Debug)]
pub enum Parsed {
    /// A recognised, non-framing event line; carries the dirty bits it sets.
    Event(EventKind, DirtyFlags),
    /// A line that didn't match any candidate; the bad line was consumed to
    /// resynchronise and parsing can continue.
    Invalid,
    /// A complete `%begin ... %end|%error ...` block.
    Framed { payload: Vec<u8>, is_error: bool },
}

pub struct Parser;

impl Parser {
    /// Attempts to consume exactly one complete item from the front of
    /// `ring`. Returns `None` if the ring's prefix is incomplete (caller
    /// should stop and wait for more bytes).
    pub fn step(ring: &mut RingBuffer) -> Option<Parsed> {
        let snapshot = flatten(ring);
        if snapshot.is_empty() {
            return None;
        }
        if snapshot[0] != b'%' {
            // Desync: drop one byte and let the caller retry from the next.
            ring.pop(1);
            return Some(Parsed::Invalid);
        }

        let line_end = find_byte(&snapshot, b'\n')?;
        let name_end = snapshot[1..line_end]
            .iter()
            .position(|&b| b == b' ')
            .map(|i| i + 1)
            .unwrap_or(line_end);
        let name = std::str::from_utf8(&snapshot[1..name_end]).ok()?;

        let kind = CANDIDATES.iter().find(|(n, _)| *n == name).map(|(_, k)| *k);

        match kind {
            None => {
                ring.pop(line_end + 1);
                Some(Parsed::Invalid)
            }
            Some(EventKind::Begin) => parse_framed_block(ring, &snapshot, line_end),
            Some(EventKind::End) | Some(EventKind::Error) => {
                // A close line with no matching open is itself malformed
                // input from the server; treat it as noise and resync.
                ring.pop(line_end + 1);
                Some(Parsed::Invalid)
            }
            Some(kind) => {
                let bits = kind.dirty_bits();
                ring.pop(line_end + 1);
                Some(Parsed::Event(kind, bits))
            }
        }
    }
}

/// Parses the three numeric fields after `%begin`/`%end`/`%error`.
fn parse_triple(line: &str) -> Option<(u64, u64, u64)> {
    let mut parts = line.split_whitespace();
    let _name = parts.next()?;
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    let c = parts.next()?.parse().ok()?;
    Some((a, b, c))
}

/// Handles the `%begin ... %end|%error ...` framing described in spec
/// §4.4: the closing line's triple must match the opening triple exactly,
/// and a line that merely looks like a close but has a mismatched triple
/// is payload, not the close (scenario S6).
fn parse_framed_block(ring: &mut RingBuffer, snapshot: &[u8], begin_line_end: usize) -> Option<Parsed> {
    let begin_line = std::str::from_utf8(&snapshot[..begin_line_end]).ok()?;
    let open_triple = parse_triple(begin_line)?;

    let mut cursor = begin_line_end + 1;
    let payload_start = cursor;

    loop {
        let rest = &snapshot[cursor..];
        let next_nl = find_byte(rest, b'\n')?; // None => need more data
        let candidate_line = &snapshot[cursor..cursor + next_nl];
        let candidate_str = std::str::from_utf8(candidate_line).ok();

        if let Some(s) = candidate_str {
            let is_end = s.starts_with("%end ") || s == "%end";
            let is_error = s.starts_with("%error ") || s == "%error";
            if is_end || is_error {
                if let Some(triple) = parse_triple(s) {
                    if triple == open_triple {
                        let payload = snapshot[payload_start..cursor].to_vec();
                        let total_len = cursor + next_nl + 1;
                        ring.pop(total_len);
                        return Some(Parsed::Framed { payload, is_error });
                    }
                }
            }
        }

        cursor += next_nl + 1;
        if cursor > snapshot.len() {
            return None;
        }
    }
}

fn flatten(ring: &RingBuffer) -> Vec<u8> {
    let (a, b) = ring.peek();
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_simple_dirty_event() {
        let mut ring = RingBuffer::new();
        ring.push(b"%sessions-changed\n").unwrap();
        match Parser::step(&mut ring).unwrap() {
            Parsed::Event(EventKind::SessionsChanged, bits) => {
                assert!(bits.contains(DirtyFlags::SESSIONS))
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn unrecognised_name_resyncs() {
        let mut ring = RingBuffer::new();
        ring.push(b"%not-a-real-event foo\n%sessions-changed\n").unwrap();
        assert!(matches!(Parser::step(&mut ring), Some(Parsed::Invalid)));
        match Parser::step(&mut ring).unwrap() {
            Parsed::Event(EventKind::SessionsChanged, _) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn incomplete_line_needs_more_data() {
        let mut ring = RingBuffer::new();
        ring.push(b"%sessions-chan").unwrap();
        assert!(Parser::step(&mut ring).is_none());
    }

    #[test]
    fn simple_framed_block() {
        let mut ring = RingBuffer::new();
        ring.push(b"%begin 1700000000 42 0\nok\n%end 1700000000 42 0\n")
            .unwrap();
        match Parser::step(&mut ring).unwrap() {
            Parsed::Framed { payload, is_error } => {
                assert_eq!(payload, b"ok\n");
                assert!(!is_error);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ring.is_empty());
    }

    /// Scenario S6: a mismatched-triple line inside a block is payload, not
    /// the close.
    #[test]
    fn mismatched_triple_is_payload() {
        let mut ring = RingBuffer::new();
        ring.push(
            b"%begin 1700000001 43 0\nfoo\n%end 1700000001 99 0\nstill payload\n%end 1700000001 43 0\n",
        )
        .unwrap();
        match Parser::step(&mut ring).unwrap() {
            Parsed::Framed { payload, is_error } => {
                assert!(!is_error);
                assert_eq!(
                    payload,
                    b"foo\n%end 1700000001 99 0\nstill payload\n".to_vec()
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_close_is_flagged() {
        let mut ring = RingBuffer::new();
        ring.push(b"%begin 1 2 3\nboom\n%error 1 2 3\n").unwrap();
        match Parser::step(&mut ring).unwrap() {
            Parsed::Framed { payload, is_error } => {
                assert!(is_error);
                assert_eq!(payload, b"boom\n");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
