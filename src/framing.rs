//! # Stream Framing
//!
//! A reliable byte stream has no message boundaries of its own; this module
//! supplies them. Four interchangeable modes cover the useful spectrum:
//!
//! - [`StreamMode::PrefixSize`] — `u32` length (native byte order) before
//!   every message. The default, and the only self-describing mode.
//! - [`StreamMode::Postfix`] — a configured sentinel byte sequence after
//!   every message. Thin interop mode for external protocols; the sentinel
//!   is not escaped, so the caller must pick one that cannot collide with
//!   payload bytes.
//! - [`StreamMode::Raw`] — every nonempty read completion is one message.
//! - [`StreamMode::Disabled`] — stream traffic is a protocol error, so a
//!   datagram-only endpoint can refuse accidental stream activity.
//!
//! [`frame_stream`] is the sender half. [`Deframer`] is the receiver half:
//! a state machine fed one arbitrary chunk at a time, accumulating a
//! partial message across chunk boundaries and emitting every completed
//! message. For any mode and any message sequence, deframing the
//! concatenated framed bytes reproduces the sequence no matter where the
//! chunk boundaries fall.

use crate::error::{NetError, Result};

/// How message boundaries are found on the reliable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// `u32` length prefix in native byte order, then the body.
    #[default]
    PrefixSize,
    /// Body, then a configured sentinel sequence.
    Postfix,
    /// Each read completion is delivered as-is.
    Raw,
    /// Stream traffic is rejected.
    Disabled,
}

/// Frame one outgoing message according to `mode`.
pub fn frame_stream(payload: &[u8], mode: StreamMode, postfix: &[u8]) -> Result<Vec<u8>> {
    match mode {
        StreamMode::PrefixSize => {
            let mut framed = Vec::with_capacity(4 + payload.len());
            framed.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
            framed.extend_from_slice(payload);
            Ok(framed)
        }
        StreamMode::Postfix => {
            debug_assert!(!postfix.is_empty());
            let mut framed = Vec::with_capacity(payload.len() + postfix.len());
            framed.extend_from_slice(payload);
            framed.extend_from_slice(postfix);
            Ok(framed)
        }
        StreamMode::Raw => Ok(payload.to_vec()),
        StreamMode::Disabled => Err(NetError::Protocol(
            "stream sends are disabled on this connection".into(),
        )),
    }
}

/// Incremental receive-side framing state machine.
///
/// Feed it chunks as they arrive; completed messages are appended to the
/// caller's output vector. The reassembly buffer is bounded by
/// `max_buffer`: a message that would exceed it either grows the bound
/// (`auto_grow`) or fails with [`NetError::BufferOverflow`], which must
/// terminate the connection.
#[derive(Debug)]
pub struct Deframer {
    mode: StreamMode,
    postfix: Vec<u8>,
    auto_grow: bool,
    max_buffer: usize,
    prefix_scratch: [u8; 4],
    prefix_filled: usize,
    target: Option<usize>,
    partial: Vec<u8>,
}

impl Deframer {
    pub fn new(mode: StreamMode, postfix: Vec<u8>, max_buffer: usize, auto_grow: bool) -> Deframer {
        Deframer {
            mode,
            postfix,
            auto_grow,
            max_buffer,
            prefix_scratch: [0; 4],
            prefix_filled: 0,
            target: None,
            partial: Vec::new(),
        }
    }

    /// Consume `chunk`, appending every message it completes to `out`.
    ///
    /// On error the connection is no longer usable; the deframer makes no
    /// attempt to resynchronize.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Vec<u8>>) -> Result<()> {
        match self.mode {
            StreamMode::PrefixSize => self.feed_prefix(chunk, out),
            StreamMode::Postfix => self.feed_postfix(chunk, out),
            StreamMode::Raw => {
                if !chunk.is_empty() {
                    out.push(chunk.to_vec());
                }
                Ok(())
            }
            StreamMode::Disabled => Err(NetError::Protocol(
                "stream traffic received on a disabled connection".into(),
            )),
        }
    }

    fn feed_prefix(&mut self, mut chunk: &[u8], out: &mut Vec<Vec<u8>>) -> Result<()> {
        while !chunk.is_empty() {
            let target = match self.target {
                Some(target) => target,
                None => {
                    // The length prefix itself can straddle chunk boundaries.
                    let take = (4 - self.prefix_filled).min(chunk.len());
                    self.prefix_scratch[self.prefix_filled..self.prefix_filled + take]
                        .copy_from_slice(&chunk[..take]);
                    self.prefix_filled += take;
                    chunk = &chunk[take..];
                    if self.prefix_filled < 4 {
                        return Ok(());
                    }
                    self.prefix_filled = 0;
                    let target = u32::from_ne_bytes(self.prefix_scratch) as usize;
                    if target > self.max_buffer {
                        if self.auto_grow {
                            self.max_buffer = target;
                        } else {
                            return Err(NetError::BufferOverflow {
                                target,
                                max: self.max_buffer,
                            });
                        }
                    }
                    self.partial.clear();
                    self.partial.reserve(target);
                    self.target = Some(target);
                    target
                }
            };
            let take = (target - self.partial.len()).min(chunk.len());
            self.partial.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if self.partial.len() == target {
                out.push(std::mem::take(&mut self.partial));
                self.target = None;
            }
        }
        Ok(())
    }

    fn feed_postfix(&mut self, chunk: &[u8], out: &mut Vec<Vec<u8>>) -> Result<()> {
        let old_len = self.partial.len();
        self.partial.extend_from_slice(chunk);
        if self.partial.len() > self.max_buffer {
            if self.auto_grow {
                self.max_buffer = self.partial.len();
            } else {
                return Err(NetError::BufferOverflow {
                    target: self.partial.len(),
                    max: self.max_buffer,
                });
            }
        }
        // The sentinel may straddle the boundary between the old tail and
        // the new bytes; back the scan start up accordingly.
        let mut scan_from = old_len.saturating_sub(self.postfix.len().saturating_sub(1));
        while let Some(pos) = find(&self.partial[scan_from..], &self.postfix) {
            let boundary = scan_from + pos;
            let message = self.partial[..boundary].to_vec();
            self.partial.drain(..boundary + self.postfix.len());
            out.push(message);
            scan_from = 0;
        }
        Ok(())
    }

    /// Bytes accumulated toward the current partial message.
    pub fn partial_bytes(&self) -> usize {
        self.partial.len()
    }

    /// Progress of the current partial message as a percentage; `0.0` when
    /// no length target is known (postfix, raw, or between messages).
    pub fn percent(&self) -> f64 {
        match self.target {
            Some(target) if target > 0 => (self.partial.len() as f64 / target as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// Current reassembly limit; grows under the auto-grow policy.
    pub fn max_buffer(&self) -> usize {
        self.max_buffer
    }

    /// Replace the reassembly limit. Takes effect from the next length
    /// decision; an already-accepted partial message is not re-checked.
    pub fn set_max_buffer(&mut self, max_buffer: usize) {
        self.max_buffer = max_buffer;
    }

    /// Switch the auto-grow policy.
    pub fn set_auto_grow(&mut self, auto_grow: bool) {
        self.auto_grow = auto_grow;
    }

    /// Whether the limit grows instead of killing the connection.
    pub fn auto_grow(&self) -> bool {
        self.auto_grow
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `bytes` to `deframer` split into `step`-sized chunks.
    fn feed_chunked(deframer: &mut Deframer, bytes: &[u8], step: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in bytes.chunks(step.max(1)) {
            deframer.feed(chunk, &mut out).unwrap();
        }
        out
    }

    fn frame_all(messages: &[&[u8]], mode: StreamMode, postfix: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        for m in messages {
            wire.extend(frame_stream(m, mode, postfix).unwrap());
        }
        wire
    }

    #[test]
    fn prefix_round_trip_at_every_split() {
        let messages: &[&[u8]] = &[b"hello!!", b"", b"a longer message body", b"x"];
        let wire = frame_all(messages, StreamMode::PrefixSize, &[]);
        for step in 1..=wire.len() {
            let mut deframer = Deframer::new(StreamMode::PrefixSize, Vec::new(), 1024, false);
            let out = feed_chunked(&mut deframer, &wire, step);
            assert_eq!(out.len(), messages.len(), "split size {step}");
            for (got, want) in out.iter().zip(messages) {
                assert_eq!(got.as_slice(), *want, "split size {step}");
            }
        }
    }

    #[test]
    fn postfix_round_trip_at_every_split() {
        let postfix = [0xDE, 0xAD];
        let messages: &[&[u8]] = &[b"AA", b"BB"];
        let wire = frame_all(messages, StreamMode::Postfix, &postfix);
        assert_eq!(wire, b"AA\xDE\xADBB\xDE\xAD");
        for step in 1..=wire.len() {
            let mut deframer = Deframer::new(StreamMode::Postfix, postfix.to_vec(), 1024, false);
            let out = feed_chunked(&mut deframer, &wire, step);
            assert_eq!(out, vec![b"AA".to_vec(), b"BB".to_vec()], "split size {step}");
        }
    }

    #[test]
    fn postfix_sentinel_longer_than_chunk() {
        let postfix = b"ENDMARK".to_vec();
        let mut wire = b"payload".to_vec();
        wire.extend_from_slice(&postfix);
        let mut deframer = Deframer::new(StreamMode::Postfix, postfix, 1024, false);
        let out = feed_chunked(&mut deframer, &wire, 2);
        assert_eq!(out, vec![b"payload".to_vec()]);
        assert_eq!(deframer.partial_bytes(), 0);
    }

    #[test]
    fn raw_delivers_chunks_verbatim() {
        let mut deframer = Deframer::new(StreamMode::Raw, Vec::new(), 16, false);
        let mut out = Vec::new();
        deframer.feed(b"one", &mut out).unwrap();
        deframer.feed(b"", &mut out).unwrap();
        deframer.feed(b"two", &mut out).unwrap();
        assert_eq!(out, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn disabled_rejects_traffic() {
        let mut deframer = Deframer::new(StreamMode::Disabled, Vec::new(), 16, false);
        let mut out = Vec::new();
        assert!(matches!(
            deframer.feed(b"x", &mut out),
            Err(NetError::Protocol(_))
        ));
        assert!(frame_stream(b"x", StreamMode::Disabled, &[]).is_err());
    }

    #[test]
    fn oversize_message_kills_without_auto_grow() {
        let wire = frame_stream(&[0u8; 100], StreamMode::PrefixSize, &[]).unwrap();
        let mut deframer = Deframer::new(StreamMode::PrefixSize, Vec::new(), 64, false);
        let mut out = Vec::new();
        let err = deframer.feed(&wire, &mut out).unwrap_err();
        assert!(matches!(
            err,
            NetError::BufferOverflow { target: 100, max: 64 }
        ));
    }

    #[test]
    fn oversize_message_grows_limit_with_auto_grow() {
        let wire = frame_stream(&[7u8; 100], StreamMode::PrefixSize, &[]).unwrap();
        let mut deframer = Deframer::new(StreamMode::PrefixSize, Vec::new(), 64, true);
        let out = feed_chunked(&mut deframer, &wire, 9);
        assert_eq!(out, vec![vec![7u8; 100]]);
        assert_eq!(deframer.max_buffer(), 100);
    }

    #[test]
    fn percent_is_monotonic_across_completions() {
        let body = vec![0u8; 1000];
        let wire = frame_stream(&body, StreamMode::PrefixSize, &[]).unwrap();
        let mut deframer = Deframer::new(StreamMode::PrefixSize, Vec::new(), 2048, false);
        let mut out = Vec::new();
        let mut last = 0.0f64;
        for chunk in wire.chunks(101) {
            deframer.feed(chunk, &mut out).unwrap();
            if out.is_empty() {
                let now = deframer.percent();
                assert!(now >= last, "{now} < {last}");
                last = now;
            }
        }
        assert_eq!(out.len(), 1);
        assert_eq!(deframer.percent(), 0.0);
    }

    #[test]
    fn prefix_straddles_chunk_boundary() {
        let wire = frame_all(&[b"four", b"five!"], StreamMode::PrefixSize, &[]);
        // 3-byte chunks guarantee the u32 prefix is split every time.
        let mut deframer = Deframer::new(StreamMode::PrefixSize, Vec::new(), 64, false);
        let out = feed_chunked(&mut deframer, &wire, 3);
        assert_eq!(out, vec![b"four".to_vec(), b"five!".to_vec()]);
    }
}
