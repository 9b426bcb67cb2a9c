// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change record framing.
//!
//! The continuous change feed writes one JSON object per line. Transport
//! chunks do not line up with lines: a chunk may hold zero, one or many
//! records, and a record may span several chunks. [`FrameDecoder`] keeps the
//! unconsumed tail in a buffer and only yields complete lines.
//!
//! # Line Kinds
//!
//! | Line | Frame |
//! |------|-------|
//! | empty / whitespace | [`Frame::Heartbeat`] |
//! | `{"last_seq": ...}` | [`Frame::LastSeq`] (server ended the feed) |
//! | `{"seq": ..., "id": ..., "doc": {...}}` | [`Frame::Change`] |
//!
//! # Corruption
//!
//! A line that is not valid JSON is logged and skipped. After
//! `max_consecutive_failures` bad lines in a row the decoder reports
//! [`BusError::Desync`]; the session should be torn down and reopened.
//! A partial line larger than `max_record_bytes` reports [`BusError::Framing`].

use crate::error::{BusError, Result};
use bytes::{Buf, BytesMut};
use serde::Deserialize;
use serde_json::Value;
use tracing::{trace, warn};

/// One entry of a change record's `changes` array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeRecord {
    /// Opaque sequence marker (string or number depending on the store).
    #[serde(default)]
    pub seq: Value,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub changes: Vec<ChangeRev>,
    #[serde(default)]
    pub deleted: bool,
    /// Present when the feed was opened with `include_docs=true`.
    #[serde(default)]
    pub doc: Option<Value>,
}

/// A decoded line of the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Change(ChangeRecord),
    Heartbeat,
    LastSeq(Value),
}

/// Incremental decoder for newline-delimited change records.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Bytes at the front of `buf` already known to contain no newline.
    scanned: usize,
    max_record_bytes: usize,
    max_consecutive_failures: usize,
    consecutive_failures: usize,
    dropped: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(1024 * 1024, 5)
    }
}

impl FrameDecoder {
    pub fn new(max_record_bytes: usize, max_consecutive_failures: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            scanned: 0,
            max_record_bytes,
            max_consecutive_failures: max_consecutive_failures.max(1),
            consecutive_failures: 0,
            dropped: 0,
        }
    }

    /// Append a transport chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes held for an incomplete record.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Records skipped because they failed to parse.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next complete frame, or `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let newline = match self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
                Some(offset) => self.scanned + offset,
                None => {
                    self.scanned = self.buf.len();
                    if self.buf.len() > self.max_record_bytes {
                        return Err(BusError::Framing(format!(
                            "partial record exceeds {} bytes",
                            self.max_record_bytes
                        )));
                    }
                    return Ok(None);
                }
            };

            let line = self.buf.split_to(newline);
            self.buf.advance(1);
            self.scanned = 0;

            match parse_line(&line) {
                Ok(frame) => {
                    self.consecutive_failures = 0;
                    return Ok(Some(frame));
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    self.dropped += 1;
                    warn!(
                        error = %e,
                        len = line.len(),
                        consecutive = self.consecutive_failures,
                        "Failed to parse change record, skipping"
                    );
                    if self.consecutive_failures >= self.max_consecutive_failures {
                        return Err(BusError::Desync {
                            consecutive: self.consecutive_failures,
                        });
                    }
                }
            }
        }
    }

    /// Push a chunk and drain every complete frame it finishes.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.push(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

fn parse_line(line: &[u8]) -> std::result::Result<Frame, serde_json::Error> {
    let line = match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    };

    if line.iter().all(|b| b.is_ascii_whitespace()) {
        trace!("Heartbeat");
        return Ok(Frame::Heartbeat);
    }

    let value: Value = serde_json::from_slice(line)?;
    if let Some(last_seq) = value.get("last_seq") {
        return Ok(Frame::LastSeq(last_seq.clone()));
    }
    let record: ChangeRecord = serde_json::from_value(value)?;
    Ok(Frame::Change(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = r#"{"seq":"1-g1AAAA","id":"abc","changes":[{"rev":"1-x"}],"doc":{"_id":"abc","_rev":"1-x","type":"broadcast","n":1}}"#;

    fn record_line(n: u32) -> String {
        format!(
            "{{\"seq\":{},\"id\":\"doc-{}\",\"changes\":[{{\"rev\":\"1-a\"}}],\"doc\":{{\"_id\":\"doc-{}\",\"n\":{}}}}}\n",
            n, n, n, n
        )
    }

    fn doc_n(frame: &Frame) -> u64 {
        match frame {
            Frame::Change(record) => record.doc.as_ref().unwrap()["n"].as_u64().unwrap(),
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[test]
    fn test_single_complete_record() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(format!("{}\n", RECORD).as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Change(record) => {
                assert_eq!(record.id.as_deref(), Some("abc"));
                assert_eq!(record.changes[0].rev, "1-x");
                assert!(!record.deleted);
                assert_eq!(record.doc.as_ref().unwrap()["type"], "broadcast");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_record_split_across_three_chunks() {
        let line = format!("{}\n", RECORD);
        let bytes = line.as_bytes();
        let (a, rest) = bytes.split_at(10);
        let (b, c) = rest.split_at(40);

        let mut decoder = FrameDecoder::default();
        assert!(decoder.decode(a).unwrap().is_empty());
        assert!(decoder.decode(b).unwrap().is_empty());
        assert_eq!(decoder.buffered_len(), 50);
        let frames = decoder.decode(c).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Change(_)));
    }

    #[test]
    fn test_two_records_in_one_chunk() {
        let chunk = format!("{}{}", record_line(1), record_line(2));
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(chunk.as_bytes()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(doc_n(&frames[0]), 1);
        assert_eq!(doc_n(&frames[1]), 2);
    }

    #[test]
    fn test_trailing_partial_retained() {
        let full = record_line(1);
        let next = record_line(2);
        let chunk = format!("{}{}", full, &next[..15]);

        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(chunk.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.buffered_len(), 15);

        let frames = decoder.decode(next[15..].as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(doc_n(&frames[0]), 2);
    }

    #[test]
    fn test_heartbeats() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(b"\n\n").unwrap();
        assert_eq!(frames, vec![Frame::Heartbeat, Frame::Heartbeat]);
    }

    #[test]
    fn test_crlf_tolerated() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(format!("{}\r\n\r\n", RECORD).as_bytes()).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Frame::Change(_)));
        assert_eq!(frames[1], Frame::Heartbeat);
    }

    #[test]
    fn test_last_seq() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(b"{\"last_seq\":\"42-abc\",\"pending\":0}\n").unwrap();
        assert_eq!(frames, vec![Frame::LastSeq(Value::String("42-abc".into()))]);
    }

    #[test]
    fn test_deleted_change_without_doc() {
        let mut decoder = FrameDecoder::default();
        let frames = decoder
            .decode(b"{\"seq\":7,\"id\":\"gone\",\"changes\":[{\"rev\":\"2-b\"}],\"deleted\":true}\n")
            .unwrap();
        match &frames[0] {
            Frame::Change(record) => {
                assert!(record.deleted);
                assert!(record.doc.is_none());
                assert_eq!(record.seq, Value::from(7));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_record_skipped() {
        let chunk = format!("{{not json\n{}", record_line(3));
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(chunk.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(doc_n(&frames[0]), 3);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn test_non_object_record_skipped() {
        let chunk = format!("[1,2,3]\n{}", record_line(4));
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(chunk.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.dropped(), 1);
    }

    #[test]
    fn test_persistent_corruption_desyncs() {
        let mut decoder = FrameDecoder::new(1024, 3);
        let err = decoder.decode(b"x\ny\nz\n").unwrap_err();
        assert!(matches!(err, BusError::Desync { consecutive: 3 }));
    }

    #[test]
    fn test_good_record_resets_failure_count() {
        let mut decoder = FrameDecoder::new(1024, 3);
        let chunk = format!("x\ny\n{}x\ny\n", record_line(1));
        let frames = decoder.decode(chunk.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.dropped(), 4);
    }

    #[test]
    fn test_oversized_partial_record() {
        let mut decoder = FrameDecoder::new(16, 3);
        decoder.push(&[b'a'; 17]);
        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, BusError::Framing(_)));
    }

    #[test]
    fn test_byte_at_a_time() {
        let line = record_line(9);
        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        for byte in line.as_bytes() {
            frames.extend(decoder.decode(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(doc_n(&frames[0]), 9);
    }
}
