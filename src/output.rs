//! Output buffering for captured process streams.
//!
//! This module provides the indexed, bounded `LogBuffer` that backs the
//! incremental log-retrieval protocol: every captured line gets an absolute,
//! monotonically increasing index, and bounded retention evicts from the
//! front while advancing the minimum available index.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// A bounded buffer of captured lines with absolute indices.
///
/// The first line ever pushed gets index 0. When the buffer is full the
/// oldest lines are dropped and `min_index` advances, so indices are never
/// reused or reordered.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    start_index: i64,
    lines: VecDeque<String>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` retaining at most `max_lines` lines.
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            start_index: 0,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Appends a line to the buffer.
    ///
    /// Returns `true` if an old line was evicted to make room.
    pub fn push(&mut self, line: String) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            self.start_index += 1;
            dropped = true;
        }
        dropped
    }

    /// Returns the number of lines currently retained.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Absolute index of the oldest retained line.
    pub fn min_index(&self) -> i64 {
        self.start_index
    }

    /// Absolute index of the newest retained line, or -1 before any push.
    pub fn max_index(&self) -> i64 {
        self.start_index + self.lines.len() as i64 - 1
    }

    /// Returns all retained lines with an index strictly greater than
    /// `since`, plus whether part of the requested range was evicted.
    ///
    /// `since = -1` requests the full retained buffer.
    pub fn slice_since(&self, since: i64) -> (Vec<String>, bool) {
        let truncated = self.start_index > 0 && since + 1 < self.start_index;
        let skip = (since + 1 - self.start_index).max(0) as usize;
        let lines = self.lines.iter().skip(skip).cloned().collect();
        (lines, truncated)
    }

    /// Point-in-time metadata for snapshots.
    pub fn meta(&self) -> StreamMeta {
        StreamMeta {
            lines: self.len(),
            min_index: self.min_index(),
            max_index: self.max_index(),
        }
    }
}

/// Per-stream buffer metadata reported in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMeta {
    pub lines: usize,
    pub min_index: i64,
    pub max_index: i64,
}

/// Result of an incremental log read over both streams.
///
/// The maxima are the caller's new high-water marks; the minima let it
/// detect how much of the buffer is still retained. Field names follow the
/// wire contract of `GET /api/runner/{name}/logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSlice {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub stdout_max: i64,
    pub stderr_max: i64,
    pub stdout_min: i64,
    pub stderr_min: i64,
    pub truncated: bool,
}

/// Sanitizes a captured line before buffering, stripping ANSI escape codes
/// and replacing invalid UTF-8 sequences.
pub fn sanitize_line(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
