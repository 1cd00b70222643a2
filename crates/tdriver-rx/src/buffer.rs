//! Receive buffer and wait engine.
//!
//! [`RxBuffer`] accumulates every chunk the receiver loop hands it and lets
//! any number of callers look for byte patterns in what has arrived so far,
//! either immediately ([`find`](RxBuffer::find)) or by suspending until the
//! pattern shows up or a deadline passes ([`wait`](RxBuffer::wait)).
//!
//! # Synchronization
//!
//! The buffer state lives in a `tokio::sync::watch` channel. Appends go
//! through `send_modify`, which bumps the channel version and wakes every
//! subscribed waiter. A waiter subscribes (marking the current version seen)
//! *before* inspecting the buffer, so an append that lands between a failed
//! check and the start of the wait still bumps the version past the one the
//! waiter saw and the wait returns at once to re-check. Data already present
//! and data arriving later are therefore handled by the same loop.
//!
//! Matching is over the accumulated content, so a pattern split across two
//! chunks by the transport is still found.

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;

use tdriver_core::logger::{Direction, NoteLevel, TrafficLogger};

/// The most recent successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pattern: Bytes,
    span: Range<usize>,
    found: Bytes,
}

impl MatchResult {
    /// The pattern that matched.
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Byte range of the match within the buffer content at lookup time.
    pub fn span(&self) -> Range<usize> {
        self.span.clone()
    }

    /// The chunk holding the match, or the run of adjacent chunks when the
    /// match straddles a chunk boundary.
    pub fn found(&self) -> &[u8] {
        &self.found
    }

    /// [`found`](MatchResult::found) decoded lossily as UTF-8.
    pub fn found_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.found)
    }
}

/// Position of `needle` in `haystack`. An empty needle matches at 0.
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Buffer contents plus bookkeeping, guarded by the watch channel.
#[derive(Debug, Default)]
struct RxState {
    /// Concatenation of every chunk since the last flush.
    content: Vec<u8>,
    /// End offset of each chunk in `content`.
    ends: Vec<usize>,
    /// Chunks delivered since creation. Not reset by flush.
    appended: u64,
    /// No more chunks will ever arrive.
    closed: bool,
}

impl RxState {
    fn push(&mut self, chunk: &[u8], split_lines: bool) {
        if split_lines && !chunk.is_empty() {
            for line in chunk.split_inclusive(|&b| b == b'\n') {
                self.content.extend_from_slice(line);
                self.ends.push(self.content.len());
            }
        } else {
            self.content.extend_from_slice(chunk);
            self.ends.push(self.content.len());
        }
        self.appended += 1;
    }

    fn clear(&mut self) {
        self.content.clear();
        self.ends.clear();
    }

    fn chunk_start(&self, index: usize) -> usize {
        if index == 0 { 0 } else { self.ends[index - 1] }
    }

    fn chunk(&self, index: usize) -> &[u8] {
        &self.content[self.chunk_start(index)..self.ends[index]]
    }

    /// Match anywhere in the accumulated content.
    fn locate(&self, pattern: &[u8]) -> Option<MatchResult> {
        let start = find_bytes(&self.content, pattern)?;
        let end = start + pattern.len();

        // Chunks covering [start, end); an empty buffer has none.
        let found = if self.ends.is_empty() {
            Bytes::new()
        } else {
            let first = self
                .ends
                .partition_point(|&e| e <= start)
                .min(self.ends.len() - 1);
            let last = self
                .ends
                .partition_point(|&e| e < end)
                .clamp(first, self.ends.len() - 1);
            Bytes::copy_from_slice(&self.content[self.chunk_start(first)..self.ends[last]])
        };

        Some(MatchResult {
            pattern: Bytes::copy_from_slice(pattern),
            span: start..end,
            found,
        })
    }

    /// Match within the `nth` (1-based) chunk that contains `pattern`.
    fn locate_nth(&self, pattern: &[u8], nth: usize) -> Option<MatchResult> {
        if nth == 0 {
            return self.locate(pattern);
        }
        (0..self.ends.len())
            .filter_map(|i| find_bytes(self.chunk(i), pattern).map(|at| (i, at)))
            .nth(nth - 1)
            .map(|(i, at)| {
                let start = self.chunk_start(i) + at;
                MatchResult {
                    pattern: Bytes::copy_from_slice(pattern),
                    span: start..start + pattern.len(),
                    found: Bytes::copy_from_slice(self.chunk(i)),
                }
            })
    }
}

/// Shared receive buffer with immediate and blocking pattern lookups.
///
/// The receiver loop is the only caller of [`append`](RxBuffer::append);
/// lookups may come from any number of tasks at once. Share it with
/// `Arc<RxBuffer>`.
pub struct RxBuffer {
    target: String,
    logger: Arc<dyn TrafficLogger>,
    split_lines: bool,
    state: watch::Sender<RxState>,
    last_match: Mutex<Option<MatchResult>>,
}

impl fmt::Debug for RxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxBuffer")
            .field("target", &self.target)
            .field("split_lines", &self.split_lines)
            .finish_non_exhaustive()
    }
}

impl RxBuffer {
    /// Create an empty buffer. Appended chunks are logged to `logger` as
    /// inbound traffic of `target`.
    pub fn new(target: impl Into<String>, logger: Arc<dyn TrafficLogger>) -> Self {
        Self {
            target: target.into(),
            logger,
            split_lines: false,
            state: watch::Sender::new(RxState::default()),
            last_match: Mutex::new(None),
        }
    }

    /// Record each delivered chunk as one chunk per line (terminator kept).
    ///
    /// Only chunk boundaries change: the content, and therefore what
    /// [`find`](RxBuffer::find) sees, is identical.
    pub fn with_split_lines(mut self, split_lines: bool) -> Self {
        self.split_lines = split_lines;
        self
    }

    /// Name of the target this buffer belongs to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Pass a lifecycle note for this target to the traffic logger.
    pub fn note(&self, level: NoteLevel, message: &str) {
        self.logger.note(&self.target, level, message);
    }

    /// Log an outbound payload for this target.
    pub fn record_outbound(&self, payload: &[u8]) {
        self.logger.record(&self.target, Direction::Outbound, payload);
    }

    // -----------------------------------------------------------------------
    // Writer side
    // -----------------------------------------------------------------------

    /// Append `chunk` at the tail, log it, and wake every waiter.
    pub fn append(&self, chunk: Bytes) {
        self.logger.record(&self.target, Direction::Inbound, &chunk);
        let split_lines = self.split_lines;
        self.state.send_modify(|s| s.push(&chunk, split_lines));
    }

    /// Mark the stream as finished and wake every waiter.
    ///
    /// Waits that cannot be satisfied by what is already buffered then
    /// return a negative result instead of running into their timeout.
    pub fn close(&self) {
        self.state.send_modify(|s| s.closed = true);
    }

    /// Atomically discard all buffered chunks.
    ///
    /// The last match result is kept. An append racing the flush lands
    /// entirely before or entirely after it.
    pub fn flush(&self) {
        // Removing data can never satisfy a waiter, so nobody is woken.
        self.state.send_if_modified(|s| {
            s.clear();
            false
        });
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Copy of the accumulated content since the last flush.
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.borrow().content)
    }

    /// Copy of the buffered chunks, oldest first.
    pub fn chunks(&self) -> Vec<Bytes> {
        let state = self.state.borrow();
        (0..state.ends.len())
            .map(|i| Bytes::copy_from_slice(state.chunk(i)))
            .collect()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.state.borrow().content.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunks delivered since creation, flushes included.
    pub fn appended(&self) -> u64 {
        self.state.borrow().appended
    }

    /// Whether [`close`](RxBuffer::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// The most recent successful lookup, if any.
    pub fn last_match(&self) -> Option<MatchResult> {
        self.last_match
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember(&self, found: MatchResult) {
        *self.last_match.lock().unwrap_or_else(PoisonError::into_inner) = Some(found);
    }

    // -----------------------------------------------------------------------
    // Immediate lookups
    // -----------------------------------------------------------------------

    /// Whether `pattern` occurs anywhere in the buffered content.
    pub fn find(&self, pattern: impl AsRef<[u8]>) -> bool {
        let found = self.state.borrow().locate(pattern.as_ref());
        found.map(|m| self.remember(m)).is_some()
    }

    /// The first of `patterns`, in the order given, that occurs anywhere in
    /// the buffered content.
    ///
    /// Candidate order decides, not position: with both present,
    /// `find_multi(&["b", "a"])` on content `"ab"` returns `"b"`.
    pub fn find_multi<'p, P: AsRef<[u8]>>(&self, patterns: &'p [P]) -> Option<&'p P> {
        let (index, found) = locate_first(&self.state.borrow(), patterns)?;
        self.remember(found);
        Some(&patterns[index])
    }

    /// Whether at least `nth` buffered chunks contain `pattern`.
    ///
    /// On success the match result holds the `nth` such chunk. `nth == 0`
    /// behaves like [`find`](RxBuffer::find).
    pub fn find_nth(&self, pattern: impl AsRef<[u8]>, nth: usize) -> bool {
        let found = self.state.borrow().locate_nth(pattern.as_ref(), nth);
        found.map(|m| self.remember(m)).is_some()
    }

    // -----------------------------------------------------------------------
    // Blocking lookups
    // -----------------------------------------------------------------------

    /// Wait until `pattern` occurs in the buffered content.
    ///
    /// Returns `true` at once if it is already there. Otherwise returns
    /// `true` as soon as an append completes it, or `false` once `timeout`
    /// has elapsed or the stream has closed without it.
    pub async fn wait(&self, pattern: impl AsRef<[u8]>, timeout: Duration) -> bool {
        let pattern = pattern.as_ref();
        match self.wait_for(timeout, |s| s.locate(pattern)).await {
            Some(found) => {
                self.remember(found);
                true
            }
            None => false,
        }
    }

    /// Wait until any of `patterns` occurs; returns the first in candidate
    /// order, or `None` on timeout or close.
    pub async fn wait_multi<'p, P: AsRef<[u8]>>(
        &self,
        patterns: &'p [P],
        timeout: Duration,
    ) -> Option<&'p P> {
        let (index, found) = self
            .wait_for(timeout, |s| locate_first(s, patterns))
            .await?;
        self.remember(found);
        Some(&patterns[index])
    }

    /// Wait until at least `nth` buffered chunks contain `pattern`.
    pub async fn wait_nth(&self, pattern: impl AsRef<[u8]>, nth: usize, timeout: Duration) -> bool {
        let pattern = pattern.as_ref();
        match self.wait_for(timeout, |s| s.locate_nth(pattern, nth)).await {
            Some(found) => {
                self.remember(found);
                true
            }
            None => false,
        }
    }

    /// Wait until at least one chunk is appended after this call starts.
    ///
    /// Already-buffered data does not count, and neither does a flush.
    pub async fn wait_any(&self, timeout: Duration) -> bool {
        let baseline = self.state.borrow().appended;
        self.wait_for(timeout, |s| (s.appended > baseline).then_some(()))
            .await
            .is_some()
    }

    /// Re-run `probe` after every append until it yields a value, the
    /// stream closes, or `timeout` elapses.
    async fn wait_for<T>(
        &self,
        timeout: Duration,
        mut probe: impl FnMut(&RxState) -> Option<T>,
    ) -> Option<T> {
        // A timeout too large to represent means no deadline at all.
        let deadline = Instant::now().checked_add(timeout);
        let mut rx = self.state.subscribe();

        loop {
            {
                let state = rx.borrow_and_update();
                if let Some(value) = probe(&*state) {
                    return Some(value);
                }
                if state.closed {
                    return None;
                }
            }

            let changed = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, rx.changed()).await.ok(),
                None => Some(rx.changed().await),
            };
            match changed {
                Some(Ok(())) => continue,
                // Deadline passed. The sender lives in `self`, so `changed`
                // cannot report it dropped while we are borrowed.
                Some(Err(_)) | None => return None,
            }
        }
    }
}

fn locate_first<P: AsRef<[u8]>>(state: &RxState, patterns: &[P]) -> Option<(usize, MatchResult)> {
    patterns
        .iter()
        .enumerate()
        .find_map(|(i, p)| state.locate(p.as_ref()).map(|m| (i, m)))
}
