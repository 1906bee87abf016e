//! One direction of a duplex pipe: a flow-controlled chain of segments.
//!
//! # Responsibilities
//! - Append written bytes to a chain of pooled segments
//! - Hand the reader zero-copy views over unconsumed bytes
//! - Suspend the writer above the high watermark until the reader drains
//!   below the low watermark
//! - Recycle fully consumed segments once no read view references them
//!
//! # Design Decisions
//! - Exactly one writer and one reader; both ends take `&mut self`
//! - All shared state sits behind one short-held mutex, never across an await
//! - A read view clones segment handles, so a segment that is visible to the
//!   reader is never written again; the writer moves on to a fresh segment

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::pool::{Poolable, Pooled, Segment, SegmentPool};

/// Backpressure thresholds, in bytes.
///
/// The writer pauses once unconsumed bytes exceed `high` and resumes once
/// they fall below `low`. A `high` of zero disables backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    /// # Panics
    /// Panics if `low > high`.
    pub fn new(high: usize, low: usize) -> Self {
        assert!(low <= high, "low watermark must not exceed high watermark");
        Self { high, low }
    }

    /// No backpressure at all.
    pub fn unbounded() -> Self {
        Self { high: 0, low: 0 }
    }

    fn pauses(&self) -> bool {
        self.high > 0
    }

    fn resume_below(&self) -> usize {
        // A low watermark of zero means "resume once fully drained".
        self.low.max(1)
    }
}

/// Error returned by pipe operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipeError {
    /// The pipe was canceled; unconsumed data has been discarded.
    #[error("pipe operation was canceled")]
    Canceled,
    /// The reader is gone; written data would never be consumed.
    #[error("the reading side of the pipe has completed")]
    ReaderCompleted,
    /// `advance` was asked to consume more than is available.
    #[error("cannot advance {requested} bytes, only {available} unconsumed")]
    AdvancePastEnd { requested: usize, available: usize },
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// The reader has completed; further writes are pointless.
    pub is_completed: bool,
}

/// Outcome of a read.
#[derive(Debug)]
pub struct ReadResult {
    /// All currently unconsumed bytes.
    pub buffer: ReadView,
    /// The writer has completed: `buffer` holds everything that is left.
    pub is_completed: bool,
}

struct Chunk {
    segment: Pooled<Segment>,
    start: usize,
}

impl Chunk {
    fn available(&self) -> usize {
        self.segment.len() - self.start
    }
}

#[derive(Default)]
struct State {
    chunks: VecDeque<Chunk>,
    unconsumed: usize,
    writer_completed: bool,
    reader_completed: bool,
    canceled: bool,
    /// Consumed segments still referenced by an outstanding read view.
    retired: Vec<Pooled<Segment>>,
}

struct Shared {
    state: Mutex<State>,
    read_ready: Notify,
    write_ready: Notify,
    watermarks: Watermarks,
    pool: SegmentPool,
}

impl Shared {
    fn recycle(&self, state: &mut State) {
        if state.retired.is_empty() {
            return;
        }
        for segment in std::mem::take(&mut state.retired) {
            if !segment.is_unique() {
                state.retired.push(segment);
                continue;
            }
            if let Err(e) = self.pool.pool().give_back(segment) {
                tracing::error!(error = %e, "Failed to recycle pipe segment");
            }
        }
    }

    fn discard_all(&self, state: &mut State) {
        while let Some(chunk) = state.chunks.pop_front() {
            state.retired.push(chunk.segment);
        }
        state.unconsumed = 0;
        self.recycle(state);
    }

    fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if state.canceled {
                return;
            }
            state.canceled = true;
            self.discard_all(&mut state);
        }
        self.read_ready.notify_one();
        self.write_ready.notify_one();
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.writer_completed = true;
            state.reader_completed = true;
            self.discard_all(&mut state);
        }
        self.read_ready.notify_one();
        self.write_ready.notify_one();
    }
}

/// Create one flow-controlled byte channel.
pub fn pipe(pool: SegmentPool, watermarks: Watermarks) -> (PipeWriter, PipeReader, PipeControl) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::default()),
        read_ready: Notify::new(),
        write_ready: Notify::new(),
        watermarks,
        pool,
    });

    (
        PipeWriter {
            shared: Arc::clone(&shared),
            completed: false,
        },
        PipeReader {
            shared: Arc::clone(&shared),
            completed: false,
        },
        PipeControl { shared },
    )
}

/// Producing end of a pipe.
///
/// Dropping the writer completes it, unless the thread is panicking, in which
/// case the pipe is canceled.
pub struct PipeWriter {
    shared: Arc<Shared>,
    completed: bool,
}

impl PipeWriter {
    /// Append bytes without waiting for backpressure to clear.
    pub fn append(&mut self, data: &[u8]) -> Result<(), PipeError> {
        let mut state = self.shared.state.lock();
        if state.canceled {
            return Err(PipeError::Canceled);
        }
        if state.reader_completed {
            return Err(PipeError::ReaderCompleted);
        }
        if data.is_empty() {
            return Ok(());
        }

        self.shared.recycle(&mut state);

        let mut rest = data;
        while !rest.is_empty() {
            let copied = match state.chunks.back_mut() {
                Some(tail) => tail
                    .segment
                    .get_mut()
                    .map_or(0, |segment| segment.extend_from(rest)),
                None => 0,
            };
            if copied == 0 {
                // Tail is full or shared with a read view.
                let segment = self.shared.pool.pool().rent();
                state.chunks.push_back(Chunk { segment, start: 0 });
                continue;
            }
            rest = &rest[copied..];
        }
        state.unconsumed += data.len();
        drop(state);

        self.shared.read_ready.notify_one();
        Ok(())
    }

    /// Wait until the reader has drained below the low watermark, if the
    /// high watermark is currently exceeded.
    pub async fn flush(&mut self) -> Result<FlushResult, PipeError> {
        let watermarks = self.shared.watermarks;
        let mut paused = false;
        loop {
            {
                let state = self.shared.state.lock();
                if state.canceled {
                    return Err(PipeError::Canceled);
                }
                if state.reader_completed {
                    return Ok(FlushResult { is_completed: true });
                }
                let must_wait = if paused {
                    state.unconsumed >= watermarks.resume_below()
                } else {
                    watermarks.pauses() && state.unconsumed > watermarks.high
                };
                if !must_wait {
                    return Ok(FlushResult { is_completed: false });
                }
            }
            paused = true;
            self.shared.write_ready.notified().await;
        }
    }

    /// Append then flush.
    pub async fn write(&mut self, data: &[u8]) -> Result<FlushResult, PipeError> {
        self.append(data)?;
        self.flush().await
    }

    /// Whether unconsumed bytes are above the high watermark.
    pub fn is_backpressured(&self) -> bool {
        let watermarks = self.shared.watermarks;
        watermarks.pauses() && self.shared.state.lock().unconsumed > watermarks.high
    }

    /// Mark end of stream. The reader still sees everything written so far.
    pub fn complete(mut self) {
        self.finish(false);
    }

    /// Abort the pipe, discarding unconsumed data.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    fn finish(&mut self, cancel: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        if cancel {
            self.shared.cancel();
            return;
        }
        self.shared.state.lock().writer_completed = true;
        self.shared.read_ready.notify_one();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.finish(std::thread::panicking());
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter")
            .field("completed", &self.completed)
            .finish()
    }
}

/// Consuming end of a pipe.
pub struct PipeReader {
    shared: Arc<Shared>,
    completed: bool,
}

impl PipeReader {
    /// Wait for unconsumed bytes or writer completion.
    ///
    /// After the writer completes this never blocks: it returns whatever is
    /// left, then empty views, all flagged `is_completed`.
    pub async fn read(&mut self) -> Result<ReadResult, PipeError> {
        loop {
            if let Some(result) = self.try_read()? {
                return Ok(result);
            }
            self.shared.read_ready.notified().await;
        }
    }

    /// Non-blocking variant of [`read`](Self::read).
    pub fn try_read(&mut self) -> Result<Option<ReadResult>, PipeError> {
        let mut state = self.shared.state.lock();
        if state.canceled {
            return Err(PipeError::Canceled);
        }
        // Views dropped since the last advance no longer pin their segments.
        self.shared.recycle(&mut state);
        if state.unconsumed == 0 && !state.writer_completed {
            return Ok(None);
        }
        Ok(Some(ReadResult {
            buffer: ReadView::capture(&state),
            is_completed: state.writer_completed,
        }))
    }

    /// Commit consumption of `n` bytes from the front.
    pub fn advance(&mut self, n: usize) -> Result<(), PipeError> {
        let mut state = self.shared.state.lock();
        if state.canceled {
            return Err(PipeError::Canceled);
        }
        if n > state.unconsumed {
            return Err(PipeError::AdvancePastEnd {
                requested: n,
                available: state.unconsumed,
            });
        }

        let mut remaining = n;
        loop {
            let is_last = state.chunks.len() == 1;
            let Some(front) = state.chunks.front_mut() else {
                break;
            };
            let take = remaining.min(front.available());
            front.start += take;
            remaining -= take;
            if front.available() > 0 {
                break;
            }
            if is_last {
                // Keep filling the tail in place while nobody else sees it.
                if let Some(segment) = front.segment.get_mut() {
                    if !segment.is_full() {
                        segment.reset();
                        front.start = 0;
                        break;
                    }
                }
            }
            if let Some(chunk) = state.chunks.pop_front() {
                state.retired.push(chunk.segment);
            }
        }

        state.unconsumed -= n;
        self.shared.recycle(&mut state);
        let resume = n > 0 && state.unconsumed < self.shared.watermarks.resume_below();
        drop(state);

        if resume {
            self.shared.write_ready.notify_one();
        }
        Ok(())
    }

    /// Stop reading. Unconsumed data is dropped and the writer is told.
    pub fn complete(mut self) {
        self.finish(false);
    }

    /// Abort the pipe, discarding unconsumed data.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    fn finish(&mut self, cancel: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        if cancel {
            self.shared.cancel();
            return;
        }
        {
            let mut state = self.shared.state.lock();
            state.reader_completed = true;
            self.shared.discard_all(&mut state);
        }
        self.shared.write_ready.notify_one();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.finish(std::thread::panicking());
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader")
            .field("completed", &self.completed)
            .finish()
    }
}

/// Out-of-band handle used by the owning connection to tear a pipe down.
#[derive(Clone)]
pub struct PipeControl {
    shared: Arc<Shared>,
}

impl PipeControl {
    /// Abort both ends, waking any suspended reader or writer with
    /// [`PipeError::Canceled`].
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Complete both ends and return every segment to the pool.
    pub fn release(&self) {
        self.shared.release();
    }

    pub fn unconsumed(&self) -> usize {
        self.shared.state.lock().unconsumed
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.state.lock().canceled
    }
}

impl fmt::Debug for PipeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PipeControl")
            .field("unconsumed", &state.unconsumed)
            .field("segments", &state.chunks.len())
            .field("canceled", &state.canceled)
            .finish()
    }
}

struct Slice {
    segment: Pooled<Segment>,
    start: usize,
    end: usize,
}

/// Zero-copy view over the unconsumed bytes of a pipe at read time.
///
/// Holding a view keeps its segments out of the pool; drop it soon after
/// calling `advance`.
pub struct ReadView {
    slices: Vec<Slice>,
    len: usize,
}

impl ReadView {
    fn capture(state: &State) -> Self {
        let slices = state
            .chunks
            .iter()
            .filter(|chunk| chunk.available() > 0)
            .map(|chunk| Slice {
                segment: chunk.segment.clone(),
                start: chunk.start,
                end: chunk.segment.len(),
            })
            .collect();

        Self {
            slices,
            len: state.unconsumed,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Contiguous pieces in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.slices
            .iter()
            .map(|slice| &slice.segment.as_slice()[slice.start..slice.end])
    }

    /// Copy the first `dst.len()` bytes (or fewer) into `dst`.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in self.chunks() {
            if copied == dst.len() {
                break;
            }
            let n = chunk.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
        }
        copied
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl fmt::Debug for ReadView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadView")
            .field("len", &self.len)
            .field("segments", &self.slices.len())
            .finish()
    }
}
