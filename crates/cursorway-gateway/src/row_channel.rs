//! Bounded row buffer between an engine thread and fetch requests
//!
//! The producer blocks while the buffer is full, the consumer blocks until it
//! has what it asked for or the stream ends. End of stream is the channel's
//! closed state: once closed and drained the channel is finished for good and
//! every later fetch returns immediately with no rows.

use cursorway_common::{CursorwayError, Result, Row};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Default per-execution buffer size
pub const DEFAULT_CAPACITY: usize = 50;

/// How many rows a fetch may return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchLimit {
    /// Everything until end of stream
    Unbounded,
    AtMost(usize),
}

impl FetchLimit {
    /// Wire form: `-1` is unbounded, other negative values are rejected
    pub fn from_wire(limit: i64) -> Result<Self> {
        match limit {
            -1 => Ok(FetchLimit::Unbounded),
            n if n >= 0 => Ok(FetchLimit::AtMost(usize::try_from(n).unwrap_or(usize::MAX))),
            n => Err(CursorwayError::InvalidArgument(format!(
                "fetch limit must be -1 or non-negative, got {}",
                n
            ))),
        }
    }

    fn max_rows(self) -> usize {
        match self {
            FetchLimit::Unbounded => usize::MAX,
            FetchLimit::AtMost(n) => n,
        }
    }
}

/// Returned by `push` once the channel no longer accepts rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<Row>,
    closed: bool,
    finished: bool,
}

pub struct RowChannel {
    state: Mutex<ChannelState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl RowChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append rows in order, blocking while the buffer is full.
    pub fn push(&self, rows: Vec<Row>) -> std::result::Result<(), Closed> {
        let mut state = self.state.lock();
        for row in rows {
            while state.queue.len() >= self.capacity && !state.closed {
                self.not_full.wait(&mut state);
            }
            if state.closed {
                return Err(Closed);
            }
            state.queue.push_back(row);
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Stop accepting rows and wake every waiter. Buffered rows stay fetchable.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }

    /// Take up to `limit` rows, waiting until that many are available or the
    /// stream ends. A short result means the channel is now finished.
    pub fn fetch(&self, limit: FetchLimit) -> Vec<Row> {
        let max = limit.max_rows();
        let mut state = self.state.lock();
        if state.finished || max == 0 {
            return Vec::new();
        }

        let mut rows = Vec::new();
        loop {
            let before = rows.len();
            while rows.len() < max {
                match state.queue.pop_front() {
                    Some(row) => rows.push(row),
                    None => break,
                }
            }
            if rows.len() > before {
                self.not_full.notify_all();
            }

            if state.closed && state.queue.is_empty() {
                state.finished = true;
                break;
            }
            if rows.len() >= max {
                break;
            }
            self.not_empty.wait(&mut state);
        }
        rows
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl Default for RowChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cursorway_common::Value;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn rows(range: std::ops::Range<i64>) -> Vec<Row> {
        range.map(|i| Row::new(vec![Value::Int(i)])).collect()
    }

    fn ids(rows: &[Row]) -> Vec<i64> {
        rows.iter()
            .map(|r| match r.values[0] {
                Value::Int(v) => v,
                ref other => panic!("unexpected value {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_wire_limits() {
        assert_eq!(FetchLimit::from_wire(-1).unwrap(), FetchLimit::Unbounded);
        assert_eq!(FetchLimit::from_wire(0).unwrap(), FetchLimit::AtMost(0));
        assert_eq!(FetchLimit::from_wire(10).unwrap(), FetchLimit::AtMost(10));
        assert!(matches!(
            FetchLimit::from_wire(-2),
            Err(CursorwayError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fetch_after_close_drains_then_finishes() {
        let channel = RowChannel::new(10);
        channel.push(rows(0..3)).unwrap();
        channel.close();

        assert_eq!(ids(&channel.fetch(FetchLimit::AtMost(2))), vec![0, 1]);
        assert!(!channel.is_finished());
        assert_eq!(ids(&channel.fetch(FetchLimit::AtMost(2))), vec![2]);
        assert!(channel.is_finished());

        // Terminal: never blocks again
        assert!(channel.fetch(FetchLimit::AtMost(5)).is_empty());
        assert!(channel.fetch(FetchLimit::Unbounded).is_empty());
    }

    #[test]
    fn test_exact_multiple_needs_one_empty_fetch() {
        let channel = RowChannel::new(10);
        channel.push(rows(0..4)).unwrap();
        channel.close();

        assert_eq!(channel.fetch(FetchLimit::AtMost(2)).len(), 2);
        assert_eq!(channel.fetch(FetchLimit::AtMost(2)).len(), 2);
        assert!(channel.is_finished());
        assert!(channel.fetch(FetchLimit::AtMost(2)).is_empty());
    }

    #[test]
    fn test_zero_limit_returns_immediately() {
        let channel = RowChannel::new(10);
        assert!(channel.fetch(FetchLimit::AtMost(0)).is_empty());
        assert!(!channel.is_finished());
    }

    #[test]
    fn test_push_after_close_is_rejected() {
        let channel = RowChannel::new(10);
        channel.close();
        assert_eq!(channel.push(rows(0..1)), Err(Closed));
    }

    #[test]
    fn test_close_unblocks_full_producer() {
        let channel = Arc::new(RowChannel::new(2));
        let producer = {
            let channel = channel.clone();
            thread::spawn(move || channel.push(rows(0..5)))
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(channel.buffered(), 2);
        channel.close();
        assert_eq!(producer.join().unwrap(), Err(Closed));
    }

    #[test]
    fn test_close_unblocks_waiting_consumer() {
        let channel = Arc::new(RowChannel::new(2));
        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || channel.fetch(FetchLimit::AtMost(10)))
        };

        thread::sleep(Duration::from_millis(50));
        channel.close();
        assert!(consumer.join().unwrap().is_empty());
        assert!(channel.is_finished());
    }

    #[test]
    fn test_unbounded_fetch_outlasts_capacity() {
        let channel = Arc::new(RowChannel::new(DEFAULT_CAPACITY));
        let producer = {
            let channel = channel.clone();
            thread::spawn(move || {
                for chunk in rows(0..120).chunks(7) {
                    channel.push(chunk.to_vec()).unwrap();
                }
                channel.close();
            })
        };

        let fetched = channel.fetch(FetchLimit::Unbounded);
        producer.join().unwrap();
        assert_eq!(ids(&fetched), (0..120).collect::<Vec<_>>());
        assert!(channel.is_finished());
    }

    #[test]
    fn test_paged_fetch_totals() {
        for (total, page) in [(0, 1), (1, 1), (7, 3), (50, 50), (51, 10), (120, 7)] {
            let channel = Arc::new(RowChannel::new(5));
            let producer = {
                let channel = channel.clone();
                thread::spawn(move || {
                    channel.push(rows(0..total)).unwrap();
                    channel.close();
                })
            };

            let mut seen = Vec::new();
            loop {
                let batch = channel.fetch(FetchLimit::AtMost(page));
                let short = batch.len() < page;
                seen.extend(ids(&batch));
                if short {
                    break;
                }
            }
            producer.join().unwrap();
            assert_eq!(seen, (0..total).collect::<Vec<_>>(), "total {} page {}", total, page);
            assert!(channel.is_finished());
        }
    }
}
