//! Bounded buffer queue between the image reader and the scan workers.
//!
//! The producer blocks in `push` while the queue is at its buffer or byte
//! bound; workers block in `pop` while it is empty. `close` wakes everyone:
//! workers drain what is left and then see `None`.

use crate::sbuf::ScanBuffer;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

#[derive(Debug, Default)]
struct State {
    items: VecDeque<ScanBuffer>,
    bytes: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct WorkQueue {
    max_buffers: usize,
    max_bytes: u64,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl WorkQueue {
    pub fn new(max_buffers: usize, max_bytes: u64) -> Self {
        Self {
            max_buffers: max_buffers.max(1),
            max_bytes: max_bytes.max(1),
            state: Mutex::new(State::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn is_full(&self, st: &State, incoming: u64) -> bool {
        // A single oversized buffer is still admitted into an empty queue.
        !st.items.is_empty()
            && (st.items.len() >= self.max_buffers || st.bytes + incoming > self.max_bytes)
    }

    /// Enqueue, blocking while full. Returns the buffer back if the queue is closed.
    pub fn push(&self, sbuf: ScanBuffer) -> Result<(), ScanBuffer> {
        let size = sbuf.bufsize() as u64;
        let mut st = self.state.lock();
        while !st.closed && self.is_full(&st, size) {
            self.not_full.wait(&mut st);
        }
        if st.closed {
            return Err(sbuf);
        }
        st.bytes += size;
        st.items.push_back(sbuf);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue, blocking while empty. `None` once closed and drained.
    pub fn pop(&self) -> Option<ScanBuffer> {
        let mut st = self.state.lock();
        loop {
            if let Some(sbuf) = st.items.pop_front() {
                st.bytes -= sbuf.bufsize() as u64;
                self.not_full.notify_one();
                return Some(sbuf);
            }
            if st.closed {
                return None;
            }
            self.not_empty.wait(&mut st);
        }
    }

    /// Stop accepting work; blocked workers drain and exit.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Accept work again after a previous `close`.
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    /// Drop everything still queued (cancellation).
    pub fn clear(&self) -> usize {
        let mut st = self.state.lock();
        let dropped = st.items.len();
        st.items.clear();
        st.bytes = 0;
        self.not_full.notify_all();
        dropped
    }

    /// `(buffers, bytes)` currently waiting.
    pub fn depth(&self) -> (usize, u64) {
        let st = self.state.lock();
        (st.items.len(), st.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ForensicPath;
    use std::sync::Arc;

    fn buf(off: u64, len: usize) -> ScanBuffer {
        ScanBuffer::from_vec(ForensicPath::new(off), vec![0u8; len])
    }

    #[test]
    fn test_depth_tracks_bytes() {
        let q = WorkQueue::new(4, 1 << 20);
        q.push(buf(0, 100)).unwrap();
        q.push(buf(100, 50)).unwrap();
        assert_eq!(q.depth(), (2, 150));
        assert_eq!(q.pop().unwrap().pos0().to_string(), "0");
        assert_eq!(q.depth(), (1, 50));
        q.close();
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
        assert_eq!(q.depth(), (0, 0));
        assert!(q.push(buf(0, 1)).is_err());
    }

    #[test]
    fn test_producer_blocks_until_consumed() {
        let q = Arc::new(WorkQueue::new(1, 1 << 20));
        let consumer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(b) = q.pop() {
                    seen.push(b.pos0().root_offset());
                }
                seen
            })
        };
        for i in 0..20 {
            q.push(buf(i, 8)).unwrap();
            assert!(q.depth().0 <= 1);
        }
        q.close();
        let seen = consumer.join().unwrap();
        assert_eq!(seen, (0..20).collect::<Vec<u64>>());
        assert_eq!(q.depth(), (0, 0));
    }

    #[test]
    fn test_oversized_buffer_admitted_when_empty() {
        let q = WorkQueue::new(8, 10);
        q.push(buf(0, 64)).unwrap();
        assert_eq!(q.depth(), (1, 64));
    }
}
