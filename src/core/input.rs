//! Input buffer manager.
//!
//! Writes only queue items; delivery happens lazily when the output side
//! flushes. Once the process stops accepting input, the rest of the queue
//! is dropped without telling anyone.

use crate::backend::{BackendProcess, WriteOutcome};
use crate::config::types::InputItem;
use std::collections::VecDeque;

/// What a flush did with the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every pending item was handed over
    Drained { delivered: usize },
    /// The process went away; `discarded` items (including the one in
    /// flight) were dropped
    Aborted { delivered: usize, discarded: usize },
}

#[derive(Debug, Default)]
pub struct InputBuffer {
    pending: VecDeque<InputItem>,
    /// Process refused input once; nothing will ever be delivered again
    aborted: bool,
    /// Input stream closed after the last delivered item
    sealed: bool,
    discarded_total: usize,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: InputItem) {
        self.pending.push_back(item);
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn discarded_total(&self) -> usize {
        self.discarded_total
    }

    /// Drop everything still queued.
    pub fn discard_all(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.discarded_total += dropped;
        dropped
    }

    /// Deliver pending items in FIFO order.
    pub fn flush(&mut self, process: &dyn BackendProcess) -> FlushOutcome {
        if self.aborted || self.sealed {
            let discarded = self.discard_all();
            return if discarded == 0 {
                FlushOutcome::Drained { delivered: 0 }
            } else {
                FlushOutcome::Aborted {
                    delivered: 0,
                    discarded,
                }
            };
        }

        let mut delivered = 0;
        while let Some(item) = self.pending.pop_front() {
            match process.write(item) {
                WriteOutcome::Delivered => delivered += 1,
                WriteOutcome::Partial { written } => {
                    log::debug!("input item cut short after {} bytes", written);
                    return self.abort(delivered);
                }
                WriteOutcome::Refused => return self.abort(delivered),
            }
        }
        FlushOutcome::Drained { delivered }
    }

    /// Flush, then close the process's input stream. Later pushes are
    /// dropped on the next flush.
    pub fn seal(&mut self, process: &dyn BackendProcess) -> FlushOutcome {
        let outcome = self.flush(process);
        if !self.sealed {
            self.sealed = true;
            process.seal_input();
        }
        outcome
    }

    fn abort(&mut self, delivered: usize) -> FlushOutcome {
        self.aborted = true;
        // the item in flight counts as discarded
        let discarded = self.discard_all() + 1;
        self.discarded_total += 1;
        FlushOutcome::Aborted {
            delivered,
            discarded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LimitOutcome, ReadChunk};
    use crate::config::types::{BoundKind, Limit, ResourceKind, TerminationReason};
    use std::sync::Mutex;

    /// Accepts `budget` items, then refuses.
    struct CountingProcess {
        budget: Mutex<usize>,
        received: Mutex<Vec<Vec<u8>>>,
        sealed: Mutex<bool>,
    }

    impl CountingProcess {
        fn new(budget: usize) -> Self {
            Self {
                budget: Mutex::new(budget),
                received: Mutex::new(Vec::new()),
                sealed: Mutex::new(false),
            }
        }
    }

    impl BackendProcess for CountingProcess {
        fn write(&self, item: InputItem) -> WriteOutcome {
            let mut budget = self.budget.lock().unwrap();
            if *budget == 0 {
                return WriteOutcome::Refused;
            }
            *budget -= 1;
            if let InputItem::Bytes(bytes) = item {
                self.received.lock().unwrap().push(bytes);
            }
            WriteOutcome::Delivered
        }
        fn seal_input(&self) {
            *self.sealed.lock().unwrap() = true;
        }
        fn read(&self, _max_len: usize) -> ReadChunk {
            ReadChunk::NoMoreOutput
        }
        fn query(&self, _kind: ResourceKind, _bound: BoundKind) -> Option<u64> {
            None
        }
        fn set_limit(&self, _limit: Limit) -> LimitOutcome {
            LimitOutcome::Unsupported
        }
        fn reset_peak_memory(&self) -> bool {
            false
        }
        fn force_exit(&self) {}
        fn wait_terminated(&self) -> TerminationReason {
            TerminationReason::Exited { code: 0 }
        }
    }

    fn bytes(s: &str) -> InputItem {
        InputItem::Bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn test_flush_preserves_fifo_order() {
        let process = CountingProcess::new(10);
        let mut buffer = InputBuffer::new();
        buffer.push(bytes("a"));
        buffer.push(bytes("b"));
        buffer.push(bytes("c"));

        assert_eq!(buffer.flush(&process), FlushOutcome::Drained { delivered: 3 });
        let received = process.received.lock().unwrap().clone();
        assert_eq!(received, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_refusal_discards_rest_of_queue() {
        let process = CountingProcess::new(1);
        let mut buffer = InputBuffer::new();
        buffer.push(bytes("a"));
        buffer.push(bytes("b"));
        buffer.push(bytes("c"));

        assert_eq!(
            buffer.flush(&process),
            FlushOutcome::Aborted {
                delivered: 1,
                discarded: 2
            }
        );
        assert_eq!(buffer.pending(), 0);

        // later input never reaches the backend again
        buffer.push(bytes("d"));
        *process.budget.lock().unwrap() = 5;
        assert!(matches!(buffer.flush(&process), FlushOutcome::Aborted { delivered: 0, .. }));
        assert_eq!(process.received.lock().unwrap().len(), 1);
        assert_eq!(buffer.discarded_total(), 3);
    }

    #[test]
    fn test_seal_closes_input_once() {
        let process = CountingProcess::new(10);
        let mut buffer = InputBuffer::new();
        buffer.push(bytes("x"));

        assert_eq!(buffer.seal(&process), FlushOutcome::Drained { delivered: 1 });
        assert!(buffer.is_sealed());
        assert!(*process.sealed.lock().unwrap());

        buffer.push(bytes("late"));
        assert_eq!(
            buffer.seal(&process),
            FlushOutcome::Aborted {
                delivered: 0,
                discarded: 1
            }
        );
        assert_eq!(process.received.lock().unwrap().len(), 1);
    }
}
