//! Output channel.
//!
//! Blocking read path. Chunks larger than the caller's buffer are carried
//! over to the next read; once the backend reports no more output the
//! channel is exhausted for good.

use crate::backend::{BackendProcess, ReadChunk};
use std::time::Duration;

/// Pause before asking the backend again after it had nothing ready
const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct OutputChannel {
    carry: Vec<u8>,
    cursor: usize,
    exhausted: bool,
}

impl OutputChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.carried() == 0
    }

    fn carried(&self) -> usize {
        self.carry.len() - self.cursor
    }

    fn take_carry(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.carried());
        buf[..n].copy_from_slice(&self.carry[self.cursor..self.cursor + n]);
        self.cursor += n;
        if self.cursor == self.carry.len() {
            self.carry.clear();
            self.cursor = 0;
        }
        n
    }

    /// Read at least one byte, blocking on the backend when nothing is
    /// carried over. `None` means end of output; it is sticky.
    pub fn read(&mut self, process: Option<&dyn BackendProcess>, buf: &mut [u8]) -> Option<usize> {
        if self.carried() > 0 {
            return Some(self.take_carry(buf));
        }
        if self.exhausted {
            return None;
        }
        let Some(process) = process else {
            self.exhausted = true;
            return None;
        };
        if buf.is_empty() {
            return Some(0);
        }

        loop {
            match process.read(buf.len()) {
                ReadChunk::Bytes(bytes) if bytes.is_empty() => continue,
                ReadChunk::Bytes(bytes) => {
                    let n = buf.len().min(bytes.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.carry = bytes;
                        self.cursor = n;
                    }
                    return Some(n);
                }
                ReadChunk::WouldBlock => std::thread::sleep(WOULD_BLOCK_BACKOFF),
                ReadChunk::NoMoreOutput => {
                    self.exhausted = true;
                    return None;
                }
            }
        }
    }
}
