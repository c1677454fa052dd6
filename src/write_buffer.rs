//! An append-only chunked byte queue used as the nonblocking send backlog for one socket.
//!
//! Not thread-safe by construction: each [`crate::ancillary_socket::AncillaryDataSocket`] and
//! its buffer are only ever touched from the one thread that owns the socket (the main thread
//! for the main channel, a subchannel's worker thread for everything else), so no locking is
//! needed here.

use std::collections::VecDeque;

use crate::protocol::WRITE_BUFFER_BLOCK_LEN;

struct Block {
    data: Vec<u8>,
    consumed: usize,
}

impl Block {
    fn pending(&self) -> &[u8] {
        &self.data[self.consumed..]
    }
}

/// FIFO queue of pending output bytes, chunked into fixed-size blocks so that a slow reader on
/// the peer side doesn't force one contiguous reallocation per write.
#[derive(Default)]
pub struct WriteBuffer {
    blocks: VecDeque<Block>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` to the tail block, starting a new block once the current tail reaches
    /// [`WRITE_BUFFER_BLOCK_LEN`].
    pub fn enqueue(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let need_new_block = match self.blocks.back() {
                Some(b) => b.data.len() >= WRITE_BUFFER_BLOCK_LEN,
                None => true,
            };
            if need_new_block {
                self.blocks.push_back(Block {
                    data: Vec::with_capacity(WRITE_BUFFER_BLOCK_LEN),
                    consumed: 0,
                });
            }
            let tail = self.blocks.back_mut().expect("just pushed");
            let room = WRITE_BUFFER_BLOCK_LEN - tail.data.len();
            let take = room.min(bytes.len());
            tail.data.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
    }

    /// Returns the unconsumed, contiguous range of the head block, or an empty slice if the
    /// buffer is drained. Callers must follow up with [`Self::dequeue`] for exactly the number
    /// of bytes a writer confirmed sending.
    pub fn pending_data(&self) -> &[u8] {
        self.blocks.front().map(Block::pending).unwrap_or(&[])
    }

    /// Advances past `n` bytes, spanning as many head blocks as necessary, releasing any block
    /// fully consumed in the process.
    pub fn dequeue(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.blocks.front_mut() else {
                break;
            };
            let remaining = front.data.len() - front.consumed;
            let take = remaining.min(n);
            front.consumed += take;
            n -= take;
            if front.consumed == front.data.len() {
                self.blocks.pop_front();
            }
        }
    }

    pub fn has_pending_data(&self) -> bool {
        !self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue_roundtrip() {
        let mut buf = WriteBuffer::new();
        assert!(!buf.has_pending_data());
        buf.enqueue(b"hello ");
        buf.enqueue(b"world");
        assert!(buf.has_pending_data());
        let mut collected = Vec::new();
        while buf.has_pending_data() {
            let chunk = buf.pending_data().to_vec();
            buf.dequeue(chunk.len());
            collected.extend(chunk);
        }
        assert_eq!(collected, b"hello world");
        assert!(!buf.has_pending_data());
    }

    #[test]
    fn spans_multiple_blocks() {
        let mut buf = WriteBuffer::new();
        let big = vec![0xABu8; WRITE_BUFFER_BLOCK_LEN * 3 + 17];
        buf.enqueue(&big);
        let mut total = 0;
        while buf.has_pending_data() {
            let n = buf.pending_data().len();
            buf.dequeue(n);
            total += n;
        }
        assert_eq!(total, big.len());
    }

    #[test]
    fn partial_dequeue_keeps_remainder() {
        let mut buf = WriteBuffer::new();
        buf.enqueue(b"0123456789");
        buf.dequeue(3);
        assert_eq!(buf.pending_data(), b"3456789");
    }
}
