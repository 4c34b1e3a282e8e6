//! Bounded send and receive queues with watermark events.
//!
//! Both queues measure their size in bytes and carry a pair of one-shot
//! watermark latches: after the size exceeds the high watermark, exactly one
//! high-watermark event may be authorized until the size has dropped back to
//! or below the low watermark, and vice versa. The queues are generic over
//! the stored callback type so the engine can supply its own completion
//! signatures.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};

use crate::endpoint::Endpoint;
use crate::timer::Timer;
use crate::transport::Token;

/// Snapshot of a queue's size and watermarks, attached to watermark events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueContext {
    /// Current queue size in bytes.
    pub size: usize,
    /// Low watermark in bytes.
    pub low_watermark: usize,
    /// High watermark in bytes.
    pub high_watermark: usize,
}

/// One pending send.
///
/// An entry with no payload is the shutdown marker enqueued by a graceful
/// shutdown; popping it transitions the socket instead of writing.
pub struct WriteQueueEntry<C> {
    /// Monotonically increasing identifier within the owning queue.
    pub id: u64,
    /// Caller-supplied cancellation token.
    pub token: Option<Token>,
    /// Destination, when the socket has no default remote endpoint.
    pub endpoint: Option<Endpoint>,
    /// The payload; `None` marks a graceful shutdown.
    pub data: Option<Bytes>,
    /// Payload length in bytes.
    pub length: usize,
    /// When the entry was enqueued.
    pub timestamp: Instant,
    /// Deadline after which the entry is failed with would-block.
    pub deadline: Option<Instant>,
    /// The timer enforcing the deadline.
    pub timer: Option<Timer>,
    /// Completion callback, invoked exactly once.
    pub callback: Option<C>,
}

impl<C> WriteQueueEntry<C> {
    /// Whether this entry is the graceful-shutdown marker.
    #[inline]
    #[must_use]
    pub const fn is_marker(&self) -> bool {
        self.data.is_none()
    }
}

impl<C> std::fmt::Debug for WriteQueueEntry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueueEntry")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("length", &self.length)
            .field("marker", &self.is_marker())
            .finish()
    }
}

#[derive(Debug)]
struct WatermarkLatches {
    low_armed: bool,
    high_armed: bool,
}

impl WatermarkLatches {
    const fn new() -> Self {
        // The queue starts empty: the low mark is trivially satisfied, so
        // only the high latch is armed.
        Self {
            low_armed: false,
            high_armed: true,
        }
    }
}

/// FIFO of pending sends.
pub struct WriteQueue<C> {
    entries: VecDeque<WriteQueueEntry<C>>,
    size: usize,
    next_id: u64,
    low_watermark: usize,
    high_watermark: usize,
    latches: WatermarkLatches,
}

impl<C> WriteQueue<C> {
    #[must_use]
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            next_id: 1,
            low_watermark,
            high_watermark,
            latches: WatermarkLatches::new(),
        }
    }

    /// Allocate the next entry identifier.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn set_low_watermark(&mut self, bytes: usize) {
        self.low_watermark = bytes;
    }

    pub fn set_high_watermark(&mut self, bytes: usize) {
        self.high_watermark = bytes;
    }

    /// Snapshot for watermark events.
    #[must_use]
    pub const fn context(&self) -> QueueContext {
        QueueContext {
            size: self.size,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }

    /// Whether the queue size exceeds the effective high watermark.
    ///
    /// A per-request `override_high` substitutes the configured mark for
    /// this one check.
    #[must_use]
    pub fn high_watermark_violated(&self, override_high: Option<usize>) -> bool {
        self.size > override_high.unwrap_or(self.high_watermark)
    }

    /// Append an entry. Returns true when the queue was empty before.
    pub fn push(&mut self, entry: WriteQueueEntry<C>) -> bool {
        let was_empty = self.entries.is_empty();
        self.size += entry.length;
        self.entries.push_back(entry);
        was_empty
    }

    #[must_use]
    pub fn front(&self) -> Option<&WriteQueueEntry<C>> {
        self.entries.front()
    }

    /// Remove and return the head entry.
    pub fn pop_front(&mut self) -> Option<WriteQueueEntry<C>> {
        let entry = self.entries.pop_front()?;
        self.size -= entry.length;
        Some(entry)
    }

    /// Cancel the pending entry with `id`.
    ///
    /// Returns the removed entry and whether the queue is now empty.
    pub fn remove_by_id(&mut self, id: u64) -> Option<(WriteQueueEntry<C>, bool)> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(index)?;
        self.size -= entry.length;
        Some((entry, self.entries.is_empty()))
    }

    /// Cancel the pending entry with `token`.
    ///
    /// Returns the removed entry and whether the queue is now empty.
    pub fn remove_by_token(&mut self, token: Token) -> Option<(WriteQueueEntry<C>, bool)> {
        let index = self.entries.iter().position(|e| e.token == Some(token))?;
        let entry = self.entries.remove(index)?;
        self.size -= entry.length;
        Some((entry, self.entries.is_empty()))
    }

    /// Remove every entry, for shutdown and release paths.
    pub fn drain(&mut self) -> Vec<WriteQueueEntry<C>> {
        self.size = 0;
        self.entries.drain(..).collect()
    }

    /// Authorize one high-watermark announcement.
    ///
    /// Returns true at most once per crossing: the latch re-arms only after
    /// a low-watermark announcement was authorized.
    pub fn authorize_high_watermark_event(&mut self, override_high: Option<usize>) -> bool {
        if self.latches.high_armed && self.high_watermark_violated(override_high) {
            self.latches.high_armed = false;
            self.latches.low_armed = true;
            true
        } else {
            false
        }
    }

    /// Authorize one low-watermark announcement.
    ///
    /// Returns true at most once per crossing, and only after the high mark
    /// was previously exceeded.
    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if self.latches.low_armed && self.size <= self.low_watermark {
            self.latches.low_armed = false;
            self.latches.high_armed = true;
            true
        } else {
            false
        }
    }
}

impl<C> std::fmt::Debug for WriteQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("entries", &self.entries.len())
            .field("size", &self.size)
            .field("low_watermark", &self.low_watermark)
            .field("high_watermark", &self.high_watermark)
            .finish()
    }
}

/// One buffered inbound message or stream segment.
#[derive(Debug, Clone)]
pub struct ReadQueueEntry {
    /// When the data arrived from the dispatcher.
    pub timestamp: Instant,
    /// Source endpoint, for unconnected datagram sockets.
    pub endpoint: Option<Endpoint>,
    /// The payload.
    pub data: Bytes,
    /// Payload length in bytes.
    pub length: usize,
}

/// One pending receive request.
pub struct ReceiveCallbackEntry<C> {
    /// Caller-supplied cancellation token.
    pub token: Option<Token>,
    /// Deadline after which the request completes with would-block.
    pub deadline: Option<Instant>,
    /// The timer enforcing the deadline.
    pub timer: Option<Timer>,
    /// Minimum bytes before a stream receive completes.
    pub min_size: usize,
    /// Maximum bytes delivered to a stream receive.
    pub max_size: usize,
    /// Completion callback, invoked exactly once.
    pub callback: C,
}

impl<C> std::fmt::Debug for ReceiveCallbackEntry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveCallbackEntry")
            .field("token", &self.token)
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// FIFO of buffered inbound data plus a FIFO of pending receive requests.
///
/// The engine matches the two FIFOs head to head: data is never delivered
/// out of arrival order and requests are never completed out of request
/// order.
pub struct ReadQueue<C> {
    entries: VecDeque<ReadQueueEntry>,
    size: usize,
    callbacks: VecDeque<ReceiveCallbackEntry<C>>,
    low_watermark: usize,
    high_watermark: usize,
    latches: WatermarkLatches,
}

impl<C> ReadQueue<C> {
    #[must_use]
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            callbacks: VecDeque::new(),
            low_watermark,
            high_watermark,
            latches: WatermarkLatches::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn has_entries(&self) -> bool {
        !self.entries.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn has_callbacks(&self) -> bool {
        !self.callbacks.is_empty()
    }

    pub fn set_low_watermark(&mut self, bytes: usize) {
        self.low_watermark = bytes;
    }

    pub fn set_high_watermark(&mut self, bytes: usize) {
        self.high_watermark = bytes;
    }

    /// Snapshot for watermark events.
    #[must_use]
    pub const fn context(&self) -> QueueContext {
        QueueContext {
            size: self.size,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }

    /// Whether the queue size exceeds the high watermark.
    #[must_use]
    pub const fn high_watermark_violated(&self) -> bool {
        self.size > self.high_watermark
    }

    /// Append arrived data. Returns true when the queue was empty before.
    pub fn push_entry(&mut self, entry: ReadQueueEntry) -> bool {
        let was_empty = self.entries.is_empty();
        self.size += entry.length;
        self.entries.push_back(entry);
        was_empty
    }

    /// Remove and return the oldest buffered message.
    pub fn pop_entry(&mut self) -> Option<ReadQueueEntry> {
        let entry = self.entries.pop_front()?;
        self.size -= entry.length;
        Some(entry)
    }

    /// Take a byte prefix for a stream receive.
    ///
    /// Returns `None` when fewer than `min` bytes are buffered; otherwise a
    /// prefix of length `min(size, max)` together with the source endpoint
    /// of its first segment. Single-segment prefixes are zero-copy.
    pub fn pop_bytes(&mut self, min: usize, max: usize) -> Option<(Bytes, Option<Endpoint>)> {
        if self.size < min || self.entries.is_empty() || max == 0 {
            return None;
        }

        let n = self.size.min(max);
        let endpoint = self.entries.front().and_then(|e| e.endpoint.clone());

        let front = self.entries.front_mut().expect("checked non-empty");
        if front.data.len() >= n {
            let out = front.data.split_to(n);
            front.length -= n;
            self.size -= n;
            if front.data.is_empty() {
                self.entries.pop_front();
            }
            return Some((out, endpoint));
        }

        // The prefix crosses entry boundaries; assemble it contiguously.
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let mut entry = self.entries.pop_front().expect("size accounts for segments");
            let take = remaining.min(entry.data.len());
            out.extend_from_slice(&entry.data[..take]);
            remaining -= take;
            self.size -= take;
            if take < entry.data.len() {
                entry.data.advance(take);
                entry.length -= take;
                self.entries.push_front(entry);
                break;
            }
        }

        Some((out.freeze(), endpoint))
    }

    /// Drop all buffered data, for the shutdown path.
    pub fn discard_entries(&mut self) -> usize {
        let discarded = self.size;
        self.entries.clear();
        self.size = 0;
        discarded
    }

    /// Append a pending receive request.
    pub fn push_callback(&mut self, entry: ReceiveCallbackEntry<C>) {
        self.callbacks.push_back(entry);
    }

    /// Remove and return the oldest pending receive request.
    pub fn pop_callback(&mut self) -> Option<ReceiveCallbackEntry<C>> {
        self.callbacks.pop_front()
    }

    /// Peek the oldest pending receive request.
    #[must_use]
    pub fn front_callback(&self) -> Option<&ReceiveCallbackEntry<C>> {
        self.callbacks.front()
    }

    /// Cancel the pending receive request with `token`.
    ///
    /// Returns the removed request and whether the callback queue is now
    /// empty.
    pub fn remove_callback(&mut self, token: Token) -> Option<(ReceiveCallbackEntry<C>, bool)> {
        let index = self
            .callbacks
            .iter()
            .position(|e| e.token == Some(token))?;
        let entry = self.callbacks.remove(index)?;
        Some((entry, self.callbacks.is_empty()))
    }

    /// Cancel the pending receive request whose deadline timer is
    /// `timer_id`; the deadline path uses this to find the request it was
    /// armed for.
    pub fn remove_callback_by_timer(
        &mut self,
        timer_id: u64,
    ) -> Option<(ReceiveCallbackEntry<C>, bool)> {
        let index = self
            .callbacks
            .iter()
            .position(|e| e.timer.as_ref().is_some_and(|t| t.id() == timer_id))?;
        let entry = self.callbacks.remove(index)?;
        Some((entry, self.callbacks.is_empty()))
    }

    /// Remove every pending receive request, for the shutdown path.
    pub fn pop_all_callbacks(&mut self) -> Vec<ReceiveCallbackEntry<C>> {
        self.callbacks.drain(..).collect()
    }

    /// Authorize one high-watermark announcement. One-shot per crossing.
    pub fn authorize_high_watermark_event(&mut self) -> bool {
        if self.latches.high_armed && self.high_watermark_violated() {
            self.latches.high_armed = false;
            self.latches.low_armed = true;
            true
        } else {
            false
        }
    }

    /// Authorize one low-watermark announcement. One-shot per crossing.
    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if self.latches.low_armed && self.size <= self.low_watermark {
            self.latches.low_armed = false;
            self.latches.high_armed = true;
            true
        } else {
            false
        }
    }
}

impl<C> std::fmt::Debug for ReadQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadQueue")
            .field("entries", &self.entries.len())
            .field("size", &self.size)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestCallback = Box<dyn FnOnce() + Send>;

    fn entry(queue: &mut WriteQueue<TestCallback>, len: usize) -> WriteQueueEntry<TestCallback> {
        WriteQueueEntry {
            id: queue.next_id(),
            token: None,
            endpoint: None,
            data: Some(Bytes::from(vec![0u8; len])),
            length: len,
            timestamp: Instant::now(),
            deadline: None,
            timer: None,
            callback: None,
        }
    }

    #[test]
    fn test_write_queue_push_pop() {
        let mut queue: WriteQueue<TestCallback> = WriteQueue::new(0, 1024);
        let e = entry(&mut queue, 100);
        assert!(queue.push(e));
        assert_eq!(queue.size(), 100);

        let e = entry(&mut queue, 50);
        assert!(!queue.push(e));
        assert_eq!(queue.size(), 150);

        let popped = queue.pop_front().unwrap();
        assert_eq!(popped.length, 100);
        assert_eq!(queue.size(), 50);
    }

    #[test]
    fn test_write_queue_remove_by_token() {
        let mut queue: WriteQueue<TestCallback> = WriteQueue::new(0, 1024);
        let mut e = entry(&mut queue, 10);
        e.token = Some(Token(7));
        queue.push(e);
        let e2 = entry(&mut queue, 20);
        queue.push(e2);

        let (removed, now_empty) = queue.remove_by_token(Token(7)).unwrap();
        assert_eq!(removed.length, 10);
        assert!(!now_empty);
        assert_eq!(queue.size(), 20);

        assert!(queue.remove_by_token(Token(7)).is_none());
    }

    #[test]
    fn test_write_queue_high_watermark_one_shot() {
        let mut queue: WriteQueue<TestCallback> = WriteQueue::new(16, 64);

        let e = entry(&mut queue, 100);
        queue.push(e);
        assert!(queue.high_watermark_violated(None));

        // Exactly one announcement per crossing.
        assert!(queue.authorize_high_watermark_event(None));
        assert!(!queue.authorize_high_watermark_event(None));

        // Draining to the low mark authorizes exactly one low event and
        // re-arms the high latch.
        queue.pop_front();
        assert!(queue.authorize_low_watermark_event());
        assert!(!queue.authorize_low_watermark_event());

        let e = entry(&mut queue, 100);
        queue.push(e);
        assert!(queue.authorize_high_watermark_event(None));
    }

    #[test]
    fn test_write_queue_override_high_watermark() {
        let mut queue: WriteQueue<TestCallback> = WriteQueue::new(0, 1024);
        let e = entry(&mut queue, 100);
        queue.push(e);

        assert!(!queue.high_watermark_violated(None));
        assert!(queue.high_watermark_violated(Some(50)));
    }

    #[test]
    fn test_write_queue_marker() {
        let mut queue: WriteQueue<TestCallback> = WriteQueue::new(0, 1024);
        let id = queue.next_id();
        queue.push(WriteQueueEntry {
            id,
            token: None,
            endpoint: None,
            data: None,
            length: 0,
            timestamp: Instant::now(),
            deadline: None,
            timer: None,
            callback: None,
        });
        assert!(queue.front().unwrap().is_marker());
        assert_eq!(queue.size(), 0);
    }

    fn read_entry(len: usize) -> ReadQueueEntry {
        ReadQueueEntry {
            timestamp: Instant::now(),
            endpoint: Some(Endpoint::loopback_v4(49152)),
            data: Bytes::from(vec![b'x'; len]),
            length: len,
        }
    }

    #[test]
    fn test_read_queue_fifo_match() {
        let mut queue: ReadQueue<TestCallback> = ReadQueue::new(0, 1024);
        queue.push_entry(read_entry(3));
        queue.push_entry(read_entry(5));

        assert_eq!(queue.pop_entry().unwrap().length, 3);
        assert_eq!(queue.pop_entry().unwrap().length, 5);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_read_queue_pop_bytes_min_max() {
        let mut queue: ReadQueue<TestCallback> = ReadQueue::new(0, 1024);
        queue.push_entry(read_entry(4));
        queue.push_entry(read_entry(4));

        // Minimum not yet satisfied.
        assert!(queue.pop_bytes(16, 64).is_none());

        // Any prefix once the minimum is available, capped by max.
        let (data, endpoint) = queue.pop_bytes(1, 6).unwrap();
        assert_eq!(data.len(), 6);
        assert!(endpoint.is_some());
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_read_queue_callbacks() {
        let mut queue: ReadQueue<TestCallback> = ReadQueue::new(0, 1024);
        queue.push_callback(ReceiveCallbackEntry {
            token: Some(Token(1)),
            deadline: None,
            timer: None,
            min_size: 1,
            max_size: usize::MAX,
            callback: Box::new(|| {}),
        });
        queue.push_callback(ReceiveCallbackEntry {
            token: Some(Token(2)),
            deadline: None,
            timer: None,
            min_size: 1,
            max_size: usize::MAX,
            callback: Box::new(|| {}),
        });

        let (removed, now_empty) = queue.remove_callback(Token(1)).unwrap();
        assert_eq!(removed.token, Some(Token(1)));
        assert!(!now_empty);

        assert_eq!(queue.pop_all_callbacks().len(), 1);
        assert!(!queue.has_callbacks());
    }

    #[test]
    fn test_read_queue_watermark_latching() {
        let mut queue: ReadQueue<TestCallback> = ReadQueue::new(2, 8);
        queue.push_entry(read_entry(10));

        assert!(queue.authorize_high_watermark_event());
        assert!(!queue.authorize_high_watermark_event());

        queue.discard_entries();
        assert!(queue.authorize_low_watermark_event());
        assert!(!queue.authorize_low_watermark_event());
    }
}
