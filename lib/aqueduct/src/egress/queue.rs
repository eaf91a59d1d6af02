//! The worker-to-loop message ring. Enqueue is serialized by a mutex;
//! dequeue belongs to the single loop thread and never takes a lock, so a
//! burst of producers cannot stall the consumer.

use crate::egress::Message;
use crate::support::{PipeError, PipeResult};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct MessageRing {
    slots: Box<[UnsafeCell<Option<Message>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    producer: Mutex<()>,
}

// The cells are written only by the producer holding the mutex and read
// only by the single consumer, with the head/tail counters ordering the
// two sides.
unsafe impl Send for MessageRing {}
unsafe impl Sync for MessageRing {}

impl MessageRing {
    pub fn new(capacity: usize) -> MessageRing {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(UnsafeCell::new(None));
        }

        MessageRing {
            slots: slots.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            producer: Mutex::new(()),
        }
    }

    /// Enqueues a message. The ring is bounded: per-slot ready
    /// deduplication keeps well-behaved producers inside it, so a full
    /// ring is reported rather than waited on.
    pub fn put(&self, message: Message) -> PipeResult<()> {
        let _guard = self.producer.lock().expect("Message ring producer poisoned");

        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail - head == self.slots.len() {
            return Err(PipeError::Exhausted);
        }

        unsafe {
            *self.slots[tail % self.slots.len()].get() = Some(message);
        }

        self.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    /// Dequeues a message. Single consumer only.
    pub fn take(&self) -> Option<Message> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let message = unsafe { (*self.slots[head % self.slots.len()].get()).take() };

        self.head.store(head + 1, Ordering::Release);
        message
    }
}
