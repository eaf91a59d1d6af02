use crate::support::{PipeError, PipeResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// One OS page worth of staging space.
pub const PAGE_SIZE: usize = 4096;

/// Bounded object pool with a free-list. Checked-in objects are recycled on
/// the next checkout; the pool never hands out more than `capacity` objects
/// at a time.
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    outstanding: AtomicUsize,
    capacity: usize,
}

impl<T> Pool<T> {
    #[inline]
    pub fn new(capacity: usize) -> Pool<T> {
        Pool {
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Checks an object out of the pool, constructing a fresh one with the
    /// supplied closure when the free-list is empty.
    pub fn checkout<F: FnOnce() -> T>(&self, construct: F) -> PipeResult<T> {
        let recycled = self.free.lock().expect("Pool free-list poisoned").pop();

        match recycled {
            Some(item) => {
                self.outstanding.fetch_add(1, Ordering::Relaxed);
                Ok(item)
            }
            None => {
                if self.outstanding.load(Ordering::Relaxed) >= self.capacity {
                    return Err(PipeError::Exhausted);
                }

                self.outstanding.fetch_add(1, Ordering::Relaxed);
                Ok(construct())
            }
        }
    }

    /// Returns an object to the pool.
    pub fn checkin(&self, item: T) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().expect("Pool free-list poisoned").push(item);
    }

    /// The number of objects currently checked out.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

/// A fixed staging page with head/tail offsets. Data is appended at the
/// tail and drained from the head; the page is recycled in place once all
/// appended bytes have been drained.
pub struct Page {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Page {
    #[inline]
    pub fn new() -> Page {
        Page {
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// Bytes appended and not yet drained.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Free space remaining at the tail.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.tail
    }

    /// Appends as much of `bytes` as fits, returning the count appended.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.free_capacity());
        self.data[self.tail..self.tail + count].copy_from_slice(&bytes[..count]);
        self.tail += count;
        count
    }

    /// The pending data at the head.
    #[inline]
    pub fn pending(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Writable tail slice, committed with `advance_tail`.
    #[inline]
    pub fn tail_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.tail..]
    }

    #[inline]
    pub fn advance_tail(&mut self, count: usize) {
        self.tail += count;
    }

    /// Marks `count` head bytes as drained, resetting the offsets once the
    /// page runs empty so the space is reused without reallocation.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.head += count;
        if self.head == self.tail {
            self.reset();
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}
