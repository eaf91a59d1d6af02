//! The sequenced buffer chain shared between a connection's writers and
//! the egress loop. Each node is either the connection's one staging page
//! of inline bytes or a caller-supplied data source. The page budget is
//! one per connection: inline bytes and source staging draw on the same
//! allowance, which is what bounds a slot's memory to a single page plus
//! fixed per-node overhead.

use crate::module::DataSource;
use crate::pool::{Page, Pool};
use std::collections::VecDeque;

pub enum ChainNode {
    Page(Page),
    Source(Box<dyn DataSource>),
}

pub struct EgressChain {
    nodes: VecDeque<ChainNode>,
    /// True while the connection's one page allowance is out, either as a
    /// chain node or as the loop's source staging page.
    page_out: bool,
    ended: bool,
}

impl EgressChain {
    pub fn new() -> EgressChain {
        EgressChain {
            nodes: VecDeque::new(),
            page_out: false,
            ended: false,
        }
    }

    /// Appends inline bytes, returning how many were taken. Zero means the
    /// slot is backpressured: the page allowance is in use elsewhere, the
    /// tail page is full, or a source is queued and ordering forbids
    /// starting a fresh page behind it.
    pub fn write_bytes(&mut self, bytes: &[u8], pages: &Pool<Page>) -> usize {
        if self.ended {
            return 0;
        }

        match self.nodes.back_mut() {
            Some(ChainNode::Page(page)) => page.append(bytes),
            Some(ChainNode::Source(_)) => 0,
            None => {
                if self.page_out {
                    return 0;
                }

                let mut page = match pages.checkout(Page::new) {
                    Ok(page) => page,
                    Err(_) => return 0,
                };

                self.page_out = true;
                let taken = page.append(bytes);
                self.nodes.push_back(ChainNode::Page(page));
                taken
            }
        }
    }

    /// Queues a caller-owned byte source. Ordering relative to inline
    /// bytes already queued is preserved.
    pub fn push_source(&mut self, source: Box<dyn DataSource>) -> bool {
        if self.ended {
            return false;
        }

        self.nodes.push_back(ChainNode::Source(source));
        true
    }

    #[inline]
    pub fn set_end(&mut self) {
        self.ended = true;
    }

    #[inline]
    pub fn ended(&self) -> bool {
        self.ended
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn front_mut(&mut self) -> Option<&mut ChainNode> {
        self.nodes.front_mut()
    }

    /// Pops a drained front page, releasing the page allowance.
    pub fn pop_page(&mut self, pages: &Pool<Page>) {
        match self.nodes.pop_front() {
            Some(ChainNode::Page(page)) => {
                self.page_out = false;
                pages.checkin(page);
            }
            _ => panic!("Front chain node is not a page"),
        }
    }

    /// Pops an exhausted front source, running its close hook.
    pub fn pop_source(&mut self) {
        match self.nodes.pop_front() {
            Some(ChainNode::Source(mut source)) => source.close(),
            _ => panic!("Front chain node is not a source"),
        }
    }

    /// Checks out the slot's source staging page against the one-page
    /// allowance.
    pub fn checkout_stage(&mut self, pages: &Pool<Page>) -> Option<Page> {
        if self.page_out {
            return None;
        }

        match pages.checkout(Page::new) {
            Ok(page) => {
                self.page_out = true;
                Some(page)
            }
            Err(_) => None,
        }
    }

    /// Returns the staging page, releasing the allowance.
    pub fn release_stage(&mut self, page: Page, pages: &Pool<Page>) {
        self.page_out = false;
        pages.checkin(page);
    }

    /// Drops everything still queued: pages back to the pool, sources
    /// closed. Used when a slot is disposed.
    pub fn clear(&mut self, pages: &Pool<Page>) {
        while let Some(node) = self.nodes.pop_front() {
            match node {
                ChainNode::Page(page) => {
                    self.page_out = false;
                    pages.checkin(page);
                }
                ChainNode::Source(mut source) => source.close(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::PipeResult;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct VecSource {
        data: Vec<u8>,
        cursor: usize,
        closed: Arc<AtomicUsize>,
    }

    impl VecSource {
        fn boxed(data: &[u8], closed: Arc<AtomicUsize>) -> Box<VecSource> {
            Box::new(VecSource {
                data: data.to_vec(),
                cursor: 0,
                closed,
            })
        }
    }

    impl DataSource for VecSource {
        fn read(&mut self, buffer: &mut [u8]) -> PipeResult<usize> {
            let count = buffer.len().min(self.data.len() - self.cursor);
            buffer[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }

        fn eos(&self) -> bool {
            self.cursor == self.data.len()
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_inline_bytes_fill_tail_page() {
        let pages = Pool::new(4);
        let mut chain = EgressChain::new();

        assert_eq!(chain.write_bytes(b"abc", &pages), 3);
        assert_eq!(chain.write_bytes(b"def", &pages), 3);
        assert_eq!(chain.len(), 1);
        assert_eq!(pages.outstanding(), 1);

        match chain.front_mut().unwrap() {
            ChainNode::Page(page) => assert_eq!(page.pending(), b"abcdef"),
            _ => panic!("Expected a page"),
        }
    }

    #[test]
    fn test_one_page_budget() {
        let pages = Pool::new(4);
        let mut chain = EgressChain::new();

        let big = vec![7u8; crate::pool::PAGE_SIZE];
        assert_eq!(chain.write_bytes(&big, &pages), crate::pool::PAGE_SIZE);

        // The page is full and ordering admits no second page
        assert_eq!(chain.write_bytes(b"more", &pages), 0);
        assert_eq!(pages.outstanding(), 1);
    }

    #[test]
    fn test_no_inline_page_behind_source() {
        let pages = Pool::new(4);
        let closed = Arc::new(AtomicUsize::new(0));
        let mut chain = EgressChain::new();

        chain.push_source(VecSource::boxed(b"src", closed.clone()));
        assert_eq!(chain.write_bytes(b"inline", &pages), 0);

        // Once the source is consumed inline bytes flow again
        chain.pop_source();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(chain.write_bytes(b"inline", &pages), 6);
    }

    #[test]
    fn test_stage_draws_on_same_budget() {
        let pages = Pool::new(4);
        let closed = Arc::new(AtomicUsize::new(0));
        let mut chain = EgressChain::new();

        chain.push_source(VecSource::boxed(b"src", closed.clone()));

        let stage = chain.checkout_stage(&pages).unwrap();
        assert_eq!(pages.outstanding(), 1);

        // The allowance is out: no inline page, no second stage
        assert!(chain.checkout_stage(&pages).is_none());
        assert_eq!(chain.write_bytes(b"x", &pages), 0);

        chain.release_stage(stage, &pages);
        assert_eq!(pages.outstanding(), 0);
    }

    #[test]
    fn test_end_refuses_data() {
        let pages = Pool::new(4);
        let closed = Arc::new(AtomicUsize::new(0));
        let mut chain = EgressChain::new();

        chain.set_end();
        assert_eq!(chain.write_bytes(b"x", &pages), 0);
        assert!(!chain.push_source(VecSource::boxed(b"y", closed)));
    }

    #[test]
    fn test_clear_returns_pages_and_closes_sources() {
        let pages = Pool::new(4);
        let closed = Arc::new(AtomicUsize::new(0));
        let mut chain = EgressChain::new();

        chain.write_bytes(b"abc", &pages);
        chain.push_source(VecSource::boxed(b"src", closed.clone()));

        chain.clear(&pages);

        assert_eq!(chain.len(), 0);
        assert_eq!(pages.outstanding(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
