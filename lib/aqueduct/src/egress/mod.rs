//! The asynchronous egress loop: one dedicated thread per transport-module
//! instance that turns non-blocking socket writes and caller-supplied byte
//! sources into backpressure-aware transmission with bounded memory.
//! Workers talk to the loop exclusively through the message ring plus a
//! readiness event the loop selects on.

pub mod chain;
pub mod queue;
pub mod table;

pub use chain::{ChainNode, EgressChain};
pub use table::{SlotState, SlotTable};

use crate::module::DataSource;
use crate::pool::{Page, Pool};
use crate::support::{PipeError, PipeResult};
use bedrock::logging;
use mio::net::TcpStream;
use queue::MessageRing;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub type ConnectionId = u32;

/// Attaches a slot to a connection. `cleanup` receives the stream back
/// together with the slot's error flag once transmission finishes; it runs
/// after the slot index is invalidated, so it may register a fresh async
/// operation for the same connection.
pub struct CreateReq {
    pub conn: ConnectionId,
    pub stream: TcpStream,
    pub chain: Arc<Mutex<EgressChain>>,
    pub on_error: Box<dyn FnMut() + Send>,
    pub cleanup: Box<dyn FnOnce(TcpStream, bool) + Send>,
}

pub enum Message {
    Create(Box<CreateReq>),
    Ready(ConnectionId),
    End(ConnectionId),
    Kill,
}

#[derive(Clone)]
pub struct AsyncConfig {
    /// Slot-table capacity; connection ids must stay below it.
    pub capacity: usize,
    /// How long a slot may sit in wait-conn before it is force-errored.
    pub ttl: Duration,
    /// Upper bound on one poll sleep.
    pub min_timeout: Duration,
}

impl Default for AsyncConfig {
    fn default() -> AsyncConfig {
        AsyncConfig {
            capacity: 512,
            ttl: Duration::from_secs(30),
            min_timeout: Duration::from_millis(500),
        }
    }
}

/// The producer-side endpoint of an egress loop.
#[derive(Clone)]
pub struct AsyncHandle {
    ring: Arc<MessageRing>,
    wake: mio::SetReadiness,
    posted: Arc<Vec<AtomicBool>>,
    ended: Arc<Vec<AtomicBool>>,
}

impl AsyncHandle {
    /// Attaches a slot to a connection.
    pub fn register(&self, request: CreateReq) -> PipeResult<()> {
        let conn = request.conn as usize;
        if conn >= self.posted.len() {
            return Err(PipeError::InvalidArgument);
        }

        self.posted[conn].store(false, Ordering::Release);
        self.ended[conn].store(false, Ordering::Release);

        self.ring.put(Message::Create(Box::new(request)))?;
        self.wake()
    }

    /// Signals that the caller produced bytes or opened a source. The
    /// per-slot posted bit deduplicates, keeping the ring bounded no
    /// matter how often producers fire.
    pub fn data_ready(&self, conn: ConnectionId) -> PipeResult<()> {
        let index = conn as usize;
        if index >= self.posted.len() {
            return Err(PipeError::InvalidArgument);
        }

        // Ready after end is a programming error, refused at the sender
        if self.ended[index].load(Ordering::Acquire) {
            return Err(PipeError::InvalidArgument);
        }

        if self.posted[index].swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.ring.put(Message::Ready(conn))?;
        self.wake()
    }

    /// Signals that no more data will arrive from the caller.
    pub fn data_end(&self, conn: ConnectionId) -> PipeResult<()> {
        let index = conn as usize;
        if index >= self.ended.len() {
            return Err(PipeError::InvalidArgument);
        }

        if self.ended[index].swap(true, Ordering::AcqRel) {
            return Err(PipeError::InvalidArgument);
        }

        self.ring.put(Message::End(conn))?;
        self.wake()
    }

    /// Shuts the loop down. Live slots are errored out and disposed.
    pub fn kill(&self) -> PipeResult<()> {
        self.ring.put(Message::Kill)?;
        self.wake()
    }

    fn wake(&self) -> PipeResult<()> {
        self.wake
            .set_readiness(mio::Ready::readable())
            .map_err(PipeError::from)
    }
}

struct Slot {
    stream: TcpStream,
    chain: Arc<Mutex<EgressChain>>,
    stage: Option<Page>,
    on_error: Box<dyn FnMut() + Send>,
    cleanup: Option<Box<dyn FnOnce(TcpStream, bool) + Send>>,
    ended: bool,
    error: bool,
    raised: bool,
    registered: bool,
}

struct AsyncLoop {
    config: AsyncConfig,
    table: SlotTable<Slot>,
    poll: mio::Poll,
    events: mio::Events,
    ring: Arc<MessageRing>,
    posted: Arc<Vec<AtomicBool>>,
    pages: Arc<Pool<Page>>,
    killed: bool,
    log: logging::Logger,
}

/// Starts an egress loop on its own thread.
pub fn spawn<'a, L: Into<Option<&'a logging::Logger>>>(
    config: AsyncConfig,
    pages: Arc<Pool<Page>>,
    log: L,
) -> PipeResult<(AsyncHandle, thread::JoinHandle<()>)> {
    let loop_log = match log.into() {
        Some(log) => log.new(logging::o!()),
        _ => logging::Logger::root(logging::Discard, logging::o!()),
    };

    let poll = mio::Poll::new()?;
    let (registration, wake) = mio::Registration::new2();
    poll.register(
        &registration,
        mio::Token(config.capacity),
        mio::Ready::readable(),
        mio::PollOpt::edge(),
    )?;

    let ring = Arc::new(MessageRing::new(config.capacity * 4 + 16));
    let posted: Arc<Vec<AtomicBool>> = Arc::new((0..config.capacity).map(|_| AtomicBool::new(false)).collect());
    let ended: Arc<Vec<AtomicBool>> = Arc::new((0..config.capacity).map(|_| AtomicBool::new(false)).collect());

    let handle = AsyncHandle {
        ring: ring.clone(),
        wake,
        posted: posted.clone(),
        ended,
    };

    let mut event_loop = AsyncLoop {
        table: SlotTable::new(config.capacity),
        poll,
        events: mio::Events::with_capacity(config.capacity.max(64)),
        ring,
        posted,
        pages,
        killed: false,
        log: loop_log,
        config,
    };

    let thread = thread::Builder::new()
        .name("egress-loop".into())
        .spawn(move || {
            // The registration must stay alive as long as the loop polls it
            let _registration = registration;
            event_loop.run();
        })
        .map_err(PipeError::from)?;

    Ok((handle, thread))
}

impl AsyncLoop {
    fn run(&mut self) {
        logging::debug!(self.log, "egress loop started"; "context" => "run");

        while !self.killed {
            self.consume_messages();
            self.process_ready();
            self.process_raising();
            self.process_finished();
            self.evict_stalled();

            if self.killed {
                break;
            }

            let timeout = self.poll_timeout();
            self.poll
                .poll(&mut self.events, Some(timeout))
                .expect("Egress poll failed");

            let mut woken = Vec::new();
            for event in &self.events {
                if event.token().0 < self.config.capacity {
                    woken.push(event.token().0 as ConnectionId);
                }
            }

            let now = Instant::now();
            for conn in woken {
                if self.table.state_of(conn) == Some(SlotState::WaitConn) {
                    self.deregister(conn);
                    let _ = self.table.set_state(conn, SlotState::Ready, now);
                }
            }
        }

        self.teardown();
        logging::debug!(self.log, "egress loop finished"; "context" => "run");
    }

    fn poll_timeout(&self) -> Duration {
        let mut timeout = self.config.min_timeout;

        if let Some((_, since)) = self.table.heap_root() {
            let age = since.elapsed();
            let remaining = self.config.ttl.checked_sub(age).unwrap_or_else(|| Duration::from_millis(0));
            timeout = timeout.min(remaining);
        }

        timeout
    }

    fn consume_messages(&mut self) {
        let now = Instant::now();

        while let Some(message) = self.ring.take() {
            match message {
                Message::Create(request) => self.attach(*request, now),
                Message::Ready(conn) => {
                    // Clear the dedup bit first so a producer posting while
                    // we drive the slot re-enqueues.
                    self.posted[conn as usize].store(false, Ordering::Release);

                    if self.table.state_of(conn) == Some(SlotState::WaitData) {
                        let _ = self.table.set_state(conn, SlotState::Ready, now);
                    }
                }
                Message::End(conn) => {
                    let state = self.table.state_of(conn);
                    if let Some(slot) = self.table.get_mut(conn) {
                        slot.ended = true;
                    }

                    match state {
                        Some(SlotState::WaitData) => {
                            let _ = self.table.set_state(conn, SlotState::Ready, now);
                        }
                        Some(SlotState::Error) => {
                            let _ = self.table.set_state(conn, SlotState::Finished, now);
                        }
                        _ => {}
                    }
                }
                Message::Kill => {
                    self.killed = true;
                }
            }
        }
    }

    fn attach(&mut self, request: CreateReq, now: Instant) {
        let conn = request.conn;

        let slot = Slot {
            stream: request.stream,
            chain: request.chain,
            stage: None,
            on_error: request.on_error,
            cleanup: Some(request.cleanup),
            ended: false,
            error: false,
            raised: false,
            registered: false,
        };

        if self.table.insert(conn, slot, SlotState::Ready, now).is_err() {
            logging::warn!(self.log, "slot create refused";
                           "context" => "attach",
                           "conn" => conn);
        }
    }

    fn process_ready(&mut self) {
        for conn in self.table.in_state(SlotState::Ready) {
            let next = self.drive(conn);
            let now = Instant::now();

            if next == SlotState::WaitConn {
                self.register(conn);
            }

            let _ = self.table.set_state(conn, next, now);
        }
    }

    /// Pushes one slot's pending bytes at the socket until it blocks, runs
    /// dry or fails. Returns the state the slot moves to.
    fn drive(&mut self, conn: ConnectionId) -> SlotState {
        let pages = self.pages.clone();

        loop {
            let slot = match self.table.get_mut(conn) {
                Some(slot) => slot,
                None => return SlotState::Raising,
            };

            let mut chain = slot.chain.lock().expect("Egress chain poisoned");
            let ended = slot.ended || chain.ended();

            match chain.front_mut() {
                None => {
                    if let Some(page) = slot.stage.take() {
                        chain.release_stage(page, &pages);
                    }
                    return if ended { SlotState::Finished } else { SlotState::WaitData };
                }
                Some(ChainNode::Page(page)) => {
                    if page.is_empty() {
                        if chain.len() == 1 && !ended {
                            // Lone drained page: recycled in place for the
                            // next inline burst
                            return SlotState::WaitData;
                        }
                        chain.pop_page(&pages);
                        continue;
                    }

                    match slot.stream.write(page.pending()) {
                        Ok(0) => {
                            slot.error = true;
                            return SlotState::Raising;
                        }
                        Ok(count) => {
                            page.consume(count);
                        }
                        Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                            return SlotState::WaitConn;
                        }
                        Err(ref error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(_) => {
                            slot.error = true;
                            return SlotState::Raising;
                        }
                    }
                }
                Some(ChainNode::Source(_)) => {
                    if slot.stage.is_none() {
                        slot.stage = match chain.checkout_stage(&pages) {
                            Some(page) => Some(page),
                            None => return SlotState::WaitData,
                        };
                    }

                    let stage = slot.stage.as_mut().expect("Stage page just set");

                    if stage.is_empty() {
                        let read_result = match chain.front_mut() {
                            Some(ChainNode::Source(source)) => source.read(stage.tail_slice()),
                            _ => unreachable!("Front chain node changed under the loop"),
                        };

                        match read_result {
                            Ok(0) => {
                                let eos = match chain.front_mut() {
                                    Some(ChainNode::Source(source)) => source.eos(),
                                    _ => unreachable!("Front chain node changed under the loop"),
                                };

                                if eos {
                                    chain.pop_source();
                                    continue;
                                }
                                return SlotState::WaitData;
                            }
                            Ok(count) => stage.advance_tail(count),
                            Err(_) => {
                                slot.error = true;
                                return SlotState::Raising;
                            }
                        }
                    }

                    match slot.stream.write(stage.pending()) {
                        Ok(0) => {
                            slot.error = true;
                            return SlotState::Raising;
                        }
                        Ok(count) => {
                            stage.consume(count);
                        }
                        Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                            return SlotState::WaitConn;
                        }
                        Err(ref error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(_) => {
                            slot.error = true;
                            return SlotState::Raising;
                        }
                    }
                }
            }
        }
    }

    fn process_raising(&mut self) {
        for conn in self.table.in_state(SlotState::Raising) {
            let now = Instant::now();

            let ended = {
                let slot = match self.table.get_mut(conn) {
                    Some(slot) => slot,
                    None => continue,
                };

                if !slot.raised {
                    slot.raised = true;
                    (slot.on_error)();
                }
                slot.ended
            };

            let next = if ended { SlotState::Finished } else { SlotState::Error };
            let _ = self.table.set_state(conn, next, now);
        }
    }

    fn process_finished(&mut self) {
        for conn in self.table.in_state(SlotState::Finished) {
            self.dispose(conn);
        }
    }

    fn evict_stalled(&mut self) {
        let now = Instant::now();

        while let Some((conn, since)) = self.table.heap_root() {
            if now.duration_since(since) < self.config.ttl {
                break;
            }

            logging::warn!(self.log, "slot exceeded wait-conn ttl";
                           "context" => "evict",
                           "conn" => conn);

            self.deregister(conn);
            if let Some(slot) = self.table.get_mut(conn) {
                slot.error = true;
            }
            let _ = self.table.set_state(conn, SlotState::Raising, now);
        }
    }

    fn dispose(&mut self, conn: ConnectionId) {
        self.deregister(conn);

        let mut slot = match self.table.remove(conn) {
            Some(slot) => slot,
            None => return,
        };

        {
            let mut chain = slot.chain.lock().expect("Egress chain poisoned");
            if let Some(page) = slot.stage.take() {
                chain.release_stage(page, &self.pages);
            }
            chain.clear(&self.pages);
        }

        self.posted[conn as usize].store(false, Ordering::Release);

        // Cleanup runs last: the slot index is free again, so the callback
        // may re-register a new async op on the same connection.
        if let Some(cleanup) = slot.cleanup.take() {
            cleanup(slot.stream, slot.error);
        }
    }

    fn register(&mut self, conn: ConnectionId) {
        let capacity = self.config.capacity;
        let poll = &self.poll;

        if let Some(slot) = self.table.get_mut(conn) {
            if !slot.registered && (conn as usize) < capacity {
                if poll
                    .register(
                        &slot.stream,
                        mio::Token(conn as usize),
                        mio::Ready::writable(),
                        mio::PollOpt::edge(),
                    )
                    .is_ok()
                {
                    slot.registered = true;
                }
            }
        }
    }

    fn deregister(&mut self, conn: ConnectionId) {
        let poll = &self.poll;

        if let Some(slot) = self.table.get_mut(conn) {
            if slot.registered {
                let _ = poll.deregister(&slot.stream);
                slot.registered = false;
            }
        }
    }

    /// Kill path: every live slot is errored out, then disposed.
    fn teardown(&mut self) {
        let conns: Vec<ConnectionId> = (0..self.config.capacity as ConnectionId)
            .filter(|&conn| self.table.contains(conn))
            .collect();

        for conn in conns {
            if let Some(slot) = self.table.get_mut(conn) {
                slot.error = true;
                if !slot.raised {
                    slot.raised = true;
                    (slot.on_error)();
                }
            }
            self.dispose(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::DataSource;
    use crate::pool::PAGE_SIZE;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    struct VecSource {
        data: Vec<u8>,
        cursor: usize,
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

        fn close(&mut self) {}
    }

    fn test_config(ttl_millis: u64) -> AsyncConfig {
        AsyncConfig {
            capacity: 8,
            ttl: Duration::from_millis(ttl_millis),
            min_timeout: Duration::from_millis(20),
        }
    }

    fn connected_pair(listener: &TcpListener) -> (TcpStream, StdTcpStream) {
        let addr = listener.local_addr().unwrap();
        let local = TcpStream::connect(&addr).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (local, peer)
    }

    fn create_request(
        conn: ConnectionId,
        stream: TcpStream,
        chain: Arc<Mutex<EgressChain>>,
        errors: Arc<AtomicUsize>,
        done: mpsc::Sender<bool>,
    ) -> CreateReq {
        CreateReq {
            conn,
            stream,
            chain,
            on_error: Box::new(move || {
                errors.fetch_add(1, Ordering::SeqCst);
            }),
            cleanup: Box::new(move |_stream, error| {
                done.send(error).unwrap();
            }),
        }
    }

    #[test]
    fn test_inline_bytes_delivered_in_order() {
        let pages = Arc::new(Pool::new(16));
        let (handle, thread) = spawn(test_config(5000), pages.clone(), None).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (local, mut peer) = connected_pair(&listener);

        let chain = Arc::new(Mutex::new(EgressChain::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        handle
            .register(create_request(1, local, chain.clone(), errors.clone(), done_tx))
            .unwrap();

        chain.lock().unwrap().write_bytes(b"hello ", &pages);
        handle.data_ready(1).unwrap();
        chain.lock().unwrap().write_bytes(b"egress", &pages);
        handle.data_ready(1).unwrap();
        handle.data_end(1).unwrap();

        let error = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!error);
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"hello egress");

        handle.kill().unwrap();
        thread.join().unwrap();
        assert_eq!(pages.outstanding(), 0);
    }

    #[test]
    fn test_data_source_backpressure_and_order() {
        let pages = Arc::new(Pool::new(16));
        let (handle, thread) = spawn(test_config(30000), pages.clone(), None).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (local, mut peer) = connected_pair(&listener);

        let chain = Arc::new(Mutex::new(EgressChain::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        // Four pages of patterned data through a single source
        let payload: Vec<u8> = (0..4 * PAGE_SIZE).map(|index| (index % 251) as u8).collect();

        handle
            .register(create_request(2, local, chain.clone(), errors.clone(), done_tx))
            .unwrap();

        chain.lock().unwrap().push_source(Box::new(VecSource {
            data: payload.clone(),
            cursor: 0,
        }));
        handle.data_ready(2).unwrap();
        handle.data_end(2).unwrap();

        // The peer drains slowly; the slot never holds more than one page
        let mut received = Vec::new();
        let mut buffer = [0u8; 1024];
        loop {
            match peer.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => {
                    received.extend_from_slice(&buffer[..count]);
                    assert!(pages.outstanding() <= 2);
                    thread::sleep(Duration::from_millis(1));
                }
                Err(error) => panic!("Peer read failed: {:?}", error),
            }
        }

        assert_eq!(received, payload);
        assert!(!done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        handle.kill().unwrap();
        thread.join().unwrap();
        assert_eq!(pages.outstanding(), 0);
    }

    #[test]
    fn test_ttl_eviction_fires_error_once() {
        let pages = Arc::new(Pool::new(16));
        let (handle, thread) = spawn(test_config(200), pages.clone(), None).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (local, peer) = connected_pair(&listener);

        // Shrink the send buffer so a stalled peer blocks the writer fast
        local.set_send_buffer_size(4096).unwrap();

        let chain = Arc::new(Mutex::new(EgressChain::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        handle
            .register(create_request(3, local, chain.clone(), errors.clone(), done_tx))
            .unwrap();

        // Keep refilling the chain until the socket jams and the slot
        // lands in wait-conn; the peer never reads.
        let filler = vec![0xabu8; PAGE_SIZE];
        let mut source_data = Vec::new();
        for _ in 0..256 {
            source_data.extend_from_slice(&filler);
        }
        chain.lock().unwrap().push_source(Box::new(VecSource {
            data: source_data,
            cursor: 0,
        }));
        handle.data_ready(3).unwrap();
        handle.data_end(3).unwrap();

        // TTL is 200ms; the slot must be force-errored and disposed
        let error = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(error);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        drop(peer);
        handle.kill().unwrap();
        thread.join().unwrap();
        assert_eq!(pages.outstanding(), 0);
    }

    #[test]
    fn test_ready_after_end_refused() {
        let pages = Arc::new(Pool::new(16));
        let (handle, thread) = spawn(test_config(5000), pages.clone(), None).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (local, _peer) = connected_pair(&listener);

        let chain = Arc::new(Mutex::new(EgressChain::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        handle
            .register(create_request(4, local, chain, errors, done_tx))
            .unwrap();

        handle.data_end(4).unwrap();
        assert_eq!(handle.data_ready(4).unwrap_err(), PipeError::InvalidArgument);
        assert_eq!(handle.data_end(4).unwrap_err(), PipeError::InvalidArgument);

        let _ = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.kill().unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn test_ready_dedup_bit() {
        let pages = Arc::new(Pool::new(16));
        let (handle, thread) = spawn(test_config(5000), pages.clone(), None).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (local, mut peer) = connected_pair(&listener);

        let chain = Arc::new(Mutex::new(EgressChain::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        handle
            .register(create_request(5, local, chain.clone(), errors, done_tx))
            .unwrap();

        chain.lock().unwrap().write_bytes(b"dedup", &pages);

        // Posting far more often than the ring could hold must not error
        for _ in 0..10_000 {
            handle.data_ready(5).unwrap();
        }
        handle.data_end(5).unwrap();

        assert!(!done_rx.recv_timeout(Duration::from_secs(5)).unwrap());

        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"dedup");

        handle.kill().unwrap();
        thread.join().unwrap();
    }
}
