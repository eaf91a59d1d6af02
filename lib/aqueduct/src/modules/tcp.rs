//! The TCP transport module: a non-blocking listener whose accepted
//! connections become request pipe pairs, a wait pool that parks
//! persistent connections (pushed state preserved) until their next
//! request, and an egress loop instance for asynchronous writes.

use crate::egress::{self, AsyncConfig, AsyncHandle, CreateReq, EgressChain};
use crate::module::{
    DataSource, HandleData, Module, ModuleFlags, PairParam, PipeFlags, PropertyValue,
};
use crate::pipe::state::PushedState;
use crate::pool::{Page, Pool};
use crate::support::{PipeError, PipeResult};
use bedrock::logging;
use mio::net::{TcpListener, TcpStream};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const LISTENER_TOKEN: usize = 0;
const ACCEPT_POLL_MILLIS: u64 = 50;

struct Props {
    ttl_secs: i64,
    event_size: i64,
    async_write: bool,
    sync_write_attempt: bool,
    persist: bool,
}

impl Default for Props {
    fn default() -> Props {
        Props {
            ttl_secs: 30,
            event_size: 4096,
            async_write: false,
            sync_write_attempt: true,
            persist: false,
        }
    }
}

/// A connection waiting in the pool for its next request.
struct ParkedConn {
    stream: TcpStream,
    states: Vec<PushedState>,
    unread: VecDeque<u8>,
}

struct ConnTable {
    parked: Vec<Option<ParkedConn>>,
    free_ids: Vec<usize>,
    next_id: usize,
    capacity: usize,
}

impl ConnTable {
    fn allocate_id(&mut self) -> Option<usize> {
        if let Some(id) = self.free_ids.pop() {
            return Some(id);
        }

        if self.next_id >= self.capacity {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.parked.push(None);
        Some(id)
    }

    fn release_id(&mut self, id: usize) {
        self.free_ids.push(id);
    }
}

/// One live connection shared by its sibling handles and the release
/// paths. The release runs exactly once, by whichever of the pipe purge
/// and the egress cleanup finishes second.
struct TcpConn {
    id: usize,
    stream: Mutex<Option<TcpStream>>,
    unread: Mutex<VecDeque<u8>>,
    states: Mutex<Vec<PushedState>>,
    chain: Arc<Mutex<EgressChain>>,
    has_more: AtomicBool,
    async_active: AtomicBool,
    egress_done: AtomicBool,
    purge_done: AtomicBool,
    park_ok: AtomicBool,
    error: AtomicBool,
}

enum HandleMode {
    Stream,
    /// Shadow fork: replays a snapshot of the buffered request bytes.
    Snapshot(VecDeque<u8>),
}

struct TcpHandle {
    core: Arc<TcpCore>,
    conn: Arc<TcpConn>,
    mode: HandleMode,
    input: bool,
    async_requested: bool,
}

struct AcceptState {
    listener: TcpListener,
    events: mio::Events,
}

struct TcpCore {
    actual_port: u16,
    poll: Arc<mio::Poll>,
    accept: Mutex<AcceptState>,
    conns: Mutex<ConnTable>,
    props: Mutex<Props>,
    async_handle: AsyncHandle,
    async_thread: Mutex<Option<thread::JoinHandle<()>>>,
    pages: Arc<Pool<Page>>,
    log: logging::Logger,
}

pub struct TcpModule {
    port: u16,
    capacity: usize,
    pages: Arc<Pool<Page>>,
    core: Option<Arc<TcpCore>>,
}

impl TcpModule {
    pub fn boxed(port: u16, capacity: usize, pages: Arc<Pool<Page>>) -> Box<TcpModule> {
        Box::new(TcpModule {
            port,
            capacity,
            pages,
            core: None,
        })
    }

    fn core(&self) -> PipeResult<&Arc<TcpCore>> {
        self.core.as_ref().ok_or(PipeError::InvalidArgument)
    }

    fn handle<'a>(data: &'a mut HandleData) -> PipeResult<&'a mut TcpHandle> {
        data.downcast_mut::<TcpHandle>().ok_or(PipeError::InvalidArgument)
    }
}

impl TcpCore {
    /// Parks or drops the connection once both the pipe purge and any
    /// in-flight egress are finished.
    fn maybe_release(&self, conn: &Arc<TcpConn>) {
        if !conn.purge_done.load(Ordering::Acquire) {
            return;
        }
        if conn.async_active.load(Ordering::Acquire) && !conn.egress_done.load(Ordering::Acquire) {
            return;
        }

        let stream = match conn.stream.lock().expect("Conn stream poisoned").take() {
            Some(stream) => stream,
            None => return,
        };

        let park = conn.park_ok.load(Ordering::Acquire)
            && !conn.error.load(Ordering::Acquire)
            && conn.has_more.load(Ordering::Acquire);

        let mut conns = self.conns.lock().expect("Conn table poisoned");

        if park {
            if self
                .poll
                .register(
                    &stream,
                    mio::Token(conn.id + 1),
                    mio::Ready::readable(),
                    mio::PollOpt::level(),
                )
                .is_ok()
            {
                logging::debug!(self.log, "connection parked";
                               "context" => "release",
                               "conn" => conn.id);

                conns.parked[conn.id] = Some(ParkedConn {
                    stream,
                    states: std::mem::take(&mut *conn.states.lock().expect("Conn states poisoned")),
                    unread: std::mem::take(&mut *conn.unread.lock().expect("Conn unread poisoned")),
                });
                return;
            }
        }

        logging::debug!(self.log, "connection closed";
                       "context" => "release",
                       "conn" => conn.id);

        drop(stream);
        conns.release_id(conn.id);
    }

    fn make_pair(
        core: &Arc<TcpCore>,
        id: usize,
        stream: TcpStream,
        states: Vec<PushedState>,
        unread: VecDeque<u8>,
        param: &PairParam,
    ) -> (HandleData, HandleData) {
        let conn = Arc::new(TcpConn {
            id,
            stream: Mutex::new(Some(stream)),
            unread: Mutex::new(unread),
            states: Mutex::new(states),
            chain: Arc::new(Mutex::new(EgressChain::new())),
            has_more: AtomicBool::new(true),
            async_active: AtomicBool::new(false),
            egress_done: AtomicBool::new(false),
            purge_done: AtomicBool::new(false),
            park_ok: AtomicBool::new(false),
            error: AtomicBool::new(false),
        });

        let input = TcpHandle {
            core: core.clone(),
            conn: conn.clone(),
            mode: HandleMode::Stream,
            input: true,
            async_requested: param.input_flags.contains(PipeFlags::ASYNC)
                || param.output_flags.contains(PipeFlags::ASYNC),
        };
        let output = TcpHandle {
            core: core.clone(),
            conn,
            mode: HandleMode::Stream,
            input: false,
            async_requested: input.async_requested,
        };

        (Box::new(input), Box::new(output))
    }

    fn async_enabled(&self, handle: &TcpHandle) -> bool {
        handle.async_requested || self.props.lock().expect("Props poisoned").async_write
    }

    /// Registers the connection with the egress loop on first use.
    fn ensure_slot(core: &Arc<TcpCore>, conn: &Arc<TcpConn>) -> PipeResult<()> {
        if conn.async_active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let stream = {
            let guard = conn.stream.lock().expect("Conn stream poisoned");
            match guard.as_ref() {
                Some(stream) => stream.try_clone()?,
                None => return Err(PipeError::InvalidArgument),
            }
        };

        let conn_for_error = conn.clone();
        let conn_for_cleanup = conn.clone();
        let core_for_cleanup = core.clone();

        core.async_handle.register(CreateReq {
            conn: conn.id as u32,
            stream,
            chain: conn.chain.clone(),
            on_error: Box::new(move || {
                conn_for_error.error.store(true, Ordering::Release);
            }),
            cleanup: Box::new(move |stream, error| {
                if error {
                    conn_for_cleanup.error.store(true, Ordering::Release);
                }
                drop(stream);
                conn_for_cleanup.egress_done.store(true, Ordering::Release);
                core_for_cleanup.maybe_release(&conn_for_cleanup);
            }),
        })
    }
}

impl Module for TcpModule {
    fn init(&mut self, argv: &[String], log: &logging::Logger) -> PipeResult<()> {
        if let Some(port) = argv.first() {
            self.port = port.parse::<u16>().map_err(|_| PipeError::InvalidArgument)?;
        }

        let addr: SocketAddr = format!("127.0.0.1:{}", self.port)
            .parse()
            .map_err(|_| PipeError::InvalidArgument)?;
        let listener = TcpListener::bind(&addr)?;
        let actual_port = listener.local_addr()?.port();

        let poll = Arc::new(mio::Poll::new()?);
        poll.register(
            &listener,
            mio::Token(LISTENER_TOKEN),
            mio::Ready::readable(),
            mio::PollOpt::level(),
        )?;

        let async_config = AsyncConfig {
            capacity: self.capacity,
            ttl: Duration::from_secs(Props::default().ttl_secs as u64),
            min_timeout: Duration::from_millis(500),
        };
        let (async_handle, async_thread) = egress::spawn(async_config, self.pages.clone(), log)?;

        self.core = Some(Arc::new(TcpCore {
            actual_port,
            poll,
            accept: Mutex::new(AcceptState {
                listener,
                events: mio::Events::with_capacity(256),
            }),
            conns: Mutex::new(ConnTable {
                parked: Vec::new(),
                free_ids: Vec::new(),
                next_id: 0,
                capacity: self.capacity,
            }),
            props: Mutex::new(Props::default()),
            async_handle,
            async_thread: Mutex::new(Some(async_thread)),
            pages: self.pages.clone(),
            log: log.new(logging::o!()),
        }));

        logging::info!(log, "tcp module listening";
                       "context" => "init",
                       "port" => actual_port);

        Ok(())
    }

    fn cleanup(&self) -> PipeResult<()> {
        let core = self.core()?;

        let _ = core.async_handle.kill();
        if let Some(thread) = core.async_thread.lock().expect("Async thread poisoned").take() {
            let _ = thread.join();
        }

        Ok(())
    }

    fn get_path(&self) -> String {
        let port = self
            .core
            .as_ref()
            .map(|core| core.actual_port)
            .unwrap_or(self.port);

        format!("pipe.tcp.port_{}", port)
    }

    fn get_flags(&self) -> ModuleFlags {
        ModuleFlags::EVENT_LOOP
    }

    fn accept(&self, param: &PairParam, killed: &AtomicBool) -> PipeResult<Option<(HandleData, HandleData)>> {
        let core = self.core()?;
        let mut accept = core.accept.lock().expect("Accept state poisoned");

        loop {
            if killed.load(Ordering::Acquire) {
                return Ok(None);
            }

            core.poll
                .poll(&mut accept.events, Some(Duration::from_millis(ACCEPT_POLL_MILLIS)))?;

            let mut tokens = Vec::new();
            for event in &accept.events {
                tokens.push(event.token().0);
            }

            for token in tokens {
                if token == LISTENER_TOKEN {
                    match accept.listener.accept() {
                        Ok((stream, _addr)) => {
                            let id = {
                                let mut conns = core.conns.lock().expect("Conn table poisoned");
                                match conns.allocate_id() {
                                    Some(id) => id,
                                    None => {
                                        logging::warn!(core.log, "connection table full";
                                                       "context" => "accept");
                                        continue;
                                    }
                                }
                            };

                            return Ok(Some(TcpCore::make_pair(core,
                                id,
                                stream,
                                Vec::new(),
                                VecDeque::new(),
                                param,
                            )));
                        }
                        Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(error) => return Err(PipeError::from(error)),
                    }
                } else {
                    // A parked connection turned readable: revive it with
                    // its preserved state and buffered bytes.
                    let id = token - 1;
                    let parked = {
                        let mut conns = core.conns.lock().expect("Conn table poisoned");
                        conns.parked.get_mut(id).and_then(|slot| slot.take())
                    };

                    if let Some(parked) = parked {
                        let _ = core.poll.deregister(&parked.stream);

                        return Ok(Some(TcpCore::make_pair(core,
                            id,
                            parked.stream,
                            parked.states,
                            parked.unread,
                            param,
                        )));
                    }
                }
            }
        }
    }

    fn deallocate(&self, data: &mut HandleData, error: bool, purge: bool) -> PipeResult<()> {
        let core = self.core()?;
        let handle = Self::handle(data)?;

        if error {
            handle.conn.error.store(true, Ordering::Release);
        }

        // Output death means no more bytes will be produced
        if !handle.input && handle.conn.async_active.load(Ordering::Acquire) {
            let _ = core.async_handle.data_end(handle.conn.id as u32);
        }

        if !purge {
            return Ok(());
        }

        let persist = core.props.lock().expect("Props poisoned").persist;
        handle.conn.park_ok.store(persist && !error, Ordering::Release);
        handle.conn.purge_done.store(true, Ordering::Release);

        core.maybe_release(&handle.conn);
        Ok(())
    }

    fn read(&self, data: &mut HandleData, buffer: &mut [u8]) -> PipeResult<usize> {
        let handle = Self::handle(data)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        if let HandleMode::Snapshot(snapshot) = &mut handle.mode {
            let count = buffer.len().min(snapshot.len());
            for slot in buffer.iter_mut().take(count) {
                *slot = snapshot.pop_front().expect("Snapshot length checked");
            }
            return Ok(count);
        }

        // Buffered pushback first, then the socket
        {
            let mut unread = handle.conn.unread.lock().expect("Conn unread poisoned");
            if !unread.is_empty() {
                let count = buffer.len().min(unread.len());
                for slot in buffer.iter_mut().take(count) {
                    *slot = unread.pop_front().expect("Unread length checked");
                }
                return Ok(count);
            }
        }

        let mut guard = handle.conn.stream.lock().expect("Conn stream poisoned");
        let stream = guard.as_mut().ok_or(PipeError::InvalidArgument)?;

        match stream.read(buffer) {
            Ok(0) => {
                handle.conn.has_more.store(false, Ordering::Release);
                Ok(0)
            }
            Ok(count) => Ok(count),
            Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(ref error) if error.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(error) => {
                handle.conn.error.store(true, Ordering::Release);
                Err(PipeError::from(error))
            }
        }
    }

    fn write(&self, data: &mut HandleData, bytes: &[u8]) -> PipeResult<usize> {
        let core = self.core()?;
        let handle = Self::handle(data)?;
        if handle.input {
            return Err(PipeError::InvalidArgument);
        }

        if !core.async_enabled(handle) {
            let mut guard = handle.conn.stream.lock().expect("Conn stream poisoned");
            let stream = guard.as_mut().ok_or(PipeError::InvalidArgument)?;

            return match stream.write(bytes) {
                Ok(count) => Ok(count),
                Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                Err(ref error) if error.kind() == std::io::ErrorKind::Interrupted => Ok(0),
                Err(error) => {
                    handle.conn.error.store(true, Ordering::Release);
                    Err(PipeError::from(error))
                }
            };
        }

        let mut written = 0;

        // One synchronous attempt before a slot exists: small bursts leave
        // without ever involving the loop.
        let sync_attempt = core.props.lock().expect("Props poisoned").sync_write_attempt;
        if sync_attempt && !handle.conn.async_active.load(Ordering::Acquire) {
            let mut guard = handle.conn.stream.lock().expect("Conn stream poisoned");
            let stream = guard.as_mut().ok_or(PipeError::InvalidArgument)?;

            written = match stream.write(bytes) {
                Ok(count) => count,
                Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => 0,
                Err(ref error) if error.kind() == std::io::ErrorKind::Interrupted => 0,
                Err(error) => {
                    handle.conn.error.store(true, Ordering::Release);
                    return Err(PipeError::from(error));
                }
            };

            if written == bytes.len() {
                return Ok(written);
            }
        }

        // The remainder spills into the async slot
        TcpCore::ensure_slot(core, &handle.conn)?;

        let chained = handle
            .conn
            .chain
            .lock()
            .expect("Egress chain poisoned")
            .write_bytes(&bytes[written..], &core.pages);

        if chained > 0 {
            core.async_handle.data_ready(handle.conn.id as u32)?;
        }

        Ok(written + chained)
    }

    fn has_write_callback(&self) -> bool {
        self.core
            .as_ref()
            .map(|core| core.props.lock().expect("Props poisoned").async_write)
            .unwrap_or(false)
    }

    fn write_callback(&self, data: &mut HandleData, source: Box<dyn DataSource>) -> PipeResult<()> {
        let core = self.core().map_err(|_| PipeError::TransferFailed)?;
        let handle = Self::handle(data).map_err(|_| PipeError::TransferFailed)?;
        if handle.input {
            let mut source = source;
            source.close();
            return Err(PipeError::TransferFailed);
        }

        if TcpCore::ensure_slot(core, &handle.conn).is_err() {
            let mut source = source;
            source.close();
            return Err(PipeError::TransferFailed);
        }

        if !handle
            .conn
            .chain
            .lock()
            .expect("Egress chain poisoned")
            .push_source(source)
        {
            return Err(PipeError::TransferFailed);
        }

        core.async_handle
            .data_ready(handle.conn.id as u32)
            .map_err(|_| PipeError::TransferFailed)?;

        Ok(())
    }

    fn has_unread_data(&self, data: &mut HandleData) -> PipeResult<bool> {
        let handle = Self::handle(data)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        if let HandleMode::Snapshot(snapshot) = &handle.mode {
            return Ok(!snapshot.is_empty());
        }

        let unread = handle.conn.unread.lock().expect("Conn unread poisoned");
        Ok(!unread.is_empty() || handle.conn.has_more.load(Ordering::Acquire))
    }

    fn eom(&self, data: &mut HandleData, buffer: &[u8], offset: usize) -> PipeResult<()> {
        let handle = Self::handle(data)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        // Keep a one-time copy of everything past the boundary; the next
        // read serves it ahead of the socket.
        let returned = &buffer[offset..];

        match &mut handle.mode {
            HandleMode::Snapshot(snapshot) => {
                for &byte in returned.iter().rev() {
                    snapshot.push_front(byte);
                }
            }
            HandleMode::Stream => {
                let mut unread = handle.conn.unread.lock().expect("Conn unread poisoned");
                for &byte in returned.iter().rev() {
                    unread.push_front(byte);
                }
            }
        }

        Ok(())
    }

    fn internal_buf(
        &self,
        data: &mut HandleData,
        max: usize,
        consume: &mut dyn FnMut(&[u8]) -> usize,
    ) -> PipeResult<usize> {
        let core = self.core()?;
        let handle = Self::handle(data)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        if let HandleMode::Snapshot(_) = handle.mode {
            return Ok(0);
        }

        let event_size = core.props.lock().expect("Props poisoned").event_size as usize;

        let mut unread = handle.conn.unread.lock().expect("Conn unread poisoned");

        if unread.is_empty() {
            // Pull one burst off the socket into the exposed buffer
            let mut staging = vec![0u8; event_size];
            let mut guard = handle.conn.stream.lock().expect("Conn stream poisoned");
            let stream = guard.as_mut().ok_or(PipeError::InvalidArgument)?;

            match stream.read(&mut staging) {
                Ok(0) => {
                    handle.conn.has_more.store(false, Ordering::Release);
                    return Ok(0);
                }
                Ok(count) => unread.extend(&staging[..count]),
                Err(ref error) if error.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
                Err(error) => return Err(PipeError::from(error)),
            }
        }

        let (front, _) = unread.as_slices();
        let exposed = front.len().min(max);
        if exposed == 0 {
            return Ok(0);
        }

        let used = consume(&front[..exposed]);
        if used > exposed {
            return Err(PipeError::InvalidArgument);
        }

        unread.drain(..used);
        Ok(used)
    }

    fn push_state(&self, data: &mut HandleData, state: PushedState) -> PipeResult<()> {
        let handle = Self::handle(data)?;

        handle
            .conn
            .states
            .lock()
            .expect("Conn states poisoned")
            .push(state);
        Ok(())
    }

    fn pop_state(&self, data: &mut HandleData) -> PipeResult<Option<PushedState>> {
        let handle = Self::handle(data)?;

        Ok(handle
            .conn
            .states
            .lock()
            .expect("Conn states poisoned")
            .last()
            .cloned())
    }

    fn fork(&self, src: &mut HandleData, _args: &[String]) -> PipeResult<HandleData> {
        let handle = Self::handle(src)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        // The shadow replays whatever request bytes are buffered right now
        let snapshot = handle.conn.unread.lock().expect("Conn unread poisoned").clone();

        Ok(Box::new(TcpHandle {
            core: handle.core.clone(),
            conn: handle.conn.clone(),
            mode: HandleMode::Snapshot(snapshot),
            input: true,
            async_requested: handle.async_requested,
        }))
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> PipeResult<()> {
        let core = self.core()?;
        let mut props = core.props.lock().expect("Props poisoned");

        match (name, value) {
            ("ttl", PropertyValue::Int(ttl)) => props.ttl_secs = ttl,
            ("event_size", PropertyValue::Int(size)) => props.event_size = size,
            ("async_write", PropertyValue::Int(flag)) => props.async_write = flag != 0,
            ("sync_write_attempt", PropertyValue::Int(flag)) => props.sync_write_attempt = flag != 0,
            ("persist", PropertyValue::Int(flag)) => props.persist = flag != 0,
            _ => return Err(PipeError::Unsupported),
        }

        Ok(())
    }

    fn get_property(&self, name: &str) -> PipeResult<PropertyValue> {
        let core = self.core()?;
        let props = core.props.lock().expect("Props poisoned");

        match name {
            "ttl" => Ok(PropertyValue::Int(props.ttl_secs)),
            "event_size" => Ok(PropertyValue::Int(props.event_size)),
            "async_write" => Ok(PropertyValue::Int(props.async_write as i64)),
            "sync_write_attempt" => Ok(PropertyValue::Int(props.sync_write_attempt as i64)),
            "persist" => Ok(PropertyValue::Int(props.persist as i64)),
            "port" => Ok(PropertyValue::Int(i64::from(core.actual_port))),
            _ => Err(PipeError::Unsupported),
        }
    }

    fn event_thread_killed(&self) {
        if let Some(core) = self.core.as_ref() {
            logging::debug!(core.log, "event thread torn down"; "context" => "event_thread_killed");
        }
    }
}
