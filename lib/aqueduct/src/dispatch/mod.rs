//! The event dispatcher: one dedicated accept loop per event-capable
//! module instance, a fixed pool of worker threads executing node tasks,
//! and the per-request wiring that binds an accepted connection to the
//! frozen service graph. No thread both accepts events and executes tasks.

use crate::graph::{NodeId, Service};
use crate::module::{Module, ModuleFlags, ModuleInstance, ModuleTab, PairParam};
use crate::pipe::state::PushedState;
use crate::pipe::{Direction, Pipe};
use crate::servlet::Servlet;
use crate::support::{CancelToken, ErrorUtils, PipeError, PipeResult};
use bedrock::logging;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// The execution context handed to a servlet's `exec`: the node's pipes
/// bound by port name, plus any user state a persistent connection
/// carried over.
pub struct TaskContext {
    inputs: Vec<(String, Pipe)>,
    outputs: Vec<(String, Pipe)>,
    resumed: Option<PushedState>,
    cancel: CancelToken,
    log: logging::Logger,
}

impl TaskContext {
    pub fn input(&mut self, name: &str) -> PipeResult<&mut Pipe> {
        self.inputs
            .iter_mut()
            .find(|(port, _)| port == name)
            .map(|(_, pipe)| pipe)
            .ok_or(PipeError::InvalidArgument)
    }

    pub fn output(&mut self, name: &str) -> PipeResult<&mut Pipe> {
        self.outputs
            .iter_mut()
            .find(|(port, _)| port == name)
            .map(|(_, pipe)| pipe)
            .ok_or(PipeError::InvalidArgument)
    }

    /// User state popped from the connection before dispatch, present when
    /// a persistent connection resumes mid-stream.
    #[inline]
    pub fn resumed_state(&self) -> Option<&PushedState> {
        self.resumed.as_ref()
    }

    #[inline]
    pub fn take_resumed_state(&mut self) -> Option<PushedState> {
        self.resumed.take()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[inline]
    pub fn log(&self) -> &logging::Logger {
        &self.log
    }
}

struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    available: Condvar,
}

struct Task {
    run: Arc<RequestRun>,
    node: NodeId,
}

/// Per-request state: the pipes instantiated for every port, the remaining
/// upstream count per node and the cancellation tokens tasks are checked
/// against at scheduler entry.
struct RequestRun {
    service: Arc<Service>,
    pipes: Mutex<Vec<Option<Pipe>>>,
    port_base: Vec<usize>,
    pending: Vec<AtomicUsize>,
    cancel: Vec<CancelToken>,
    resumed: Mutex<Option<PushedState>>,
    log: logging::Logger,
}

impl RequestRun {
    fn slot(&self, node: NodeId, port: u32) -> usize {
        self.port_base[node as usize] + port as usize
    }
}

#[derive(Clone)]
pub struct DispatchConfig {
    /// Worker-thread count.
    pub workers: usize,
    /// Instance path of the module carrying interior graph edges.
    pub interior_module: String,
}

impl Default for DispatchConfig {
    fn default() -> DispatchConfig {
        DispatchConfig {
            workers: 4,
            interior_module: "pipe.mem.main".into(),
        }
    }
}

pub struct Dispatcher {
    tab: Arc<ModuleTab>,
    queue: Arc<TaskQueue>,
    killed: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
    event_threads: Vec<thread::JoinHandle<()>>,
    log: logging::Logger,
}

impl Dispatcher {
    /// Starts the worker pool and one accept loop per event-capable module
    /// instance.
    pub fn start<'a, L: Into<Option<&'a logging::Logger>>>(
        service: Arc<Service>,
        tab: Arc<ModuleTab>,
        config: DispatchConfig,
        log: L,
    ) -> PipeResult<Dispatcher> {
        let dispatch_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let interior_ty = tab.lookup_path(&config.interior_module)?;
        let interior = tab.lookup(interior_ty)?;

        let queue = Arc::new(TaskQueue {
            tasks: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });
        let killed = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let queue = queue.clone();
            let killed = killed.clone();
            let worker_log = dispatch_log.new(logging::o!());

            workers.push(
                thread::Builder::new()
                    .name(format!("worker-{}", index))
                    .spawn(move || worker_loop(queue, killed, worker_log))
                    .map_err(PipeError::from)?,
            );
        }

        let mut event_threads = Vec::new();
        for ty in tab.event_capable() {
            let instance = tab.lookup(ty)?;
            let service = service.clone();
            let interior = interior.clone();
            let queue = queue.clone();
            let killed = killed.clone();
            let event_log = dispatch_log.new(logging::o!());

            event_threads.push(
                thread::Builder::new()
                    .name(format!("event-{}", instance.path))
                    .spawn(move || event_loop(instance, service, interior, queue, killed, event_log))
                    .map_err(PipeError::from)?,
            );
        }

        logging::info!(dispatch_log, "dispatcher started";
                       "context" => "start",
                       "workers" => config.workers,
                       "event_threads" => event_threads.len());

        Ok(Dispatcher {
            tab,
            queue,
            killed,
            workers,
            event_threads,
            log: dispatch_log,
        })
    }

    /// Signals shutdown and joins every thread.
    pub fn shutdown(mut self) {
        logging::info!(self.log, "dispatcher shutting down"; "context" => "shutdown");

        self.killed.store(true, Ordering::Release);

        for ty in self.tab.event_capable() {
            if let Ok(instance) = self.tab.lookup(ty) {
                instance.module.event_thread_killed();
            }
        }

        self.queue.available.notify_all();

        for thread in self.event_threads.drain(..) {
            let _ = thread.join();
        }
        for thread in self.workers.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_loop(queue: Arc<TaskQueue>, killed: Arc<AtomicBool>, log: logging::Logger) {
    loop {
        let task = {
            let mut tasks = queue.tasks.lock().expect("Task queue poisoned");

            loop {
                if killed.load(Ordering::Acquire) {
                    return;
                }

                if let Some(task) = tasks.pop_front() {
                    break task;
                }

                tasks = queue.available.wait(tasks).expect("Task queue poisoned");
            }
        };

        execute(task, &queue, &log);
    }
}

fn event_loop(
    instance: Arc<ModuleInstance>,
    service: Arc<Service>,
    interior: Arc<ModuleInstance>,
    queue: Arc<TaskQueue>,
    killed: Arc<AtomicBool>,
    log: logging::Logger,
) {
    let (entry_node, entry_port) = service.input_node();
    let (exit_node, exit_port) = service.output_node();

    let param = PairParam {
        input_header: service
            .typed_header_size(entry_node, entry_port)
            .unwrap_or(0),
        output_header: service.typed_header_size(exit_node, exit_port).unwrap_or(0),
        ..PairParam::default()
    };

    logging::debug!(log, "event loop started"; "context" => "event_loop", "module" => %instance.path);

    while !killed.load(Ordering::Acquire) {
        let pair = match Pipe::accept(&instance, &param, &killed) {
            Ok(Some(pair)) => pair,
            Ok(None) => break,
            Err(error) => {
                logging::warn!(log, "accept failed";
                               "context" => "event_loop",
                               "module" => %instance.path,
                               "error" => ?error);

                if instance.module.get_flags().contains(ModuleFlags::EVENT_EXHAUSTED) {
                    break;
                }
                continue;
            }
        };

        match instantiate(&service, &interior, pair, &log) {
            Ok(run) => enqueue_ready(&run, &queue),
            Err(error) => {
                logging::warn!(log, "request instantiation failed";
                               "context" => "event_loop",
                               "error" => ?error);
            }
        }

        if instance.module.get_flags().contains(ModuleFlags::EVENT_EXHAUSTED) {
            break;
        }
    }

    logging::debug!(log, "event loop finished"; "context" => "event_loop", "module" => %instance.path);
}

/// Builds the per-request task set: the accepted pair is bound to the
/// entry and exit ports, every graph edge gets a pipelined pair on the
/// interior module, and previously pushed user state is popped so a
/// persistent connection resumes mid-stream.
fn instantiate(
    service: &Arc<Service>,
    interior: &Arc<ModuleInstance>,
    accepted: (Pipe, Pipe),
    log: &logging::Logger,
) -> PipeResult<Arc<RequestRun>> {
    let (mut accepted_in, accepted_out) = accepted;

    let node_count = service.node_count();
    let mut port_base = Vec::with_capacity(node_count);
    let mut total_ports = 0usize;
    for node in 0..node_count as NodeId {
        port_base.push(total_ports);
        total_ports += service.port_decls(node).len();
    }

    let resumed = accepted_in.pop_state().unwrap_or(None);

    let run = RequestRun {
        service: service.clone(),
        pipes: Mutex::new((0..total_ports).map(|_| None).collect()),
        port_base,
        pending: (0..node_count).map(|_| AtomicUsize::new(0)).collect(),
        cancel: (0..node_count).map(|_| CancelToken::new()).collect(),
        resumed: Mutex::new(resumed),
        log: log.new(logging::o!()),
    };

    {
        let mut pipes = run.pipes.lock().expect("Request pipes poisoned");

        let (entry_node, entry_port) = service.input_node();
        let (exit_node, exit_port) = service.output_node();
        pipes[run.slot(entry_node, entry_port)] = Some(accepted_in);
        pipes[run.slot(exit_node, exit_port)] = Some(accepted_out);

        for edge in service.edges() {
            let param = PairParam {
                input_header: service.typed_header_size(edge.dst_node, edge.dst_port)?,
                output_header: service.typed_header_size(edge.src_node, edge.src_port)?,
                ..PairParam::default()
            };

            let (input, output) = Pipe::allocate(interior, edge.src_node, &param)?;

            pipes[run.slot(edge.src_node, edge.src_port)] = Some(output);
            pipes[run.slot(edge.dst_node, edge.dst_port)] = Some(input);

            run.pending[edge.dst_node as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    Ok(Arc::new(run))
}

fn enqueue_ready(run: &Arc<RequestRun>, queue: &Arc<TaskQueue>) {
    let mut ready = Vec::new();
    for node in 0..run.service.node_count() as NodeId {
        if run.pending[node as usize].load(Ordering::Acquire) == 0 {
            ready.push(node);
        }
    }

    push_tasks(run, queue, ready);
}

fn push_tasks(run: &Arc<RequestRun>, queue: &Arc<TaskQueue>, nodes: Vec<NodeId>) {
    if nodes.is_empty() {
        return;
    }

    let mut tasks = queue.tasks.lock().expect("Task queue poisoned");
    for node in nodes {
        tasks.push_back(Task {
            run: run.clone(),
            node,
        });
        queue.available.notify_one();
    }
}

/// Runs one node task to completion, then releases its handles and wakes
/// the downstream tasks whose last upstream it was.
fn execute(task: Task, queue: &Arc<TaskQueue>, log: &logging::Logger) {
    let run = task.run;
    let node = task.node;
    let service = &run.service;

    let decls = service.port_decls(node);

    // Collect the node's pipes out of the shared table
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    {
        let mut pipes = run.pipes.lock().expect("Request pipes poisoned");

        for (port, decl) in decls.iter().enumerate() {
            if let Some(mut pipe) = pipes[run.slot(node, port as u32)].take() {
                pipe.set_owner(run.cancel[node as usize].clone());

                match decl.dir {
                    Direction::Input => inputs.push((decl.name.clone(), pipe)),
                    Direction::Output => outputs.push((decl.name.clone(), pipe)),
                }
            }
        }
    }

    // Cancellation check at scheduler entry: a cancelled task never runs;
    // its untouched outputs propagate the cancellation downstream when
    // they close.
    let cancelled = run.cancel[node as usize].is_cancelled()
        || inputs.iter().any(|(_, pipe)| pipe.is_cancelled());

    if cancelled {
        logging::debug!(run.log, "task cancelled before dispatch";
                        "context" => "execute",
                        "node" => node);
    } else {
        let mark = service.start_timer(node);

        let mut ctx = TaskContext {
            inputs,
            outputs,
            resumed: run.resumed.lock().expect("Resumed state poisoned").take(),
            cancel: run.cancel[node as usize].clone(),
            log: run.log.new(logging::o!()),
        };

        let result = service.lock_servlet(node).exec(&mut ctx);
        service.stop_timer(mark);

        inputs = ctx.inputs;
        outputs = ctx.outputs;

        if result.has_failed() {
            logging::warn!(log, "task failed";
                           "context" => "execute",
                           "node" => node,
                           "binary" => service.node_binary(node));

            // A failed producer reads as an error to every consumer
            for (_, pipe) in outputs.iter_mut() {
                pipe.set_error();
            }
        }
    }

    for (_, pipe) in inputs.iter_mut() {
        let _ = pipe.close();
    }
    for (_, pipe) in outputs.iter_mut() {
        let _ = pipe.close();
    }
    drop(inputs);
    drop(outputs);

    // Wake downstream tasks whose upstream count ran out
    let mut ready = Vec::new();
    for edge in service.outgoing(node) {
        if run.pending[edge.dst_node as usize].fetch_sub(1, Ordering::AcqRel) == 1 {
            ready.push(edge.dst_node);
        }
    }

    push_tasks(&run, queue, ready);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{freeze, PipeDesc, ServiceBuffer};
    use crate::module::{HandleData, Module};
    use crate::modules::mem::MemModule;
    use crate::servlet::{PortDecl, PortType, Servlet, ServletTab};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Event-capable test module: each queued event carries request bytes;
    /// the response the graph produces is sent back over a channel when
    /// the output end is purged.
    struct LoopbackModule {
        pending: Mutex<VecDeque<Vec<u8>>>,
        wakeup: Condvar,
        responses: Mutex<mpsc::Sender<Vec<u8>>>,
    }

    struct LoopbackShared {
        request: Vec<u8>,
        response: Vec<u8>,
        sender: mpsc::Sender<Vec<u8>>,
    }

    struct LoopbackHandle {
        shared: Arc<Mutex<LoopbackShared>>,
        cursor: usize,
        input: bool,
    }

    impl LoopbackModule {
        fn boxed(events: Vec<Vec<u8>>, responses: mpsc::Sender<Vec<u8>>) -> Box<LoopbackModule> {
            Box::new(LoopbackModule {
                pending: Mutex::new(events.into_iter().collect()),
                wakeup: Condvar::new(),
                responses: Mutex::new(responses),
            })
        }

        fn handle<'a>(data: &'a mut HandleData) -> PipeResult<&'a mut LoopbackHandle> {
            data.downcast_mut::<LoopbackHandle>().ok_or(PipeError::InvalidArgument)
        }
    }

    impl Module for LoopbackModule {
        fn init(&mut self, _argv: &[String], _log: &logging::Logger) -> PipeResult<()> {
            Ok(())
        }

        fn cleanup(&self) -> PipeResult<()> {
            Ok(())
        }

        fn get_path(&self) -> String {
            "pipe.loop.test".into()
        }

        fn get_flags(&self) -> ModuleFlags {
            ModuleFlags::EVENT_LOOP
        }

        fn accept(
            &self,
            _param: &PairParam,
            killed: &AtomicBool,
        ) -> PipeResult<Option<(HandleData, HandleData)>> {
            let mut pending = self.pending.lock().expect("Pending events poisoned");

            let request = loop {
                if killed.load(Ordering::Acquire) {
                    return Ok(None);
                }

                if let Some(request) = pending.pop_front() {
                    break request;
                }

                let (guard, _) = self
                    .wakeup
                    .wait_timeout(pending, Duration::from_millis(20))
                    .expect("Pending events poisoned");
                pending = guard;
            };

            let shared = Arc::new(Mutex::new(LoopbackShared {
                request,
                response: Vec::new(),
                sender: self.responses.lock().unwrap().clone(),
            }));

            let input = LoopbackHandle {
                shared: shared.clone(),
                cursor: 0,
                input: true,
            };
            let output = LoopbackHandle {
                shared,
                cursor: 0,
                input: false,
            };

            Ok(Some((Box::new(input), Box::new(output))))
        }

        fn deallocate(&self, data: &mut HandleData, _error: bool, _purge: bool) -> PipeResult<()> {
            let handle = Self::handle(data)?;

            if !handle.input {
                let shared = handle.shared.lock().expect("Loopback shared poisoned");
                let _ = shared.sender.send(shared.response.clone());
            }

            Ok(())
        }

        fn read(&self, data: &mut HandleData, buffer: &mut [u8]) -> PipeResult<usize> {
            let handle = Self::handle(data)?;
            if !handle.input {
                return Err(PipeError::InvalidArgument);
            }

            let shared = handle.shared.lock().expect("Loopback shared poisoned");
            let pending = &shared.request[handle.cursor..];
            let count = pending.len().min(buffer.len());
            buffer[..count].copy_from_slice(&pending[..count]);
            handle.cursor += count;

            Ok(count)
        }

        fn write(&self, data: &mut HandleData, bytes: &[u8]) -> PipeResult<usize> {
            let handle = Self::handle(data)?;
            if handle.input {
                return Err(PipeError::InvalidArgument);
            }

            let mut shared = handle.shared.lock().expect("Loopback shared poisoned");
            shared.response.extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn has_unread_data(&self, data: &mut HandleData) -> PipeResult<bool> {
            let handle = Self::handle(data)?;
            let shared = handle.shared.lock().expect("Loopback shared poisoned");
            Ok(handle.cursor < shared.request.len())
        }

        fn pop_state(&self, _data: &mut HandleData) -> PipeResult<Option<PushedState>> {
            Ok(None)
        }
    }

    struct RelayServlet {
        ports: Vec<PortDecl>,
    }

    impl Servlet for RelayServlet {
        fn init(&mut self, _argv: &[String], _log: &logging::Logger) -> PipeResult<()> {
            self.ports = vec![
                PortDecl::input("in", PortType::untyped()),
                PortDecl::output("out", PortType::untyped()),
            ];
            Ok(())
        }

        fn ports(&self) -> &[PortDecl] {
            &self.ports
        }

        fn exec(&mut self, ctx: &mut TaskContext) -> PipeResult<()> {
            let mut buffer = [0u8; 256];

            loop {
                let count = ctx.input("in")?.read(&mut buffer)?;

                if count == 0 {
                    if !ctx.input("in")?.has_unread_data()? {
                        break;
                    }
                    continue;
                }

                let mut written = 0;
                while written < count {
                    written += ctx.output("out")?.write(&buffer[written..count])?;
                }
            }

            Ok(())
        }
    }

    fn relay_tab() -> Arc<ServletTab> {
        let mut tab = ServletTab::new(None);
        tab.register("relay", || Box::new(RelayServlet { ports: Vec::new() }));
        Arc::new(tab)
    }

    fn two_node_service() -> Arc<Service> {
        let mut buffer = ServiceBuffer::new(relay_tab(), None);
        buffer.allow_reuse_servlet();

        let first = buffer.add_node("relay", &[]).unwrap();
        let second = buffer.add_node("relay", &[]).unwrap();

        buffer
            .add_pipe(PipeDesc {
                src_node: first,
                src_port: 1,
                dst_node: second,
                dst_port: 0,
            })
            .unwrap();
        buffer.set_input(first, 0).unwrap();
        buffer.set_output(second, 1).unwrap();

        freeze(buffer).unwrap()
    }

    #[test]
    fn test_request_flows_through_graph() {
        let service = two_node_service();

        let (response_tx, response_rx) = mpsc::channel();

        let tab = Arc::new(ModuleTab::new(64, None));
        tab.install(MemModule::boxed("main"), &[]).unwrap();
        tab.install(
            LoopbackModule::boxed(vec![b"hello graph".to_vec()], response_tx),
            &[],
        )
        .unwrap();

        let dispatcher = Dispatcher::start(service, tab, DispatchConfig::default(), None).unwrap();

        let response = response_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(response, b"hello graph");

        dispatcher.shutdown();
    }

    #[test]
    fn test_multiple_requests() {
        let service = two_node_service();

        let (response_tx, response_rx) = mpsc::channel();

        let events: Vec<Vec<u8>> = (0..8u8).map(|index| vec![index; 16]).collect();

        let tab = Arc::new(ModuleTab::new(64, None));
        tab.install(MemModule::boxed("main"), &[]).unwrap();
        tab.install(LoopbackModule::boxed(events.clone(), response_tx), &[])
            .unwrap();

        let dispatcher = Dispatcher::start(service, tab, DispatchConfig::default(), None).unwrap();

        let mut responses = Vec::new();
        for _ in 0..events.len() {
            responses.push(response_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }

        responses.sort();
        let mut expected = events;
        expected.sort();
        assert_eq!(responses, expected);

        dispatcher.shutdown();
    }
}
