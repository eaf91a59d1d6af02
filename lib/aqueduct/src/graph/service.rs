//! The frozen service graph. `freeze` validates the buffer, lays the edge
//! lists out per node, runs the critical-node analysis and type
//! propagation, and produces an immutable value safe to share across
//! threads.

use crate::graph::buffer::{NodeSpec, PipeDesc, ServiceBuffer};
use crate::graph::{NodeId, MAX_EDGES, MAX_NODES};
use crate::servlet::{PortDecl, PortId, PortType, Servlet};
use crate::support::{PipeError, PipeResult, Violation};
use bedrock::logging;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

pub struct ServiceNode {
    pub binary: String,
    pub argv: Vec<String>,
    servlet: Mutex<Box<dyn Servlet>>,
    decls: Vec<PortDecl>,
    /// Concrete per-port types after propagation, indexed by `PortId`.
    types: Vec<PortType>,
    /// Edge indices into the service edge list. Outgoing edges are sorted
    /// by source-port id so originals are initialized before their shadow
    /// companions at scheduling time.
    incoming: Vec<u32>,
    outgoing: Vec<u32>,
}

impl std::fmt::Debug for ServiceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceNode")
            .field("binary", &self.binary)
            .field("argv", &self.argv)
            .field("decls", &self.decls)
            .field("types", &self.types)
            .field("incoming", &self.incoming)
            .field("outgoing", &self.outgoing)
            .finish()
    }
}

#[derive(Debug)]
struct ProfSlot {
    nanos: AtomicU64,
    count: AtomicU64,
}

/// An in-flight per-node timer handed out by `start_timer`.
pub struct ProfMark {
    node: NodeId,
    start: Instant,
}

#[derive(Debug)]
pub struct Service {
    nodes: Vec<ServiceNode>,
    edges: Vec<PipeDesc>,
    input: (NodeId, PortId),
    output: (NodeId, PortId),
    critical: Vec<NodeId>,
    critical_mask: Vec<bool>,
    prof: Vec<ProfSlot>,
    log: logging::Logger,
}

/// Validates and freezes a service buffer. This is the only constructor of
/// `Service`; everything observable afterwards is read-only.
pub fn freeze(mut buffer: ServiceBuffer) -> PipeResult<Arc<Service>> {
    let node_count = buffer.nodes.len();
    let edge_count = buffer.pipes.len();

    if node_count > MAX_NODES || edge_count > MAX_EDGES {
        return Err(PipeError::Violation(Violation::TooLarge));
    }

    let input = buffer.input.ok_or(PipeError::Violation(Violation::BadEndpoint))?;
    let output = buffer.output.ok_or(PipeError::Violation(Violation::BadEndpoint))?;

    let edges = buffer.pipes.clone();

    // Per-node edge lists, outgoing sorted by source port
    let mut incoming: Vec<Vec<u32>> = vec![Vec::new(); node_count];
    let mut outgoing: Vec<Vec<u32>> = vec![Vec::new(); node_count];

    for (index, edge) in edges.iter().enumerate() {
        outgoing[edge.src_node as usize].push(index as u32);
        incoming[edge.dst_node as usize].push(index as u32);
    }

    for list in outgoing.iter_mut() {
        list.sort_by_key(|&index| edges[index as usize].src_port);
    }

    for (id, list) in incoming.iter().enumerate() {
        if list.is_empty() && id as NodeId != input.0 {
            logging::warn!(buffer.log, "interior node has no incoming pipes";
                           "context" => "freeze",
                           "node" => id);
        }
    }

    let order = topo_sort(node_count, &edges, &outgoing)?;

    // The entry node is fed by the event source and the exit node feeds
    // it back; neither may have graph edges on that side.
    if !incoming[input.0 as usize].is_empty() || !outgoing[output.0 as usize].is_empty() {
        return Err(PipeError::Violation(Violation::BadEndpoint));
    }

    let types = propagate_types(&mut buffer.nodes, &edges, &order, &outgoing)?;

    let (critical, critical_mask) = critical_nodes(node_count, &edges, &incoming, &outgoing, input.0, output.0);

    logging::info!(buffer.log, "service graph frozen";
                   "context" => "freeze",
                   "nodes" => node_count,
                   "edges" => edge_count,
                   "critical" => critical.len());

    let mut nodes = Vec::with_capacity(node_count);
    for (id, spec) in buffer.nodes.drain(..).enumerate() {
        let NodeSpec { binary, argv, servlet } = spec;

        nodes.push(ServiceNode {
            binary,
            argv,
            decls: servlet.ports().to_vec(),
            servlet: Mutex::new(servlet),
            types: types[id].clone(),
            incoming: std::mem::take(&mut incoming[id]),
            outgoing: std::mem::take(&mut outgoing[id]),
        });
    }

    let prof = (0..node_count)
        .map(|_| ProfSlot {
            nanos: AtomicU64::new(0),
            count: AtomicU64::new(0),
        })
        .collect();

    Ok(Arc::new(Service {
        nodes,
        edges,
        input,
        output,
        critical,
        critical_mask,
        prof,
        log: buffer.log,
    }))
}

/// Kahn's algorithm over a working in-degree array. Any node left with a
/// non-zero count after `node_count` reductions sits on a cycle.
fn topo_sort(node_count: usize, edges: &[PipeDesc], outgoing: &[Vec<u32>]) -> PipeResult<Vec<NodeId>> {
    let mut degree = vec![0u32; node_count];
    for edge in edges {
        degree[edge.dst_node as usize] += 1;
    }

    let mut queue: Vec<NodeId> = (0..node_count as NodeId)
        .filter(|&id| degree[id as usize] == 0)
        .collect();
    let mut order = Vec::with_capacity(node_count);

    while let Some(id) = queue.pop() {
        order.push(id);

        for &edge_index in &outgoing[id as usize] {
            let dst = edges[edge_index as usize].dst_node;
            degree[dst as usize] -= 1;
            if degree[dst as usize] == 0 {
                queue.push(dst);
            }
        }
    }

    if order.len() != node_count {
        return Err(PipeError::Violation(Violation::Cycle));
    }

    Ok(order)
}

/// Resolves every port to a concrete type. For each edge the source output
/// type must be assignment-compatible with the destination input type; a
/// wildcard destination adopts the source type and the servlet's
/// type-resolution hook is told.
fn propagate_types(
    nodes: &mut [NodeSpec],
    edges: &[PipeDesc],
    order: &[NodeId],
    outgoing: &[Vec<u32>],
) -> PipeResult<Vec<Vec<PortType>>> {
    let mut types: Vec<Vec<PortType>> = nodes
        .iter()
        .map(|spec| spec.servlet.ports().iter().map(|decl| decl.ty.clone()).collect())
        .collect();

    for &src in order {
        for &edge_index in &outgoing[src as usize] {
            let edge = &edges[edge_index as usize];
            let src_ty = types[edge.src_node as usize][edge.src_port as usize].clone();
            let dst_ty = &types[edge.dst_node as usize][edge.dst_port as usize];

            if !dst_ty.accepts(&src_ty) {
                return Err(PipeError::Violation(Violation::TypeMismatch));
            }

            if dst_ty.is_untyped() && !src_ty.is_untyped() {
                types[edge.dst_node as usize][edge.dst_port as usize] = src_ty.clone();
                nodes[edge.dst_node as usize]
                    .servlet
                    .type_resolved(edge.dst_port, &src_ty)?;
            }
        }
    }

    Ok(types)
}

/// Identifies the nodes every entry-to-exit path must traverse.
///
/// Over the subgraph of nodes that both lie on some path from the entry
/// and reach the exit, a node is on every path exactly when no edge spans
/// its topological position. One prefix-sum sweep answers that for all
/// nodes at once.
fn critical_nodes(
    node_count: usize,
    edges: &[PipeDesc],
    incoming: &[Vec<u32>],
    outgoing: &[Vec<u32>],
    entry: NodeId,
    exit: NodeId,
) -> (Vec<NodeId>, Vec<bool>) {
    let from_entry = reach(node_count, entry, |id| {
        outgoing[id as usize]
            .iter()
            .map(|&e| edges[e as usize].dst_node)
            .collect()
    });
    let to_exit = reach(node_count, exit, |id| {
        incoming[id as usize]
            .iter()
            .map(|&e| edges[e as usize].src_node)
            .collect()
    });

    let relevant: Vec<bool> = (0..node_count).map(|id| from_entry[id] && to_exit[id]).collect();

    // Topological positions of the relevant nodes only
    let mut degree = vec![0u32; node_count];
    for edge in edges {
        if relevant[edge.src_node as usize] && relevant[edge.dst_node as usize] {
            degree[edge.dst_node as usize] += 1;
        }
    }

    let mut position = vec![usize::max_value(); node_count];
    let mut queue: Vec<NodeId> = (0..node_count as NodeId)
        .filter(|&id| relevant[id as usize] && degree[id as usize] == 0)
        .collect();
    let mut next_position = 0usize;

    while let Some(id) = queue.pop() {
        position[id as usize] = next_position;
        next_position += 1;

        for &edge_index in &outgoing[id as usize] {
            let dst = edges[edge_index as usize].dst_node;
            if relevant[dst as usize] {
                degree[dst as usize] -= 1;
                if degree[dst as usize] == 0 {
                    queue.push(dst);
                }
            }
        }
    }

    // Count the edges spanning each position with a difference array: an
    // edge (a, b) bypasses every node strictly between its endpoints.
    let mut crossing = vec![0i64; next_position + 1];
    for edge in edges {
        if !relevant[edge.src_node as usize] || !relevant[edge.dst_node as usize] {
            continue;
        }

        let from = position[edge.src_node as usize] + 1;
        let to = position[edge.dst_node as usize];
        if from < to {
            crossing[from] += 1;
            crossing[to] -= 1;
        }
    }

    let mut critical = Vec::new();
    let mut critical_mask = vec![false; node_count];
    let mut running = vec![0i64; next_position];
    let mut sum = 0i64;
    for (index, slot) in running.iter_mut().enumerate() {
        sum += crossing[index];
        *slot = sum;
    }

    for id in 0..node_count {
        if relevant[id] && running[position[id]] == 0 {
            critical.push(id as NodeId);
            critical_mask[id] = true;
        }
    }

    (critical, critical_mask)
}

fn reach<F: Fn(NodeId) -> Vec<NodeId>>(node_count: usize, start: NodeId, next: F) -> Vec<bool> {
    let mut seen = vec![false; node_count];
    let mut stack = vec![start];
    seen[start as usize] = true;

    while let Some(id) = stack.pop() {
        for neighbor in next(id) {
            if !seen[neighbor as usize] {
                seen[neighbor as usize] = true;
                stack.push(neighbor);
            }
        }
    }

    seen
}

impl Service {
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn edges(&self) -> &[PipeDesc] {
        &self.edges
    }

    /// Edges arriving at the node.
    pub fn incoming(&self, node: NodeId) -> impl Iterator<Item = &PipeDesc> {
        self.nodes[node as usize]
            .incoming
            .iter()
            .map(move |&index| &self.edges[index as usize])
    }

    /// Edges leaving the node, sorted by source-port id.
    pub fn outgoing(&self, node: NodeId) -> impl Iterator<Item = &PipeDesc> {
        self.nodes[node as usize]
            .outgoing
            .iter()
            .map(move |&index| &self.edges[index as usize])
    }

    /// The concrete type of a port after propagation.
    pub fn pipe_type(&self, node: NodeId, port: PortId) -> PipeResult<&PortType> {
        self.nodes
            .get(node as usize)
            .and_then(|n| n.types.get(port as usize))
            .ok_or(PipeError::InvalidArgument)
    }

    /// The typed-header byte length of a port.
    pub fn typed_header_size(&self, node: NodeId, port: PortId) -> PipeResult<usize> {
        Ok(self.pipe_type(node, port)?.header_size)
    }

    pub fn port_decls(&self, node: NodeId) -> &[PortDecl] {
        &self.nodes[node as usize].decls
    }

    pub fn node_binary(&self, node: NodeId) -> &str {
        &self.nodes[node as usize].binary
    }

    pub fn node_argv(&self, node: NodeId) -> &[String] {
        &self.nodes[node as usize].argv
    }

    #[inline]
    pub fn input_node(&self) -> (NodeId, PortId) {
        self.input
    }

    #[inline]
    pub fn output_node(&self) -> (NodeId, PortId) {
        self.output
    }

    /// The nodes every entry-to-exit path traverses, in id order.
    #[inline]
    pub fn critical_info(&self) -> &[NodeId] {
        &self.critical
    }

    #[inline]
    pub fn is_critical(&self, node: NodeId) -> bool {
        self.critical_mask[node as usize]
    }

    /// Exclusive access to the node's servlet for one task execution.
    pub fn lock_servlet(&self, node: NodeId) -> MutexGuard<Box<dyn Servlet>> {
        self.nodes[node as usize]
            .servlet
            .lock()
            .expect("Servlet mutex poisoned")
    }

    /// Starts a time-in-node measurement.
    #[inline]
    pub fn start_timer(&self, node: NodeId) -> ProfMark {
        ProfMark {
            node,
            start: Instant::now(),
        }
    }

    /// Records a finished measurement.
    pub fn stop_timer(&self, mark: ProfMark) {
        let slot = &self.prof[mark.node as usize];
        let elapsed = mark.start.elapsed();

        slot.nanos
            .fetch_add(elapsed.as_secs() * 1_000_000_000 + u64::from(elapsed.subsec_nanos()), Ordering::Relaxed);
        slot.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Logs the accumulated per-node timings.
    pub fn flush_timers(&self) {
        for (id, slot) in self.prof.iter().enumerate() {
            let count = slot.count.load(Ordering::Relaxed);
            if count == 0 {
                continue;
            }

            logging::info!(self.log, "node timing";
                           "context" => "profiler",
                           "node" => id,
                           "binary" => %self.nodes[id].binary,
                           "tasks" => count,
                           "total_nanos" => slot.nanos.load(Ordering::Relaxed));
        }
    }
}
