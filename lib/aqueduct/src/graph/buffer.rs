//! The mutable accumulation stage of a service graph. The buffer checks
//! each addition locally; the global properties (acyclicity, endpoint
//! degrees, types) are checked when the buffer is frozen into a `Service`.

use crate::graph::NodeId;
use crate::pipe::Direction;
use crate::servlet::{PortId, Servlet, ServletTab};
use crate::support::{PipeError, PipeResult};
use bedrock::logging;
use hashbrown::HashSet;
use std::sync::Arc;

/// One edge: a pipe from an output port slot to an input port slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PipeDesc {
    pub src_node: NodeId,
    pub src_port: PortId,
    pub dst_node: NodeId,
    pub dst_port: PortId,
}

pub(crate) struct NodeSpec {
    pub binary: String,
    pub argv: Vec<String>,
    pub servlet: Box<dyn Servlet>,
}

pub struct ServiceBuffer {
    pub(crate) tab: Arc<ServletTab>,
    pub(crate) nodes: Vec<NodeSpec>,
    pub(crate) pipes: Vec<PipeDesc>,
    pub(crate) input: Option<(NodeId, PortId)>,
    pub(crate) output: Option<(NodeId, PortId)>,
    used_slots: HashSet<(NodeId, PortId)>,
    allow_reuse: bool,
    pub(crate) log: logging::Logger,
}

impl ServiceBuffer {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(tab: Arc<ServletTab>, log: L) -> ServiceBuffer {
        let buffer_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        ServiceBuffer {
            tab,
            nodes: Vec::new(),
            pipes: Vec::new(),
            input: None,
            output: None,
            used_slots: HashSet::new(),
            allow_reuse: false,
            log: buffer_log,
        }
    }

    /// Permits the same servlet reference to back more than one node. Test
    /// harnesses only.
    #[inline]
    pub fn allow_reuse_servlet(&mut self) {
        self.allow_reuse = true;
    }

    /// Adds a node backed by the named servlet with the given
    /// instantiation arguments.
    pub fn add_node(&mut self, binary: &str, argv: &[String]) -> PipeResult<NodeId> {
        if !self.allow_reuse {
            let duplicate = self
                .nodes
                .iter()
                .any(|node| node.binary == binary && node.argv == argv);

            if duplicate {
                return Err(PipeError::InvalidArgument);
            }
        }

        let servlet = self.tab.load(binary, argv)?;
        let id = self.nodes.len() as NodeId;

        logging::debug!(self.log, "node added";
                        "context" => "add_node",
                        "binary" => binary,
                        "node" => id);

        self.nodes.push(NodeSpec {
            binary: binary.into(),
            argv: argv.to_vec(),
            servlet,
        });

        Ok(id)
    }

    fn check_port(&self, node: NodeId, port: PortId, dir: Direction) -> PipeResult<()> {
        let spec = self.nodes.get(node as usize).ok_or(PipeError::InvalidArgument)?;
        let decl = spec
            .servlet
            .ports()
            .get(port as usize)
            .ok_or(PipeError::InvalidArgument)?;

        if decl.dir != dir {
            return Err(PipeError::InvalidArgument);
        }

        Ok(())
    }

    /// Adds an edge. A port slot may appear as an endpoint of at most one
    /// edge.
    pub fn add_pipe(&mut self, desc: PipeDesc) -> PipeResult<()> {
        self.check_port(desc.src_node, desc.src_port, Direction::Output)?;
        self.check_port(desc.dst_node, desc.dst_port, Direction::Input)?;

        if self.used_slots.contains(&(desc.src_node, desc.src_port))
            || self.used_slots.contains(&(desc.dst_node, desc.dst_port))
        {
            return Err(PipeError::InvalidArgument);
        }

        self.used_slots.insert((desc.src_node, desc.src_port));
        self.used_slots.insert((desc.dst_node, desc.dst_port));
        self.pipes.push(desc);

        Ok(())
    }

    /// Designates the service entry port. Must be an input-side port.
    pub fn set_input(&mut self, node: NodeId, port: PortId) -> PipeResult<()> {
        self.check_port(node, port, Direction::Input)?;
        self.input = Some((node, port));
        Ok(())
    }

    /// Designates the service exit port. Must be an output-side port.
    pub fn set_output(&mut self, node: NodeId, port: PortId) -> PipeResult<()> {
        self.check_port(node, port, Direction::Output)?;
        self.output = Some((node, port));
        Ok(())
    }

    /// Resolves a port name on a node, optionally restricted by direction.
    pub fn resolve_port(&self, node: NodeId, name: &str, dir: Option<Direction>) -> PipeResult<PortId> {
        let spec = self.nodes.get(node as usize).ok_or(PipeError::InvalidArgument)?;

        crate::servlet::find_port(spec.servlet.ports(), name, dir)
            .ok_or(PipeError::Violation(crate::support::Violation::PortUnknown))
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
