//! The servlet contract: an executable unit plugged in as a graph node,
//! exposing named input and output ports. The servlet table maps servlet
//! names to factories so serialized graphs can reconstruct their nodes.

use crate::dispatch::TaskContext;
use crate::pipe::Direction;
use crate::support::{PipeError, PipeResult};
use bedrock::logging;
use indexmap::IndexMap;

/// Port slot id within one node.
pub type PortId = u32;

/// The concrete type of a port: a name and the typed-header byte length
/// statically implied by it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortType {
    pub name: String,
    pub header_size: usize,
}

impl PortType {
    #[inline]
    pub fn new(name: &str, header_size: usize) -> PortType {
        PortType {
            name: name.into(),
            header_size,
        }
    }

    /// The wildcard type: accepts anything, carries no typed header until
    /// propagation resolves it.
    #[inline]
    pub fn untyped() -> PortType {
        PortType {
            name: "*".into(),
            header_size: 0,
        }
    }

    #[inline]
    pub fn is_untyped(&self) -> bool {
        self.name == "*"
    }

    /// Assignment compatibility: this (destination) type accepts the given
    /// source type.
    #[inline]
    pub fn accepts(&self, src: &PortType) -> bool {
        self.is_untyped() || self.name == src.name
    }
}

#[derive(Clone, Debug)]
pub struct PortDecl {
    pub name: String,
    pub dir: Direction,
    pub ty: PortType,
}

impl PortDecl {
    #[inline]
    pub fn input(name: &str, ty: PortType) -> PortDecl {
        PortDecl {
            name: name.into(),
            dir: Direction::Input,
            ty,
        }
    }

    #[inline]
    pub fn output(name: &str, ty: PortType) -> PortDecl {
        PortDecl {
            name: name.into(),
            dir: Direction::Output,
            ty,
        }
    }
}

/// A graph node implementation. `init` runs once per node instance and
/// fixes the port declarations; `exec` runs once per request task with the
/// node's pipes bound into the context.
pub trait Servlet: Send {
    fn init(&mut self, argv: &[String], log: &logging::Logger) -> PipeResult<()>;

    /// The ports declared by `init`, indexed by `PortId`.
    fn ports(&self) -> &[PortDecl];

    fn exec(&mut self, ctx: &mut TaskContext) -> PipeResult<()>;

    /// Invoked at graph freeze when type propagation resolves one of this
    /// servlet's wildcard ports to a concrete type.
    fn type_resolved(&mut self, port: PortId, ty: &PortType) -> PipeResult<()> {
        let _ = (port, ty);
        Ok(())
    }
}

/// Finds a declared port by name, optionally restricted to a direction.
pub fn find_port(decls: &[PortDecl], name: &str, dir: Option<Direction>) -> Option<PortId> {
    decls
        .iter()
        .position(|decl| decl.name == name && dir.map(|d| d == decl.dir).unwrap_or(true))
        .map(|index| index as PortId)
}

type ServletFactory = Box<dyn Fn() -> Box<dyn Servlet> + Send + Sync>;

/// Name-indexed registry of servlet factories. Graph construction and the
/// serialized-graph load path both resolve servlet references through it.
pub struct ServletTab {
    factories: IndexMap<String, ServletFactory>,
    log: logging::Logger,
}

impl ServletTab {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> ServletTab {
        let tab_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        ServletTab {
            factories: IndexMap::new(),
            log: tab_log,
        }
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Servlet> + Send + Sync + 'static,
    {
        logging::debug!(self.log, "servlet registered"; "context" => "register", "name" => name);
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Instantiates and initializes a servlet by name.
    pub fn load(&self, name: &str, argv: &[String]) -> PipeResult<Box<dyn Servlet>> {
        let factory = self.factories.get(name).ok_or(PipeError::InvalidArgument)?;

        let mut servlet = factory();
        servlet.init(argv, &self.log)?;

        Ok(servlet)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        ports: Vec<PortDecl>,
    }

    impl Servlet for Probe {
        fn init(&mut self, _argv: &[String], _log: &logging::Logger) -> PipeResult<()> {
            self.ports = vec![
                PortDecl::input("in", PortType::untyped()),
                PortDecl::output("out", PortType::new("text/plain", 0)),
            ];
            Ok(())
        }

        fn ports(&self) -> &[PortDecl] {
            &self.ports
        }

        fn exec(&mut self, _ctx: &mut TaskContext) -> PipeResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_port_type_compatibility() {
        let untyped = PortType::untyped();
        let text = PortType::new("text/plain", 0);
        let blob = PortType::new("blob", 8);

        assert!(untyped.accepts(&text));
        assert!(untyped.accepts(&untyped));
        assert!(text.accepts(&text));
        assert!(!text.accepts(&blob));
        assert!(!blob.accepts(&untyped));
    }

    #[test]
    fn test_tab_load() {
        let mut tab = ServletTab::new(None);
        tab.register("probe", || Box::new(Probe { ports: Vec::new() }));

        let servlet = tab.load("probe", &[]).unwrap();
        assert_eq!(servlet.ports().len(), 2);

        match tab.load("missing", &[]) {
            Err(err) => assert_eq!(err, PipeError::InvalidArgument),
            Ok(_) => panic!("expected PipeError::InvalidArgument"),
        }
    }

    #[test]
    fn test_find_port() {
        let decls = vec![
            PortDecl::input("in", PortType::untyped()),
            PortDecl::output("out", PortType::untyped()),
        ];

        assert_eq!(find_port(&decls, "in", Some(Direction::Input)), Some(0));
        assert_eq!(find_port(&decls, "out", Some(Direction::Output)), Some(1));
        assert_eq!(find_port(&decls, "out", Some(Direction::Input)), None);
        assert_eq!(find_port(&decls, "gone", None), None);
    }
}
