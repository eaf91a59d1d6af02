//! The service-graph model: the builder servlets are assembled into, the
//! validated immutable graph the dispatcher consumes, and the on-disk
//! serialization between them.

pub mod buffer;
pub mod persist;
pub mod service;

pub use buffer::{PipeDesc, ServiceBuffer};
pub use persist::{dump, from_reader};
pub use service::{freeze, ProfMark, Service};

/// Node index within one service graph.
pub type NodeId = u32;

/// Implementation-defined size ceilings, checked at freeze time.
pub const MAX_NODES: usize = 1024;
pub const MAX_EDGES: usize = 4096;
