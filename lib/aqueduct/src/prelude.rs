pub use crate::dispatch::{DispatchConfig, Dispatcher, TaskContext};
pub use crate::graph::{dump, freeze, from_reader, NodeId, PipeDesc, Service, ServiceBuffer};
pub use crate::module::{
    DataSource, Module, ModuleFlags, ModuleTab, PairParam, PipeFlags, PropertyValue,
};
pub use crate::pipe::state::PushedState;
pub use crate::pipe::{CloseStatus, Direction, Pipe};
pub use crate::servlet::{PortDecl, PortId, PortType, Servlet, ServletTab};
pub use crate::support::{CancelToken, ErrorUtils, PipeError, PipeResult, Violation};
