//! The transport-module contract. A module supplies the byte-moving
//! mechanics behind pipes of its type; the handle layer dispatches every
//! pipe operation through this trait. Operations a module does not support
//! fall through to a well-defined `Unsupported` error.

pub mod registry;

pub use registry::{ModuleInstance, ModuleTab};

use crate::pipe::state::PushedState;
use crate::support::{PipeError, PipeResult};
use bedrock::logging;
use std::any::Any;
use std::ops;
use std::sync::atomic::AtomicBool;

/// Small integer code addressing a module instance. Code `0xFF` is reserved
/// for core-defined `cntl` operations and never assigned to an instance.
pub type ModuleType = u8;

pub const MODULE_TYPE_CORE: ModuleType = 0xFF;

/// Module-private payload carried by each pipe handle.
pub type HandleData = Box<dyn Any + Send>;

/// Capability bits reported by a module instance.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct ModuleFlags(u32);

impl ModuleFlags {
    pub const NONE: ModuleFlags = ModuleFlags(0x0);
    /// The instance can produce connection events; the dispatcher runs a
    /// dedicated event loop for it.
    pub const EVENT_LOOP: ModuleFlags = ModuleFlags(0x1);
    /// The instance will never pop another event.
    pub const EVENT_EXHAUSTED: ModuleFlags = ModuleFlags(0x2);

    #[inline]
    pub fn contains(self, other: ModuleFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl ops::BitOr for ModuleFlags {
    type Output = ModuleFlags;

    #[inline]
    fn bitor(self, rhs: ModuleFlags) -> ModuleFlags {
        ModuleFlags(self.0 | rhs.0)
    }
}

/// The pipe flag word. The shared bits are propagated to every companion
/// handle on deallocation; the direction bit is immutable.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct PipeFlags(u32);

impl PipeFlags {
    pub const NONE: PipeFlags = PipeFlags(0x0);
    /// Direction bit: this is the input end. Immutable for the handle's life.
    pub const INPUT: PipeFlags = PipeFlags(0x1);
    /// The module may keep the resource alive across handle death.
    pub const PERSIST: PipeFlags = PipeFlags(0x2);
    /// Egress may defer through the async loop.
    pub const ASYNC: PipeFlags = PipeFlags(0x4);
    /// This handle is a forked reader.
    pub const SHADOW: PipeFlags = PipeFlags(0x8);
    /// The owning task was cancelled before reaching this port.
    pub const DISABLED: PipeFlags = PipeFlags(0x10);
    /// Module-specific high bits.
    pub const MODULE_MASK: PipeFlags = PipeFlags(0xff00_0000);
    /// Bits propagated to all companions of a pipe resource.
    pub const SHARED_MASK: PipeFlags =
        PipeFlags(Self::PERSIST.0 | Self::ASYNC.0 | Self::DISABLED.0 | Self::MODULE_MASK.0);

    #[inline]
    pub fn contains(self, other: PipeFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: PipeFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: PipeFlags) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn masked(self, mask: PipeFlags) -> PipeFlags {
        PipeFlags(self.0 & mask.0)
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> PipeFlags {
        PipeFlags(bits)
    }
}

impl ops::BitOr for PipeFlags {
    type Output = PipeFlags;

    #[inline]
    fn bitor(self, rhs: PipeFlags) -> PipeFlags {
        PipeFlags(self.0 | rhs.0)
    }
}

/// Per-end parameters for a new pipe pair.
#[derive(Clone)]
pub struct PairParam {
    pub input_flags: PipeFlags,
    pub output_flags: PipeFlags,
    /// Typed-header size of the input end.
    pub input_header: usize,
    /// Typed-header size of the output end.
    pub output_header: usize,
    pub args: Vec<String>,
}

impl Default for PairParam {
    fn default() -> PairParam {
        PairParam {
            input_flags: PipeFlags::INPUT,
            output_flags: PipeFlags::NONE,
            input_header: 0,
            output_header: 0,
            args: Vec::new(),
        }
    }
}

/// Named, typed configuration item on a module instance.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PropertyValue {
    Int(i64),
    Str(String),
}

/// A caller-owned byte source drained by the egress path. Ownership moves
/// into the pipe layer on submission; `close` runs exactly once when the
/// source is released.
pub trait DataSource: Send {
    /// Reads up to `buffer.len()` bytes. `Ok(0)` means no bytes were
    /// produced this call; use `eos` to tell exhaustion apart from stall.
    fn read(&mut self, buffer: &mut [u8]) -> PipeResult<usize>;

    /// True once the source will never produce another byte.
    fn eos(&self) -> bool;

    /// Releases the source.
    fn close(&mut self);
}

/// The transport-module vtable. `init`, `cleanup` and `deallocate` are
/// mandatory; everything else defaults to `Unsupported` and the handle
/// layer degrades accordingly on best-effort paths.
pub trait Module: Send + Sync {
    /// Instance construction. Runs once, before the instance is published.
    fn init(&mut self, argv: &[String], log: &logging::Logger) -> PipeResult<()>;

    /// Instance teardown at shutdown.
    fn cleanup(&self) -> PipeResult<()>;

    /// The instance path, e.g. `pipe.tcp.port_8080`.
    fn get_path(&self) -> String;

    fn get_flags(&self) -> ModuleFlags {
        ModuleFlags::NONE
    }

    /// Creates a pipelined pair sharing one resource, returned as
    /// `(input, output)`.
    fn allocate(&self, hint: u32, param: &PairParam) -> PipeResult<(HandleData, HandleData)> {
        let _ = (hint, param);
        Err(PipeError::Unsupported)
    }

    /// Blocks the calling event thread until a request event arrives,
    /// returning the paired handles as `(input, output)`, or `None` once
    /// `killed` is raised. Needed iff the module is event-capable.
    fn accept(&self, param: &PairParam, killed: &AtomicBool) -> PipeResult<Option<(HandleData, HandleData)>> {
        let _ = (param, killed);
        Err(PipeError::Unsupported)
    }

    /// Releases one handle. `purge` is true only on the last surviving
    /// sibling; `error` overrides any persist policy.
    fn deallocate(&self, data: &mut HandleData, error: bool, purge: bool) -> PipeResult<()>;

    /// Non-blocking read; `Ok(0)` means no data right now, not end of
    /// stream.
    fn read(&self, data: &mut HandleData, buffer: &mut [u8]) -> PipeResult<usize> {
        let _ = (data, buffer);
        Err(PipeError::Unsupported)
    }

    /// Non-blocking write; returns the number of bytes taken.
    fn write(&self, data: &mut HandleData, bytes: &[u8]) -> PipeResult<usize> {
        let _ = (data, bytes);
        Err(PipeError::Unsupported)
    }

    /// True when the module accepts whole data sources through
    /// `write_callback`.
    fn has_write_callback(&self) -> bool {
        false
    }

    /// Accepts a byte source wholesale. Ownership transfers with the call;
    /// a failure after the transfer must be reported as `TransferFailed`.
    fn write_callback(&self, data: &mut HandleData, source: Box<dyn DataSource>) -> PipeResult<()> {
        let _ = (data, source);
        Err(PipeError::TransferFailed)
    }

    /// Zero-copy read: exposes up to `max` internally buffered bytes to
    /// `consume`, which returns how many it used; the module advances past
    /// exactly that many. Returns the consumed count, `Ok(0)` when the
    /// module cannot satisfy the request.
    fn internal_buf(
        &self,
        data: &mut HandleData,
        max: usize,
        consume: &mut dyn FnMut(&[u8]) -> usize,
    ) -> PipeResult<usize> {
        let _ = (data, max, consume);
        Err(PipeError::Unsupported)
    }

    /// Definitive end-of-stream probe; `read` returning 0 is ambiguous.
    fn has_unread_data(&self, data: &mut HandleData) -> PipeResult<bool> {
        let _ = data;
        Err(PipeError::Unsupported)
    }

    /// Returns the bytes of `buffer` past `offset` to the stream; they are
    /// served again ahead of anything still buffered. `buffer` may cover
    /// more than the last read when an end-token straddled two reads, and
    /// the module must then keep a one-time overflow copy of the excess.
    fn eom(&self, data: &mut HandleData, buffer: &[u8], offset: usize) -> PipeResult<()> {
        let _ = (data, buffer, offset);
        Err(PipeError::Unsupported)
    }

    /// Attaches user state to the pipe resource. Must not dispose any
    /// previously attached state; disposal happens in the deallocation
    /// path once no reference survives.
    fn push_state(&self, data: &mut HandleData, state: PushedState) -> PipeResult<()> {
        let _ = (data, state);
        Err(PipeError::Unsupported)
    }

    /// Reads the most recently attached user state.
    fn pop_state(&self, data: &mut HandleData) -> PipeResult<Option<PushedState>> {
        let _ = data;
        Err(PipeError::Unsupported)
    }

    /// Duplicates an input handle so the new handle delivers the same
    /// bytes the source would have delivered.
    fn fork(&self, src: &mut HandleData, args: &[String]) -> PipeResult<HandleData> {
        let _ = (src, args);
        Err(PipeError::Unsupported)
    }

    /// Module-specific control operation.
    fn cntl(&self, data: &mut HandleData, opcode: u32, arg: &mut dyn Any) -> PipeResult<()> {
        let _ = (data, opcode, arg);
        Err(PipeError::Unsupported)
    }

    fn set_property(&self, name: &str, value: PropertyValue) -> PipeResult<()> {
        let _ = (name, value);
        Err(PipeError::Unsupported)
    }

    fn get_property(&self, name: &str) -> PipeResult<PropertyValue> {
        let _ = name;
        Err(PipeError::Unsupported)
    }

    /// Invoked when the hosting event thread is being torn down.
    fn event_thread_killed(&self) {}
}
