//! The pipe handle layer: the uniform I/O surface every servlet task uses,
//! independent of the transport module behind it. Every operation
//! dispatches through the module contract; the layer adds the typed-header
//! bookkeeping, the shared-flag and cancellation fan-out between companion
//! handles and the deallocation protocol.

pub mod state;

use crate::module::{
    DataSource, HandleData, Module, ModuleInstance, PairParam, PipeFlags, MODULE_TYPE_CORE,
};
use crate::support::{CancelToken, PipeError, PipeResult};
use bedrock::logging;
use state::PushedState;
use std::any::Any;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

const ZEROS: [u8; 512] = [0u8; 512];

/// Core-defined `cntl` operations. The high 8 bits of an opcode name the
/// target module; `0xFF` selects these.
pub mod cntl_op {
    pub const NOP: u32 = 0x00;
    pub const GET_FLAGS: u32 = 0x01;
    pub const SET_FLAG: u32 = 0x02;
    pub const CLR_FLAG: u32 = 0x03;
    pub const EOM: u32 = 0x04;
    pub const PUSH_STATE: u32 = 0x05;
    pub const POP_STATE: u32 = 0x06;
    pub const READ_HEADER: u32 = 0x07;
    pub const WRITE_HEADER: u32 = 0x08;
    pub const GET_PATH: u32 = 0x09;
}

/// Builds a `cntl` opcode from a module target and an operation id.
#[inline]
pub fn opcode(target: u8, op: u32) -> u32 {
    (u32::from(target) << 24) | (op & 0x00ff_ffff)
}

/// Argument block for the core end-of-message `cntl` operation.
pub struct EomArg {
    pub buffer: Vec<u8>,
    pub offset: usize,
}

/// Argument block for the core header read/write `cntl` operations. The
/// layer stores the transferred byte count back into `count`.
pub struct HeaderArg {
    pub buffer: Vec<u8>,
    pub count: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Input,
    Output,
}

/// Outcome of a `close` call. A shadow handle in hold state survives its
/// first close with only the hold bit cleared.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseStatus {
    Held,
    Closed,
}

struct CompanionSlot {
    live: bool,
    flags: PipeFlags,
    cancelled: bool,
    error: bool,
}

/// Bookkeeping shared by all handles attached to one pipe resource. The
/// slot vector replaces a linked companion ring: each handle carries an
/// index into it, and flag/cancel/error fan-out walks the live slots.
pub(crate) struct PipeShared {
    slots: Mutex<Vec<CompanionSlot>>,
}

impl PipeShared {
    fn new() -> Arc<PipeShared> {
        Arc::new(PipeShared {
            slots: Mutex::new(Vec::new()),
        })
    }

    fn attach(&self, flags: PipeFlags) -> usize {
        let mut slots = self.slots.lock().expect("Companion slots poisoned");

        slots.push(CompanionSlot {
            live: true,
            flags,
            cancelled: false,
            error: false,
        });

        slots.len() - 1
    }

    /// Number of live companions on the resource.
    fn ring_size(&self) -> usize {
        let slots = self.slots.lock().expect("Companion slots poisoned");
        slots.iter().filter(|slot| slot.live).count()
    }
}

/// One end of a pipe. The direction and owning module never change for the
/// life of the handle.
pub struct Pipe {
    instance: Arc<ModuleInstance>,
    dir: Direction,
    shared: Arc<PipeShared>,
    slot: usize,
    /// Typed-header size the port declared.
    expected_header: usize,
    /// Typed-header size on the module side; differs from `expected_header`
    /// only when a converting layer is stacked.
    actual_header: usize,
    processed_header: usize,
    touched: bool,
    hold: bool,
    accepted: bool,
    error: bool,
    data: Option<HandleData>,
    owner: Option<CancelToken>,
}

impl Pipe {
    /// Creates a pipelined pair over one shared resource.
    pub fn allocate(
        instance: &Arc<ModuleInstance>,
        hint: u32,
        param: &PairParam,
    ) -> PipeResult<(Pipe, Pipe)> {
        let (in_data, out_data) = instance.module.allocate(hint, param)?;

        Ok(Self::bind_pair(instance, param, in_data, out_data, false))
    }

    /// Blocks the calling event thread until the module produces a request
    /// event, then returns the paired handles. `None` once `killed` is
    /// raised.
    pub fn accept(
        instance: &Arc<ModuleInstance>,
        param: &PairParam,
        killed: &AtomicBool,
    ) -> PipeResult<Option<(Pipe, Pipe)>> {
        let pair = match instance.module.accept(param, killed)? {
            Some(pair) => pair,
            None => return Ok(None),
        };

        let (in_data, out_data) = pair;
        Ok(Some(Self::bind_pair(instance, param, in_data, out_data, true)))
    }

    fn bind_pair(
        instance: &Arc<ModuleInstance>,
        param: &PairParam,
        in_data: HandleData,
        out_data: HandleData,
        accepted: bool,
    ) -> (Pipe, Pipe) {
        let shared = PipeShared::new();

        let mut input_flags = param.input_flags;
        input_flags.insert(PipeFlags::INPUT);
        let mut output_flags = param.output_flags;
        output_flags.remove(PipeFlags::INPUT);

        let input = Pipe {
            instance: instance.clone(),
            dir: Direction::Input,
            slot: shared.attach(input_flags),
            shared: shared.clone(),
            expected_header: param.input_header,
            actual_header: param.input_header,
            processed_header: 0,
            touched: false,
            hold: false,
            accepted,
            error: false,
            data: Some(in_data),
            owner: None,
        };

        let output = Pipe {
            instance: instance.clone(),
            dir: Direction::Output,
            slot: shared.attach(output_flags),
            shared,
            expected_header: param.output_header,
            actual_header: param.output_header,
            processed_header: 0,
            touched: false,
            hold: false,
            accepted,
            error: false,
            data: Some(out_data),
            owner: None,
        };

        (input, output)
    }

    /// Creates a shadow input handle delivering the same bytes this handle
    /// would have delivered. The shadow starts in hold state: it rejects
    /// everything but control operations until its first close clears the
    /// hold bit.
    pub fn fork(&mut self, flags: PipeFlags, header_size: usize, args: &[String]) -> PipeResult<Pipe> {
        if self.dir != Direction::Input {
            return Err(PipeError::InvalidArgument);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        let shadow_data = self.instance.module.fork(data, args)?;

        let mut shadow_flags = flags;
        shadow_flags.insert(PipeFlags::INPUT | PipeFlags::SHADOW);

        Ok(Pipe {
            instance: self.instance.clone(),
            dir: Direction::Input,
            slot: self.shared.attach(shadow_flags),
            shared: self.shared.clone(),
            expected_header: header_size,
            actual_header: header_size,
            processed_header: 0,
            touched: false,
            hold: true,
            accepted: self.accepted,
            error: false,
            data: Some(shadow_data),
            owner: None,
        })
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.dir
    }

    #[inline]
    pub fn is_shadow(&self) -> bool {
        self.flags().contains(PipeFlags::SHADOW)
    }

    #[inline]
    pub fn is_touched(&self) -> bool {
        self.touched
    }

    /// The instance path of the module backing this pipe.
    #[inline]
    pub fn path(&self) -> &str {
        &self.instance.path
    }

    /// Assigns the task whose cancellation a disabled shadow triggers at
    /// hold release.
    #[inline]
    pub fn set_owner(&mut self, owner: CancelToken) {
        self.owner = Some(owner);
    }

    /// The current flag word, including shared bits companions propagated.
    pub fn flags(&self) -> PipeFlags {
        let slots = self.shared.slots.lock().expect("Companion slots poisoned");
        slots[self.slot].flags
    }

    pub fn set_flag(&mut self, flag: PipeFlags) -> PipeResult<()> {
        if flag.contains(PipeFlags::INPUT) {
            return Err(PipeError::InvalidArgument);
        }

        let mut slots = self.shared.slots.lock().expect("Companion slots poisoned");
        slots[self.slot].flags.insert(flag);
        Ok(())
    }

    pub fn clear_flag(&mut self, flag: PipeFlags) -> PipeResult<()> {
        if flag.contains(PipeFlags::INPUT) {
            return Err(PipeError::InvalidArgument);
        }

        let mut slots = self.shared.slots.lock().expect("Companion slots poisoned");
        slots[self.slot].flags.remove(flag);
        Ok(())
    }

    /// True once a companion signalled that the producer gave up.
    pub fn is_cancelled(&self) -> bool {
        let slots = self.shared.slots.lock().expect("Companion slots poisoned");
        slots[self.slot].cancelled
    }

    /// Marks the handle as having hit an unrecoverable transport error.
    #[inline]
    pub fn set_error(&mut self) {
        self.error = true;
    }

    /// Number of live handles attached to this pipe resource.
    #[inline]
    pub fn ring_size(&self) -> usize {
        self.shared.ring_size()
    }

    /// Typed-header size the port declared.
    #[inline]
    pub fn expected_header_size(&self) -> usize {
        self.expected_header
    }

    /// Typed-header size on the module side.
    #[inline]
    pub fn actual_header_size(&self) -> usize {
        self.actual_header
    }

    /// Silently drains the unprocessed typed-header bytes. Returns false
    /// when the module ran dry before the header completed.
    fn drain_header(&mut self) -> PipeResult<bool> {
        let mut junk = [0u8; 256];

        while self.processed_header < self.actual_header {
            let want = (self.actual_header - self.processed_header).min(junk.len());
            let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
            let got = self.instance.module.read(data, &mut junk[..want])?;

            if got == 0 {
                return Ok(false);
            }

            self.processed_header += got;
        }

        Ok(true)
    }

    /// Fills the remaining typed-header bytes with zeros. Returns false
    /// when the module would block before the header completed.
    fn fill_header(&mut self) -> PipeResult<bool> {
        while self.processed_header < self.actual_header {
            let want = (self.actual_header - self.processed_header).min(ZEROS.len());
            let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
            let took = self.instance.module.write(data, &ZEROS[..want])?;

            if took == 0 {
                return Ok(false);
            }

            self.touched = true;
            self.processed_header += took;
        }

        Ok(true)
    }

    /// Non-blocking read. Header bytes not yet processed are consumed
    /// silently first; 0 is returned while the header is still draining or
    /// no data is available, and does not imply end-of-stream.
    pub fn read(&mut self, buffer: &mut [u8]) -> PipeResult<usize> {
        if self.dir != Direction::Input || self.hold {
            return Err(PipeError::InvalidArgument);
        }

        if !self.drain_header()? {
            return Ok(0);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        match self.instance.module.read(data, buffer) {
            Ok(count) => Ok(count),
            Err(PipeError::Transport(kind)) => {
                self.error = true;
                Err(PipeError::Transport(kind))
            }
            Err(err) => Err(err),
        }
    }

    /// Non-blocking write. An unsatisfied typed header is zero-filled
    /// before any body byte goes out.
    pub fn write(&mut self, bytes: &[u8]) -> PipeResult<usize> {
        if self.dir != Direction::Output || self.hold {
            return Err(PipeError::InvalidArgument);
        }

        if !self.fill_header()? {
            return Ok(0);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        match self.instance.module.write(data, bytes) {
            Ok(count) => {
                if count > 0 {
                    self.touched = true;
                }
                Ok(count)
            }
            Err(PipeError::Transport(kind)) => {
                self.error = true;
                Err(PipeError::Transport(kind))
            }
            Err(err) => Err(err),
        }
    }

    /// Reads typed-header bytes into the caller buffer.
    pub fn read_header(&mut self, buffer: &mut [u8]) -> PipeResult<usize> {
        if self.dir != Direction::Input || self.hold {
            return Err(PipeError::InvalidArgument);
        }

        let want = buffer.len().min(self.actual_header - self.processed_header);
        if want == 0 {
            return Ok(0);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        let got = self.instance.module.read(data, &mut buffer[..want])?;
        self.processed_header += got;

        Ok(got)
    }

    /// Writes typed-header bytes. Bytes past the declared header size are
    /// not taken.
    pub fn write_header(&mut self, bytes: &[u8]) -> PipeResult<usize> {
        if self.dir != Direction::Output || self.hold {
            return Err(PipeError::InvalidArgument);
        }

        let want = bytes.len().min(self.actual_header - self.processed_header);
        if want == 0 {
            return Ok(0);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        let took = self.instance.module.write(data, &bytes[..want])?;
        if took > 0 {
            self.touched = true;
        }
        self.processed_header += took;

        Ok(took)
    }

    /// Pushes a caller-owned byte source into the egress path. Ownership of
    /// the source transfers with the call: on any failure the source has
    /// already been closed, and `TransferFailed` tells the caller that the
    /// module took it before failing.
    pub fn write_data_source(&mut self, source: Box<dyn DataSource>) -> PipeResult<()> {
        if self.dir != Direction::Output || self.hold {
            return Err(PipeError::InvalidArgument);
        }

        if !self.fill_header()? {
            // An async module takes header bytes without blocking; a module
            // that cannot finish the header now will not take a source.
            let mut source = source;
            source.close();
            return Err(PipeError::Wait);
        }

        if self.instance.module.has_write_callback() {
            let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
            let result = self.instance.module.write_callback(data, source);
            if result.is_ok() {
                self.touched = true;
            }
            return result;
        }

        // No callback support: drain the source synchronously through write
        let mut source = source;
        let mut buffer = [0u8; 4096];

        loop {
            let got = match source.read(&mut buffer) {
                Ok(count) => count,
                Err(_) => {
                    source.close();
                    return Err(PipeError::TransferFailed);
                }
            };

            if got == 0 {
                if source.eos() {
                    break;
                }
                continue;
            }

            let mut written = 0;
            while written < got {
                match self.write(&buffer[written..got]) {
                    Ok(count) => written += count,
                    Err(_) => {
                        source.close();
                        return Err(PipeError::TransferFailed);
                    }
                }
            }
        }

        source.close();
        Ok(())
    }

    /// Zero-copy read. Honored only once the declared header is fully
    /// consumed and when `min` is zero: arbitrary event boundaries inside a
    /// persistent stream preclude meaningful minimums. `consume` receives
    /// the pinned region and returns how much of it was used; the call
    /// returns that count, or 0 when the module cannot satisfy the request.
    pub fn with_internal_buf(
        &mut self,
        min: usize,
        max: usize,
        consume: &mut dyn FnMut(&[u8]) -> usize,
    ) -> PipeResult<usize> {
        if self.dir != Direction::Input || self.hold {
            return Err(PipeError::InvalidArgument);
        }

        if min != 0 {
            return Ok(0);
        }

        if !self.drain_header()? {
            return Ok(0);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        match self.instance.module.internal_buf(data, max, consume) {
            Ok(count) => Ok(count),
            Err(PipeError::Unsupported) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Definitive end-of-stream probe; `read` returning 0 is ambiguous.
    pub fn has_unread_data(&mut self) -> PipeResult<bool> {
        if self.dir != Direction::Input || self.hold {
            return Err(PipeError::InvalidArgument);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        self.instance.module.has_unread_data(data)
    }

    /// Reports an end-of-message boundary: of `buffer` only `offset` bytes
    /// belong to the current message, and `buffer[offset..]` stays
    /// available for the next read. `buffer` may span more than the last
    /// read when the end-token straddled two reads.
    pub fn eom(&mut self, buffer: &[u8], offset: usize) -> PipeResult<()> {
        if self.dir != Direction::Input || self.hold {
            return Err(PipeError::InvalidArgument);
        }

        if offset > buffer.len() {
            return Err(PipeError::InvalidArgument);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        self.instance.module.eom(data, buffer, offset)
    }

    /// Attaches user state to the pipe resource (input end only). The
    /// previously pushed state is not disposed here; disposal belongs to
    /// the deallocation path.
    pub fn push_state(&mut self, pushed: PushedState) -> PipeResult<()> {
        if self.dir != Direction::Input {
            return Err(PipeError::InvalidArgument);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        self.instance.module.push_state(data, pushed)
    }

    /// Reads the most recently pushed user state.
    pub fn pop_state(&mut self) -> PipeResult<Option<PushedState>> {
        if self.dir != Direction::Input {
            return Err(PipeError::InvalidArgument);
        }

        let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
        self.instance.module.pop_state(data)
    }

    /// Control dispatch. The high 8 bits of `opcode` name the target
    /// module: `0xFF` selects the core-defined operations below, a
    /// matching module code forwards to the module, and a mismatched code
    /// is silently ignored.
    pub fn cntl(&mut self, opcode: u32, arg: &mut dyn Any) -> PipeResult<()> {
        let target = (opcode >> 24) as u8;
        let op = opcode & 0x00ff_ffff;

        if target != MODULE_TYPE_CORE {
            if target == self.instance.type_code {
                let data = self.data.as_mut().ok_or(PipeError::InvalidArgument)?;
                return self.instance.module.cntl(data, op, arg);
            }

            return Ok(());
        }

        match op {
            cntl_op::NOP => Ok(()),
            cntl_op::GET_FLAGS => {
                let out = arg.downcast_mut::<PipeFlags>().ok_or(PipeError::InvalidArgument)?;
                *out = self.flags();
                Ok(())
            }
            cntl_op::SET_FLAG => {
                let flag = *arg.downcast_mut::<PipeFlags>().ok_or(PipeError::InvalidArgument)?;
                self.set_flag(flag)
            }
            cntl_op::CLR_FLAG => {
                let flag = *arg.downcast_mut::<PipeFlags>().ok_or(PipeError::InvalidArgument)?;
                self.clear_flag(flag)
            }
            cntl_op::EOM => {
                let eom = arg.downcast_mut::<EomArg>().ok_or(PipeError::InvalidArgument)?;
                let buffer = std::mem::replace(&mut eom.buffer, Vec::new());
                let result = self.eom(&buffer, eom.offset);
                eom.buffer = buffer;
                result
            }
            cntl_op::PUSH_STATE => {
                let slot = arg
                    .downcast_mut::<Option<PushedState>>()
                    .ok_or(PipeError::InvalidArgument)?;
                let pushed = slot.take().ok_or(PipeError::InvalidArgument)?;
                self.push_state(pushed)
            }
            cntl_op::POP_STATE => {
                let slot = arg
                    .downcast_mut::<Option<PushedState>>()
                    .ok_or(PipeError::InvalidArgument)?;
                *slot = self.pop_state()?;
                Ok(())
            }
            cntl_op::READ_HEADER => {
                let header = arg.downcast_mut::<HeaderArg>().ok_or(PipeError::InvalidArgument)?;
                let mut buffer = std::mem::replace(&mut header.buffer, Vec::new());
                let result = self.read_header(&mut buffer);
                header.buffer = buffer;
                header.count = result?;
                Ok(())
            }
            cntl_op::WRITE_HEADER => {
                let header = arg.downcast_mut::<HeaderArg>().ok_or(PipeError::InvalidArgument)?;
                let buffer = std::mem::replace(&mut header.buffer, Vec::new());
                let result = self.write_header(&buffer);
                header.buffer = buffer;
                header.count = result?;
                Ok(())
            }
            cntl_op::GET_PATH => {
                let out = arg.downcast_mut::<String>().ok_or(PipeError::InvalidArgument)?;
                *out = self.instance.path.clone();
                Ok(())
            }
            _ => Err(PipeError::Unsupported),
        }
    }

    /// Closes the handle. A shadow in hold state only drops the hold bit
    /// (cancelling its owning task if it was disabled) and stays alive;
    /// everything else runs the full deallocation protocol and reports
    /// `Closed`.
    pub fn close(&mut self) -> PipeResult<CloseStatus> {
        if self.data.is_none() {
            return Ok(CloseStatus::Closed);
        }

        // An output that was touched but never finished its typed header
        // pads zeros so the reader still observes a well-formed frame. A
        // module that cannot take the padding leaves the frame broken, so
        // the error bit is raised for the companions to inherit.
        if self.dir == Direction::Output && self.touched && self.processed_header < self.actual_header {
            match self.fill_header() {
                Ok(true) => {}
                _ => self.error = true,
            }
        }

        if self.hold {
            self.hold = false;

            let disabled = self.flags().contains(PipeFlags::DISABLED);
            if disabled {
                let mut slots = self.shared.slots.lock().expect("Companion slots poisoned");
                if !slots[self.slot].cancelled {
                    slots[self.slot].cancelled = true;
                    drop(slots);
                    if let Some(owner) = &self.owner {
                        owner.cancel();
                    }
                }
            }

            return Ok(CloseStatus::Held);
        }

        let last = {
            let mut slots = self.shared.slots.lock().expect("Companion slots poisoned");
            let live = slots.iter().filter(|slot| slot.live).count();
            let last = live == 1;
            let error = self.error || slots[self.slot].error;

            if !last {
                // A producer that gave up: an allocated output that was
                // never touched, or one that failed, cancels its readers.
                if !self.accepted && self.dir == Direction::Output && (!self.touched || error) {
                    for (index, slot) in slots.iter_mut().enumerate() {
                        if index != self.slot && slot.live && !slot.cancelled {
                            slot.cancelled = true;
                        }
                    }
                }

                let shared_bits = slots[self.slot].flags.masked(PipeFlags::SHARED_MASK);
                for (index, slot) in slots.iter_mut().enumerate() {
                    if index != self.slot && slot.live {
                        let kept = slot.flags.bits() & !PipeFlags::SHARED_MASK.bits();
                        slot.flags = PipeFlags::from_bits(kept | shared_bits.bits());
                    }
                }
            }

            // The purge decision must be made and committed atomically, or
            // two racing closers could both skip the purge.
            slots[self.slot].live = false;
            slots[self.slot].error = error;
            self.error = error;
            last
        };

        let mut data = self.data.take().ok_or(PipeError::InvalidArgument)?;
        let result = self
            .instance
            .module
            .deallocate(&mut data, self.error, last);

        if result.is_err() {
            logging::warn!(self.instance.log, "module deallocation failed";
                           "context" => "close",
                           "path" => %self.instance.path);
        }

        {
            let mut slots = self.shared.slots.lock().expect("Companion slots poisoned");

            // The error bit outlives the handle: the next surviving sibling
            // inherits it so the purge call sees the failure.
            if self.error {
                let len = slots.len();
                for step in 1..len {
                    let index = (self.slot + step) % len;
                    if slots[index].live {
                        slots[index].error = true;
                        break;
                    }
                }
            }
        }

        result.map(|_| CloseStatus::Closed)
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if self.data.is_some() {
            if let Ok(CloseStatus::Held) = self.close() {
                let _ = self.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, ModuleTab};
    use crate::modules::mem::MemModule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mem_instance() -> Arc<ModuleInstance> {
        let tab = ModuleTab::new(16, None);
        let ty = tab.install(MemModule::boxed("main"), &[]).unwrap();
        tab.lookup(ty).unwrap()
    }

    fn param(input_header: usize, output_header: usize) -> PairParam {
        PairParam {
            input_header,
            output_header,
            ..PairParam::default()
        }
    }

    #[test]
    fn test_pair_roundtrip() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        assert_eq!(output.write(b"hello").unwrap(), 5);
        assert_eq!(output.close().unwrap(), CloseStatus::Closed);

        let mut buffer = [0u8; 16];
        assert_eq!(input.read(&mut buffer).unwrap(), 5);
        assert_eq!(&buffer[..5], b"hello");
        assert!(!input.has_unread_data().unwrap());
    }

    #[test]
    fn test_unfinished_header_padded_on_close() {
        let instance = mem_instance();
        // The reader declares no header so it observes the raw frame
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 4)).unwrap();

        assert_eq!(output.write(b"abc").unwrap(), 3);
        output.close().unwrap();

        let mut buffer = [0u8; 16];
        assert_eq!(input.read(&mut buffer).unwrap(), 7);
        assert_eq!(&buffer[..7], b"\0\0\0\0abc");
    }

    #[test]
    fn test_header_consumed_silently_on_read() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(4, 4)).unwrap();

        assert_eq!(output.write_header(b"HDRX").unwrap(), 4);
        assert_eq!(output.write(b"body").unwrap(), 4);
        output.close().unwrap();

        let mut buffer = [0u8; 16];
        assert_eq!(input.read(&mut buffer).unwrap(), 4);
        assert_eq!(&buffer[..4], b"body");
    }

    #[test]
    fn test_header_read_explicitly() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(4, 4)).unwrap();

        output.write_header(b"HDRX").unwrap();
        output.write(b"body").unwrap();
        output.close().unwrap();

        let mut header = [0u8; 4];
        assert_eq!(input.read_header(&mut header).unwrap(), 4);
        assert_eq!(&header, b"HDRX");

        let mut buffer = [0u8; 16];
        assert_eq!(input.read(&mut buffer).unwrap(), 4);
        assert_eq!(&buffer[..4], b"body");
    }

    #[test]
    fn test_untouched_output_never_pads() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 4)).unwrap();

        output.close().unwrap();

        let mut buffer = [0u8; 16];
        assert_eq!(input.read(&mut buffer).unwrap(), 0);
        assert!(!input.has_unread_data().unwrap());
    }

    #[test]
    fn test_eom_returns_tail_to_stream() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        output.write(b"hello world").unwrap();
        output.close().unwrap();

        let mut buffer = [0u8; 32];
        let got = input.read(&mut buffer).unwrap();
        assert_eq!(got, 11);

        // Only the first five bytes belong to the current message
        input.eom(&buffer[..got], 5).unwrap();

        let next = input.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..next], b" world");
    }

    #[test]
    fn test_eom_buffer_spanning_two_reads() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        output.write(b"abcdef").unwrap();
        output.close().unwrap();

        let mut first = [0u8; 3];
        assert_eq!(input.read(&mut first).unwrap(), 3);
        let mut second = [0u8; 3];
        assert_eq!(input.read(&mut second).unwrap(), 3);

        // The boundary turned out to be inside the first read; the caller
        // hands back everything it holds past the boundary.
        let mut held = Vec::new();
        held.extend_from_slice(&first);
        held.extend_from_slice(&second);
        input.eom(&held, 2).unwrap();

        let mut buffer = [0u8; 16];
        let got = input.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..got], b"cdef");
    }

    #[test]
    fn test_push_state_disposes_all_on_deallocate() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        let disposed = Arc::new(AtomicUsize::new(0));

        let counter = disposed.clone();
        input
            .push_state(PushedState::with_dispose(1u8, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let counter = disposed.clone();
        input
            .push_state(PushedState::with_dispose(2u8, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        // Pushing must not dispose the previously attached state
        assert_eq!(disposed.load(Ordering::SeqCst), 0);

        let popped = input.pop_state().unwrap().unwrap();
        assert_eq!(popped.downcast_ref::<u8>(), Some(&2));
        drop(popped);

        output.close().unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 0);

        input.close().unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_propagates_from_untouched_output() {
        let instance = mem_instance();
        let (input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        assert!(!input.is_cancelled());
        output.close().unwrap();
        assert!(input.is_cancelled());
    }

    #[test]
    fn test_touched_output_does_not_cancel() {
        let instance = mem_instance();
        let (input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        output.write(b"x").unwrap();
        output.close().unwrap();
        assert!(!input.is_cancelled());
    }

    #[test]
    fn test_shared_flags_propagate_on_close() {
        let instance = mem_instance();
        let (input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        output.set_flag(PipeFlags::PERSIST).unwrap();
        output.write(b"x").unwrap();
        output.close().unwrap();

        assert!(input.flags().contains(PipeFlags::PERSIST));
        assert!(input.flags().contains(PipeFlags::INPUT));
    }

    #[test]
    fn test_shadow_hold_rejects_data_ops() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        output.write(b"payload").unwrap();
        output.close().unwrap();

        let mut shadow = input.fork(PipeFlags::NONE, 0, &[]).unwrap();
        assert!(shadow.is_shadow());

        let mut buffer = [0u8; 8];
        assert_eq!(shadow.read(&mut buffer).unwrap_err(), PipeError::InvalidArgument);

        // Control operations still work in hold state
        let mut flags = PipeFlags::NONE;
        shadow
            .cntl(opcode(MODULE_TYPE_CORE, cntl_op::GET_FLAGS), &mut flags)
            .unwrap();
        assert!(flags.contains(PipeFlags::SHADOW));

        // First close only clears the hold bit
        assert_eq!(shadow.close().unwrap(), CloseStatus::Held);

        let got = shadow.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..got], b"payload");

        assert_eq!(shadow.close().unwrap(), CloseStatus::Closed);
    }

    #[test]
    fn test_disabled_shadow_cancels_owner_at_hold_release() {
        let instance = mem_instance();
        let (mut input, _output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        let mut shadow = input.fork(PipeFlags::DISABLED, 0, &[]).unwrap();
        let owner = CancelToken::new();
        shadow.set_owner(owner.clone());

        assert!(!owner.is_cancelled());
        assert_eq!(shadow.close().unwrap(), CloseStatus::Held);
        assert!(owner.is_cancelled());
    }

    #[test]
    fn test_cntl_mismatched_module_ignored() {
        let instance = mem_instance();
        let (mut input, _output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        // Opcode targeting a module this handle does not belong to
        let mut arg = 0u32;
        assert!(input.cntl(opcode(42, 7), &mut arg).is_ok());
    }

    #[test]
    fn test_cntl_core_nop_and_path() {
        let instance = mem_instance();
        let (mut input, _output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        let mut nothing = ();
        input.cntl(opcode(MODULE_TYPE_CORE, cntl_op::NOP), &mut nothing).unwrap();

        let mut path = String::new();
        input
            .cntl(opcode(MODULE_TYPE_CORE, cntl_op::GET_PATH), &mut path)
            .unwrap();
        assert_eq!(path, "pipe.mem.main");
    }

    #[test]
    fn test_direction_checks() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        let mut buffer = [0u8; 4];
        assert_eq!(output.read(&mut buffer).unwrap_err(), PipeError::InvalidArgument);
        assert_eq!(input.write(b"x").unwrap_err(), PipeError::InvalidArgument);
        assert_eq!(
            output.push_state(PushedState::new(0u8)).unwrap_err(),
            PipeError::InvalidArgument
        );
    }

    #[test]
    fn test_ring_size_accounting() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        assert_eq!(input.ring_size(), 2);

        let mut shadow = input.fork(PipeFlags::NONE, 0, &[]).unwrap();
        assert_eq!(input.ring_size(), 3);

        shadow.close().unwrap();
        shadow.close().unwrap();
        output.write(b"x").unwrap();
        output.close().unwrap();
        assert_eq!(input.ring_size(), 1);
    }

    /// Records every deallocate call the layer makes.
    struct RecordingModule {
        calls: Arc<Mutex<Vec<(bool, bool)>>>,
    }

    impl Module for RecordingModule {
        fn init(&mut self, _argv: &[String], _log: &logging::Logger) -> PipeResult<()> {
            Ok(())
        }

        fn cleanup(&self) -> PipeResult<()> {
            Ok(())
        }

        fn get_path(&self) -> String {
            "pipe.record.main".into()
        }

        fn allocate(&self, _hint: u32, _param: &PairParam) -> PipeResult<(HandleData, HandleData)> {
            Ok((Box::new(()), Box::new(())))
        }

        fn fork(&self, _src: &mut HandleData, _args: &[String]) -> PipeResult<HandleData> {
            Ok(Box::new(()))
        }

        fn write(&self, _data: &mut HandleData, bytes: &[u8]) -> PipeResult<usize> {
            Ok(bytes.len())
        }

        fn deallocate(&self, _data: &mut HandleData, error: bool, purge: bool) -> PipeResult<()> {
            self.calls.lock().unwrap().push((error, purge));
            Ok(())
        }
    }

    fn recording_instance(calls: Arc<Mutex<Vec<(bool, bool)>>>) -> Arc<ModuleInstance> {
        let tab = ModuleTab::new(16, None);
        let ty = tab.install(Box::new(RecordingModule { calls }), &[]).unwrap();
        tab.lookup(ty).unwrap()
    }

    #[test]
    fn test_purge_only_on_last_sibling() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let instance = recording_instance(calls.clone());

        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();
        let mut shadow = input.fork(PipeFlags::NONE, 0, &[]).unwrap();

        output.write(b"x").unwrap();
        output.close().unwrap();
        shadow.close().unwrap();
        shadow.close().unwrap();
        input.close().unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[(false, false), (false, false), (false, true)]);
    }

    #[test]
    fn test_error_bit_inherited_by_purge() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let instance = recording_instance(calls.clone());

        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        output.write(b"x").unwrap();
        output.set_error();
        output.close().unwrap();
        input.close().unwrap();

        // The non-purge close reports its own error; the purge close must
        // see the inherited bit.
        let calls = calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[(true, false), (true, true)]);
    }

    #[test]
    fn test_internal_buf_zero_copy() {
        let instance = mem_instance();
        let (mut input, mut output) = Pipe::allocate(&instance, 0, &param(0, 0)).unwrap();

        output.write(b"zero copy").unwrap();
        output.close().unwrap();

        let mut seen = Vec::new();
        let consumed = input
            .with_internal_buf(0, 4, &mut |bytes: &[u8]| {
                seen.extend_from_slice(bytes);
                bytes.len()
            })
            .unwrap();

        assert_eq!(consumed, 4);
        assert_eq!(seen, b"zero");

        // A non-zero minimum is never honored
        assert_eq!(input.with_internal_buf(1, 4, &mut |b: &[u8]| b.len()).unwrap(), 0);

        let mut buffer = [0u8; 16];
        let got = input.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..got], b" copy");
    }
}
