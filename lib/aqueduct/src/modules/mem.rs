//! The in-memory transport module: pipelined pairs over a shared byte
//! stream. This is the default carrier for interior graph edges, so it
//! carries the full read-side surface: end-of-message pushback, zero-copy
//! access, shadow forks and pushed state.

use crate::module::{HandleData, Module, PairParam, PropertyValue};
use crate::pipe::state::PushedState;
use crate::support::{PipeError, PipeResult};
use bedrock::logging;
use std::sync::{Arc, Mutex};

/// The stream shared by all handles of one pair. The byte log is append
/// only; every reader keeps its own cursor, which is what makes shadow
/// forks and end-of-message rewinds cheap.
struct MemStream {
    data: Vec<u8>,
    eos: bool,
    states: Vec<PushedState>,
}

struct MemHandle {
    stream: Arc<Mutex<MemStream>>,
    cursor: usize,
    input: bool,
}

pub struct MemModule {
    discriminator: String,
}

impl MemModule {
    pub fn boxed(discriminator: &str) -> Box<MemModule> {
        Box::new(MemModule {
            discriminator: discriminator.into(),
        })
    }

    fn handle<'a>(data: &'a mut HandleData) -> PipeResult<&'a mut MemHandle> {
        data.downcast_mut::<MemHandle>().ok_or(PipeError::InvalidArgument)
    }
}

impl Module for MemModule {
    fn init(&mut self, argv: &[String], _log: &logging::Logger) -> PipeResult<()> {
        if let Some(discriminator) = argv.first() {
            self.discriminator = discriminator.clone();
        }

        Ok(())
    }

    fn cleanup(&self) -> PipeResult<()> {
        Ok(())
    }

    fn get_path(&self) -> String {
        format!("pipe.mem.{}", self.discriminator)
    }

    fn allocate(&self, _hint: u32, _param: &PairParam) -> PipeResult<(HandleData, HandleData)> {
        let stream = Arc::new(Mutex::new(MemStream {
            data: Vec::new(),
            eos: false,
            states: Vec::new(),
        }));

        let input = MemHandle {
            stream: stream.clone(),
            cursor: 0,
            input: true,
        };
        let output = MemHandle {
            stream,
            cursor: 0,
            input: false,
        };

        Ok((Box::new(input), Box::new(output)))
    }

    fn deallocate(&self, data: &mut HandleData, _error: bool, purge: bool) -> PipeResult<()> {
        let handle = Self::handle(data)?;
        let mut stream = handle.stream.lock().expect("Mem stream poisoned");

        if !handle.input {
            stream.eos = true;
        }

        if purge {
            stream.states.clear();
        }

        Ok(())
    }

    fn read(&self, data: &mut HandleData, buffer: &mut [u8]) -> PipeResult<usize> {
        let handle = Self::handle(data)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        let stream = handle.stream.lock().expect("Mem stream poisoned");
        let pending = &stream.data[handle.cursor..];
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

        let mut stream = handle.stream.lock().expect("Mem stream poisoned");
        stream.data.extend_from_slice(bytes);

        Ok(bytes.len())
    }

    fn internal_buf(
        &self,
        data: &mut HandleData,
        max: usize,
        consume: &mut dyn FnMut(&[u8]) -> usize,
    ) -> PipeResult<usize> {
        let handle = Self::handle(data)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        let stream = handle.stream.lock().expect("Mem stream poisoned");
        let pending = &stream.data[handle.cursor..];

        if pending.is_empty() {
            return Ok(0);
        }

        let exposed = pending.len().min(max);
        let used = consume(&pending[..exposed]);

        if used > exposed {
            return Err(PipeError::InvalidArgument);
        }

        handle.cursor += used;
        Ok(used)
    }

    fn has_unread_data(&self, data: &mut HandleData) -> PipeResult<bool> {
        let handle = Self::handle(data)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        let stream = handle.stream.lock().expect("Mem stream poisoned");
        Ok(handle.cursor < stream.data.len() || !stream.eos)
    }

    fn eom(&self, data: &mut HandleData, buffer: &[u8], offset: usize) -> PipeResult<()> {
        let handle = Self::handle(data)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        // Everything the caller holds past the boundary is re-served: the
        // byte log is retained, so this is a cursor rewind no matter how
        // many reads the returned span covered.
        let returned = buffer.len() - offset;
        if returned > handle.cursor {
            return Err(PipeError::InvalidArgument);
        }

        handle.cursor -= returned;
        Ok(())
    }

    fn push_state(&self, data: &mut HandleData, state: PushedState) -> PipeResult<()> {
        let handle = Self::handle(data)?;
        let mut stream = handle.stream.lock().expect("Mem stream poisoned");

        stream.states.push(state);
        Ok(())
    }

    fn pop_state(&self, data: &mut HandleData) -> PipeResult<Option<PushedState>> {
        let handle = Self::handle(data)?;
        let stream = handle.stream.lock().expect("Mem stream poisoned");

        Ok(stream.states.last().cloned())
    }

    fn fork(&self, src: &mut HandleData, _args: &[String]) -> PipeResult<HandleData> {
        let handle = Self::handle(src)?;
        if !handle.input {
            return Err(PipeError::InvalidArgument);
        }

        Ok(Box::new(MemHandle {
            stream: handle.stream.clone(),
            cursor: handle.cursor,
            input: true,
        }))
    }

    fn get_property(&self, name: &str) -> PipeResult<PropertyValue> {
        match name {
            "discriminator" => Ok(PropertyValue::Str(self.discriminator.clone())),
            _ => Err(PipeError::Unsupported),
        }
    }
}
