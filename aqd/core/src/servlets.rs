//! The built-in servlets.

use aqueduct::dispatch::TaskContext;
use aqueduct::servlet::{PortDecl, PortType, Servlet};
use aqueduct::support::PipeResult;
use bedrock::logging;
use std::thread;

/// Copies its input stream to its output unchanged.
pub struct Relay {
    ports: Vec<PortDecl>,
}

impl Relay {
    pub fn boxed() -> Box<Relay> {
        Box::new(Relay { ports: Vec::new() })
    }
}

impl Servlet for Relay {
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
        let mut buffer = [0u8; 4096];

        loop {
            let count = {
                let input = ctx.input("in")?;
                let count = input.read(&mut buffer)?;

                if count == 0 {
                    if !input.has_unread_data()? {
                        break;
                    }
                    // Data is still on its way; the stream never blocks,
                    // so back off before probing again.
                    thread::yield_now();
                    continue;
                }

                count
            };

            let mut written = 0;
            while written < count {
                written += ctx.output("out")?.write(&buffer[written..count])?;
            }
        }

        Ok(())
    }
}

/// Prefixes the stream with a tag taken from the instantiation arguments.
pub struct Annotate {
    tag: String,
    ports: Vec<PortDecl>,
}

impl Annotate {
    pub fn boxed() -> Box<Annotate> {
        Box::new(Annotate {
            tag: String::new(),
            ports: Vec::new(),
        })
    }
}

impl Servlet for Annotate {
    fn init(&mut self, argv: &[String], _log: &logging::Logger) -> PipeResult<()> {
        self.tag = argv.first().cloned().unwrap_or_else(|| "aqd".into());
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
        let prefix = format!("[{}] ", self.tag);

        {
            let output = ctx.output("out")?;
            let mut written = 0;
            while written < prefix.len() {
                written += output.write(&prefix.as_bytes()[written..])?;
            }
        }

        let mut buffer = [0u8; 4096];
        loop {
            let count = {
                let input = ctx.input("in")?;
                let count = input.read(&mut buffer)?;

                if count == 0 {
                    if !input.has_unread_data()? {
                        break;
                    }
                    thread::yield_now();
                    continue;
                }

                count
            };

            let mut written = 0;
            while written < count {
                written += ctx.output("out")?.write(&buffer[written..count])?;
            }
        }

        Ok(())
    }
}
