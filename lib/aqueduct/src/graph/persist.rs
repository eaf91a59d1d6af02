//! On-disk form of a service graph. Little-endian fixed-width integers;
//! strings are a u64 length followed by the bytes. Layout:
//! `[header][input-port-name][output-port-name][nodes][edges]` where the
//! header is node count, edge count, input node id and output node id,
//! each node is `[binary][argc][argv...]` and each edge is
//! `[src-nid][dst-nid][src-port-name][dst-port-name]`.
//!
//! Reads go through `read_exact`, which restarts on interruption and turns
//! a short read into an error, so truncated input is always reported as
//! malformed rather than silently accepted.

use crate::graph::buffer::{PipeDesc, ServiceBuffer};
use crate::graph::service::{freeze, Service};
use crate::graph::{NodeId, MAX_EDGES, MAX_NODES};
use crate::pipe::Direction;
use crate::servlet::ServletTab;
use crate::support::{PipeError, PipeResult, Violation};
use bedrock::logging;
use byteorder::{ByteOrder, LittleEndian};
use std::io::{Read, Write};
use std::sync::Arc;

const MAX_STRING: u64 = 65536;

fn write_u32<W: Write>(writer: &mut W, value: u32) -> PipeResult<()> {
    let mut buffer = [0u8; 4];
    LittleEndian::write_u32(&mut buffer, value);
    writer.write_all(&buffer).map_err(PipeError::from)
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> PipeResult<()> {
    let mut buffer = [0u8; 8];
    LittleEndian::write_u64(&mut buffer, value.len() as u64);
    writer.write_all(&buffer)?;
    writer.write_all(value.as_bytes()).map_err(PipeError::from)
}

fn read_bytes<R: Read>(reader: &mut R, buffer: &mut [u8]) -> PipeResult<()> {
    reader.read_exact(buffer).map_err(|error| {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            PipeError::Violation(Violation::Malformed)
        } else {
            PipeError::from(error)
        }
    })
}

fn read_u32<R: Read>(reader: &mut R) -> PipeResult<u32> {
    let mut buffer = [0u8; 4];
    read_bytes(reader, &mut buffer)?;
    Ok(LittleEndian::read_u32(&buffer))
}

fn read_string<R: Read>(reader: &mut R) -> PipeResult<String> {
    let mut buffer = [0u8; 8];
    read_bytes(reader, &mut buffer)?;

    let length = LittleEndian::read_u64(&buffer);
    if length > MAX_STRING {
        return Err(PipeError::Violation(Violation::Malformed));
    }

    let mut bytes = vec![0u8; length as usize];
    read_bytes(reader, &mut bytes)?;

    String::from_utf8(bytes).map_err(|_| PipeError::Violation(Violation::Malformed))
}

/// Serializes a frozen service graph.
pub fn dump<W: Write>(service: &Service, writer: &mut W) -> PipeResult<()> {
    let (input_node, input_port) = service.input_node();
    let (output_node, output_port) = service.output_node();

    write_u32(writer, service.node_count() as u32)?;
    write_u32(writer, service.edges().len() as u32)?;
    write_u32(writer, input_node)?;
    write_u32(writer, output_node)?;

    write_string(writer, &service.port_decls(input_node)[input_port as usize].name)?;
    write_string(writer, &service.port_decls(output_node)[output_port as usize].name)?;

    for node in 0..service.node_count() as NodeId {
        write_string(writer, service.node_binary(node))?;

        let argv = service.node_argv(node);
        write_u32(writer, argv.len() as u32)?;
        for arg in argv {
            write_string(writer, arg)?;
        }
    }

    for edge in service.edges() {
        write_u32(writer, edge.src_node)?;
        write_u32(writer, edge.dst_node)?;
        write_string(writer, &service.port_decls(edge.src_node)[edge.src_port as usize].name)?;
        write_string(writer, &service.port_decls(edge.dst_node)[edge.dst_port as usize].name)?;
    }

    Ok(())
}

/// Reconstructs a frozen service graph. Servlet references are resolved by
/// name through the servlet table; an edge naming a port the current
/// binary no longer defines is a load failure.
pub fn from_reader<'a, R, L>(reader: &mut R, tab: Arc<ServletTab>, log: L) -> PipeResult<Arc<Service>>
where
    R: Read,
    L: Into<Option<&'a logging::Logger>>,
{
    let node_count = read_u32(reader)? as usize;
    let edge_count = read_u32(reader)? as usize;
    let input_node = read_u32(reader)?;
    let output_node = read_u32(reader)?;

    if node_count > MAX_NODES
        || edge_count > MAX_EDGES
        || input_node as usize >= node_count
        || output_node as usize >= node_count
    {
        return Err(PipeError::Violation(Violation::Malformed));
    }

    let input_port_name = read_string(reader)?;
    let output_port_name = read_string(reader)?;

    let mut buffer = ServiceBuffer::new(tab, log);
    buffer.allow_reuse_servlet();

    for _ in 0..node_count {
        let binary = read_string(reader)?;

        let argc = read_u32(reader)?;
        if argc as usize > MAX_EDGES {
            return Err(PipeError::Violation(Violation::Malformed));
        }

        let mut argv = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            argv.push(read_string(reader)?);
        }

        buffer.add_node(&binary, &argv)?;
    }

    for _ in 0..edge_count {
        let src_node = read_u32(reader)?;
        let dst_node = read_u32(reader)?;
        let src_port_name = read_string(reader)?;
        let dst_port_name = read_string(reader)?;

        let src_port = buffer.resolve_port(src_node, &src_port_name, Some(Direction::Output))?;
        let dst_port = buffer.resolve_port(dst_node, &dst_port_name, Some(Direction::Input))?;

        buffer.add_pipe(PipeDesc {
            src_node,
            src_port,
            dst_node,
            dst_port,
        })?;
    }

    let input_port = buffer.resolve_port(input_node, &input_port_name, Some(Direction::Input))?;
    let output_port = buffer.resolve_port(output_node, &output_port_name, Some(Direction::Output))?;

    buffer.set_input(input_node, input_port)?;
    buffer.set_output(output_node, output_port)?;

    freeze(buffer)
}
