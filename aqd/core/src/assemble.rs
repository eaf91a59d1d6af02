//! Turns a configuration into a running server: the servlet table, the
//! module instances, the frozen service graph and the dispatcher.

use crate::config::{AqdConfig, ServiceConfig};
use crate::servlets::{Annotate, Relay};
use aqueduct::dispatch::{DispatchConfig, Dispatcher};
use aqueduct::graph::{freeze, PipeDesc, Service, ServiceBuffer};
use aqueduct::module::{Module, ModuleTab, PropertyValue};
use aqueduct::modules::mem::MemModule;
use aqueduct::modules::tcp::TcpModule;
use aqueduct::pipe::Direction;
use aqueduct::servlet::ServletTab;
use aqueduct::support::{PipeError, PipeResult};
use bedrock::logging;
use std::sync::Arc;

/// The servlet table every deployment starts from.
pub fn builtin_tab<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> ServletTab {
    let mut tab = ServletTab::new(log);

    tab.register("relay", || Relay::boxed());
    tab.register("annotate", || Annotate::boxed());

    tab
}

/// Builds the frozen service graph described by the configuration.
pub fn build_service<'a, L: Into<Option<&'a logging::Logger>>>(
    service: &ServiceConfig,
    tab: Arc<ServletTab>,
    log: L,
) -> PipeResult<Arc<Service>> {
    let mut buffer = ServiceBuffer::new(tab, log);

    let mut ids = Vec::with_capacity(service.nodes.len());
    for node in &service.nodes {
        ids.push((node.name.clone(), buffer.add_node(&node.servlet, &node.args)?));
    }

    let resolve_node = |name: &str| {
        ids.iter()
            .find(|(node_name, _)| node_name == name)
            .map(|(_, id)| *id)
            .ok_or(PipeError::InvalidArgument)
    };

    for edge in &service.edges {
        let src_node = resolve_node(&edge.src)?;
        let dst_node = resolve_node(&edge.dst)?;

        buffer.add_pipe(PipeDesc {
            src_node,
            src_port: buffer.resolve_port(src_node, &edge.src_port, Some(Direction::Output))?,
            dst_node,
            dst_port: buffer.resolve_port(dst_node, &edge.dst_port, Some(Direction::Input))?,
        })?;
    }

    let input_node = resolve_node(&service.input.node)?;
    let output_node = resolve_node(&service.output.node)?;

    buffer.set_input(
        input_node,
        buffer.resolve_port(input_node, &service.input.port, Some(Direction::Input))?,
    )?;
    buffer.set_output(
        output_node,
        buffer.resolve_port(output_node, &service.output.port, Some(Direction::Output))?,
    )?;

    freeze(buffer)
}

/// A running server.
pub struct Server {
    dispatcher: Dispatcher,
    pub tab: Arc<ModuleTab>,
    pub service: Arc<Service>,
    /// The actually bound TCP port; differs from the configured one when
    /// the configuration asked for an ephemeral port.
    pub port: u16,
}

impl Server {
    pub fn shutdown(self) {
        self.dispatcher.shutdown();
        self.tab.finalize();
    }
}

/// Boots a server: modules installed and configured, graph frozen,
/// dispatcher started.
pub fn start<'a, L: Into<Option<&'a logging::Logger>>>(config: &AqdConfig, log: L) -> PipeResult<Server> {
    let log = match log.into() {
        Some(log) => log.new(logging::o!()),
        _ => logging::Logger::root(logging::Discard, logging::o!()),
    };

    let tab = Arc::new(ModuleTab::new(config.server.max_connections * 4, &log));

    tab.install(MemModule::boxed("main"), &[])?;
    let tcp_ty = tab.install(
        TcpModule::boxed(config.server.port, config.server.max_connections, tab.page_pool()),
        &[],
    )?;

    let tcp = tab.lookup(tcp_ty)?;
    tcp.module.set_property("ttl", PropertyValue::Int(config.server.ttl_secs))?;
    tcp.module
        .set_property("persist", PropertyValue::Int(config.server.persist as i64))?;
    tcp.module
        .set_property("async_write", PropertyValue::Int(config.server.async_write as i64))?;

    let port = match tcp.module.get_property("port")? {
        PropertyValue::Int(port) => port as u16,
        _ => return Err(PipeError::InvalidArgument),
    };

    let servlets = Arc::new(builtin_tab(&log));
    let service = build_service(&config.service, servlets, &log)?;

    let dispatcher = Dispatcher::start(
        service.clone(),
        tab.clone(),
        DispatchConfig {
            workers: config.server.workers,
            ..DispatchConfig::default()
        },
        &log,
    )?;

    logging::info!(log, "server started";
                   "context" => "start",
                   "port" => port,
                   "nodes" => service.node_count());

    Ok(Server {
        dispatcher,
        tab,
        service,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::time::Duration;

    fn test_config(edges: bool) -> AqdConfig {
        let mut config = AqdConfig::default();
        config.server.port = 0;
        config.server.workers = 2;
        config.server.max_connections = 16;
        config.server.async_write = false;

        if edges {
            config.service = serdeconv::from_toml_str(
                r#"
                input = { node = "head", port = "in" }
                output = { node = "tail", port = "out" }

                [[nodes]]
                name = "head"
                servlet = "relay"

                [[nodes]]
                name = "tail"
                servlet = "annotate"
                args = ["svc"]

                [[edges]]
                src = "head"
                src_port = "out"
                dst = "tail"
                dst_port = "in"
                "#,
            )
            .unwrap();
        }

        config
    }

    #[test]
    fn test_build_service_from_config() {
        let config = test_config(true);
        let service = build_service(&config.service, Arc::new(builtin_tab(None)), None).unwrap();

        assert_eq!(service.node_count(), 2);
        assert_eq!(service.edges().len(), 1);
        assert_eq!(service.critical_info(), &[0, 1]);
    }

    #[test]
    fn test_unknown_node_name_rejected() {
        let mut config = test_config(true);
        config.service.input.node = "missing".into();

        assert_eq!(
            build_service(&config.service, Arc::new(builtin_tab(None)), None).unwrap_err(),
            PipeError::InvalidArgument
        );
    }

    fn roundtrip(port: u16, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(request).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        response
    }

    #[test]
    fn test_single_relay_server() {
        let server = start(&test_config(false), None).unwrap();

        assert_eq!(roundtrip(server.port, b"echo me"), b"echo me");

        server.shutdown();
    }

    #[test]
    fn test_two_node_pipeline_server() {
        let server = start(&test_config(true), None).unwrap();

        assert_eq!(roundtrip(server.port, b"payload"), b"[svc] payload");

        server.shutdown();
    }
}
