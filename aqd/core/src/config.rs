use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 28014;

#[derive(Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub workers: usize,
    pub max_connections: usize,
    pub ttl_secs: i64,
    pub persist: bool,
    pub async_write: bool,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub servlet: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct EdgeConfig {
    pub src: String,
    pub src_port: String,
    pub dst: String,
    pub dst_port: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub input: PortRef,
    pub output: PortRef,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct AqdConfig {
    pub server: ServerConfig,
    pub service: ServiceConfig,
}

impl Default for AqdConfig {
    fn default() -> AqdConfig {
        AqdConfig {
            server: ServerConfig {
                port: DEFAULT_PORT,
                workers: 4,
                max_connections: 256,
                ttl_secs: 30,
                persist: false,
                async_write: true,
            },
            service: ServiceConfig {
                input: PortRef {
                    node: "main".into(),
                    port: "in".into(),
                },
                output: PortRef {
                    node: "main".into(),
                    port: "out".into(),
                },
                nodes: vec![NodeConfig {
                    name: "main".into(),
                    servlet: "relay".into(),
                    args: Vec::new(),
                }],
                edges: Vec::new(),
            },
        }
    }
}

impl AqdConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> AqdConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AqdConfig::default();

        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.service.nodes.len(), 1);
        assert!(config.service.edges.is_empty());
    }

    #[test]
    fn test_parse_toml() {
        let config: AqdConfig = serdeconv::from_toml_str(
            r#"
            [server]
            port = 9000
            workers = 2
            max_connections = 64
            ttl_secs = 10
            persist = true
            async_write = false

            [service]
            input = { node = "first", port = "in" }
            output = { node = "second", port = "out" }

            [[service.nodes]]
            name = "first"
            servlet = "relay"

            [[service.nodes]]
            name = "second"
            servlet = "annotate"
            args = ["tag"]

            [[service.edges]]
            src = "first"
            src_port = "out"
            dst = "second"
            dst_port = "in"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert!(config.server.persist);
        assert_eq!(config.service.nodes[1].args, vec!["tag"]);
        assert_eq!(config.service.edges.len(), 1);
        assert_eq!(config.service.output.node, "second");
    }
}
