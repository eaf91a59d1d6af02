use aqdcore::builtin_tab;
use aqueduct::graph;
use clap::{App, Arg};
use std::fs;
use std::sync::Arc;

fn main() {
    let matches = App::new("svcdump")
        .version("0.1.0")
        .about("Inspects a serialized service graph")
        .arg(
            Arg::with_name("FILE")
                .help("Path to the serialized graph")
                .required(true),
        )
        .get_matches();

    let path = matches.value_of("FILE").unwrap();
    let mut file = fs::File::open(path).expect("Error opening graph file");

    let tab = Arc::new(builtin_tab(None));
    let service = graph::from_reader(&mut file, tab, None).expect("Error loading service graph");

    let (input_node, input_port) = service.input_node();
    let (output_node, output_port) = service.output_node();

    println!("nodes: {}", service.node_count());
    println!("edges: {}", service.edges().len());
    println!(
        "entry: node {} port {}",
        input_node, service.port_decls(input_node)[input_port as usize].name
    );
    println!(
        "exit:  node {} port {}",
        output_node, service.port_decls(output_node)[output_port as usize].name
    );

    for node in 0..service.node_count() as u32 {
        let critical = if service.is_critical(node) { " [critical]" } else { "" };
        println!(
            "node {}: {} {:?}{}",
            node,
            service.node_binary(node),
            service.node_argv(node),
            critical
        );
    }

    for edge in service.edges() {
        println!(
            "pipe ({}, {}) -> ({}, {})",
            edge.src_node,
            service.port_decls(edge.src_node)[edge.src_port as usize].name,
            edge.dst_node,
            service.port_decls(edge.dst_node)[edge.dst_port as usize].name
        );
    }
}
