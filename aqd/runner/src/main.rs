use aqdcore::{builtin_tab, start, AqdConfig};
use aqueduct::graph;
use bedrock::logging;
use clap::{App, Arg};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TIMER_FLUSH_SECS: u64 = 60;

fn main() {
    let matches = App::new("aqd")
        .version("0.1.0")
        .about("Dataflow service daemon")
        .arg(
            Arg::with_name("CONFIG")
                .help("Path to the server configuration file")
                .required(true),
        )
        .arg(
            Arg::with_name("dump")
                .long("dump")
                .takes_value(true)
                .help("Serialize the service graph to the given file and exit"),
        )
        .arg(
            Arg::with_name("logging")
                .long("logging")
                .takes_value(true)
                .help("Path to a logging configuration file"),
        )
        .get_matches();

    let log = match matches.value_of("logging") {
        Some(path) => logging::init_from_file(path),
        None => logging::init(),
    };

    let config = AqdConfig::load(matches.value_of("CONFIG").unwrap());

    if let Some(dump_path) = matches.value_of("dump") {
        let tab = Arc::new(builtin_tab(&log));
        let service = aqdcore::assemble::build_service(&config.service, tab, &log)
            .expect("Error building service graph");

        let mut file = fs::File::create(dump_path).expect("Error creating dump file");
        graph::dump(&service, &mut file).expect("Error serializing service graph");

        logging::info!(log, "service graph dumped"; "context" => "main", "path" => dump_path);
        return;
    }

    let server = start(&config, &log).expect("Error starting server");

    logging::info!(log, "serving"; "context" => "main", "port" => server.port);

    // The dispatcher owns every thread that does work; the main thread
    // only surfaces the per-node timings now and then.
    loop {
        thread::sleep(Duration::from_secs(TIMER_FLUSH_SECS));
        server.service.flush_timers();
    }
}
