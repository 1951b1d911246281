use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use getopts::Options;
use log::LevelFilter;

use compass::dns::config::ServerConfig;
use compass::dns::context::ServerContext;
use compass::dns::logging::{CompassLogger, LoggerConfig};
use compass::dns::server::{DnsServer, DnsUdpServer};

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Main entry point for the Compass DNS server
fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt(
        "c",
        "config",
        "Path to the configuration file (default config.json)",
        "FILE",
    );
    opts.optflag(
        "d",
        "",
        "Log at INFO level; give twice (-dd) for DEBUG",
    );

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let config_path = opt_matches
        .opt_str("c")
        .unwrap_or_else(|| "config.json".to_string());
    let config = match ServerConfig::from_file(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {}", config_path, e);
            process::exit(1);
        }
    };

    let level = match opt_matches.opt_count("d") {
        0 | 1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    let logger_config = LoggerConfig {
        level,
        console_output: true,
        file_output: config.log_file.as_ref().map(PathBuf::from),
    };
    if let Err(e) = CompassLogger::init(logger_config) {
        eprintln!("failed to initialize logger: {}", e);
        process::exit(1);
    }

    let context = match ServerContext::from_config(&config) {
        Ok(context) => Arc::new(context),
        Err(e) => {
            log::error!("failed to start: {}", e);
            process::exit(1);
        }
    };

    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, context.shutdown.clone()) {
            log::error!("failed to register signal handler: {}", e);
            process::exit(1);
        }
    }

    // SIGHUP reloads the override rules without a restart
    let reload_requested = Arc::new(AtomicBool::new(false));
    if let Err(e) =
        signal_hook::flag::register(signal_hook::consts::SIGHUP, reload_requested.clone())
    {
        log::error!("failed to register signal handler: {}", e);
        process::exit(1);
    }

    let workers = context.workers;
    let server = DnsUdpServer::new(context.clone(), workers);
    if let Err(e) = server.run_server() {
        log::error!("failed to start dns server: {}", e);
        process::exit(1);
    }

    log::info!(
        "compass dns started on {} (upstream {})",
        context.local_addr,
        context.upstream_addr
    );

    while !context.is_shutdown() {
        if reload_requested.swap(false, Ordering::AcqRel) {
            match context.overrides.reload() {
                Ok(()) => log::info!("override rules reloaded"),
                Err(e) => log::error!("failed to reload override rules: {}", e),
            }
        }
        thread::sleep(Duration::from_millis(200));
    }

    log::info!(
        "shutting down after {} queries ({} cache hits, {} forwarded)",
        context.statistics.get_query_count(),
        context.statistics.get_cache_hits(),
        context.statistics.get_upstream_queries()
    );

    // grace period for workers to finish in-flight queries
    thread::sleep(Duration::from_secs(1));
}
