//! Corunner CLI Entry Point
//!
//! Runs the bundled demonstrations.
//!
//! # Usage
//!
//! ```bash
//! # Blocking invocations on N threads vs. N async invocations in one scope
//! corunner parallel --count 10000
//!
//! # Send an HTTP request and print the reply
//! corunner socket --host example.com --port 80
//!
//! # Scope configuration from a file
//! corunner parallel --config scope.yaml --workers 64
//! ```

use std::env;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use corunner::monitoring::Profiler;
use corunner::steps::{receive_from, run, send_to, ByteBuffer, Endpoint};
use corunner::{first, launch_with, Coroutine, ScopeConfig, APP_NAME, VERSION};

/// Default number of invocations per demo phase.
const DEFAULT_COUNT: usize = 1_000;

/// Size of the socket demo's request/reply buffer.
const SOCKET_BUFFER: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Demo {
    Parallel,
    Socket,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    demo: Option<Demo>,
    count: usize,
    workers: Option<usize>,
    config_path: Option<String>,
    host: String,
    port: u16,
    timeout_ms: Option<u64>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            demo: None,
            count: DEFAULT_COUNT,
            workers: None,
            config_path: None,
            host: "example.com".to_string(),
            port: 80,
            timeout_ms: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Cooperative Coroutine Runner");
    println!();
}

fn print_usage() {
    println!("Usage: corunner [OPTIONS] <DEMO>");
    println!();
    println!("Demos:");
    println!("  parallel            Blocking runs on threads vs. async runs in one scope");
    println!("  socket              Send an HTTP request and print the reply");
    println!();
    println!("Options:");
    println!("  --count N           Invocations per phase (default: {})", DEFAULT_COUNT);
    println!("  --workers N         Worker pool threads (default: CPU count)");
    println!("  --config PATH       Scope configuration file (YAML or JSON)");
    println!("  --host HOST         Socket demo host (default: example.com)");
    println!("  --port N            Socket demo port (default: 80)");
    println!("  --timeout MS        I/O deadline in milliseconds");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

/// Returns the value following option `args[*i]`.
fn option_value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    let name = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", name))
}

fn parse_number<T: std::str::FromStr>(option: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", option, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--count" => {
                config.count = parse_number("--count", option_value(args, &mut i)?)?;
            }
            "--workers" => {
                config.workers = Some(parse_number("--workers", option_value(args, &mut i)?)?);
            }
            "--config" => {
                config.config_path = Some(option_value(args, &mut i)?.to_string());
            }
            "--host" => {
                config.host = option_value(args, &mut i)?.to_string();
            }
            "--port" => {
                config.port = parse_number("--port", option_value(args, &mut i)?)?;
            }
            "--timeout" => {
                config.timeout_ms = Some(parse_number("--timeout", option_value(args, &mut i)?)?);
            }
            "parallel" if config.demo.is_none() => config.demo = Some(Demo::Parallel),
            "socket" if config.demo.is_none() => config.demo = Some(Demo::Socket),
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => return Err(format!("Unexpected argument: {}", arg)),
        }
        i += 1;
    }

    Ok(config)
}

/// Builds the scope configuration from the optional file and CLI overrides.
fn scope_config(config: &Config) -> Result<ScopeConfig, Box<dyn std::error::Error>> {
    let mut scope = match &config.config_path {
        Some(path) => {
            info!("Loading scope configuration: {}", path);
            ScopeConfig::load(path)?
        }
        None => ScopeConfig::default(),
    };

    if let Some(workers) = config.workers {
        scope = scope.with_workers(workers);
    }
    if let Some(ms) = config.timeout_ms {
        scope = scope.with_io_timeout(Duration::from_millis(ms));
    }

    scope.validate()?;
    Ok(scope)
}

/// Runs a small computation blocking on `count` threads, then `count`
/// times asynchronously in a single scope.
fn demo_parallel(count: usize, scope: ScopeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cr: Coroutine<(), ()> = first(run(|| {
        (1..=10).for_each(|i| {
            std::hint::black_box(f64::from(i).sqrt());
        })
    }));

    let mut profiler = Profiler::new("Parallel Coroutine Execution");

    let mut threads = Vec::with_capacity(count);
    for _ in 0..count {
        let cr = cr.clone();
        let scope = scope.clone();
        threads.push(thread::spawn(move || {
            launch_with(scope, |run| {
                run.blocking(&cr, ());
            })
        }));
    }
    for handle in threads {
        match handle.join() {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Threaded run failed: {}", e),
            Err(_) => warn!("Threaded run panicked"),
        }
    }
    profiler.measure(format!("{} threads", count));

    let summary = launch_with(scope, |run| {
        for _ in 0..count {
            run.spawn(&cr, ());
        }
    })?;
    profiler.measure(format!("{} coroutines", count));

    info!(
        "Async scope: {} completed on {} worker threads",
        summary.completed, summary.worker_threads
    );
    profiler.print_summary();
    Ok(())
}

/// Sends an HTTP GET to `host:port` and prints the reply.
fn demo_socket(host: &str, port: u16, scope: ScopeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server = Endpoint::new(host, port);
    let cr = first(send_to(server.clone())).then(receive_from(server));

    let request = format!(
        "GET /index.html HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        host
    );
    let mut data = ByteBuffer::with_capacity(SOCKET_BUFFER);
    data.put(request.as_bytes());

    let mut reply = None;
    launch_with(scope, |run| {
        reply = Some(run.blocking(&cr, data).into_result());
    })?;

    match reply {
        Some(Ok(buffer)) => {
            println!("RESPONSE: \n{}", buffer.to_string_lossy());
            Ok(())
        }
        Some(Err(e)) => Err(e.into()),
        None => Err("socket demo produced no reply".into()),
    }
}

/// Main application entry point.
fn run_cli() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let Some(demo) = config.demo else {
        print_usage();
        return Err("no demo selected".into());
    };

    let scope = scope_config(&config).map_err(|e| {
        error!("Invalid scope configuration: {}", e);
        e
    })?;

    match demo {
        Demo::Parallel => demo_parallel(config.count, scope),
        Demo::Socket => demo_socket(&config.host, config.port, scope),
    }
}

fn main() -> ExitCode {
    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
