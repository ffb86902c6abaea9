//! Purpose: `calltrace-service` entry point: run the trace service or ask a running one to stop.
//! Role: Binary crate root; parses args, installs logging and signal handling, maps errors to exit codes.
//! Invariants: Exit code is 0 on clean shutdown and `api::to_exit_code` of the failure otherwise.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

use calltrace::api::{
    DEFAULT_FLAGS, Error, ErrorKind, Service, ServiceConfig, ServiceCore, TRACE_FLAG_EXIT,
    request_shutdown_at, to_exit_code,
};
use calltrace::config::{DEFAULT_BUFFER_SIZE, DEFAULT_GROWTH_INCREMENT, default_endpoint};

#[derive(Parser)]
#[command(
    name = "calltrace-service",
    version,
    about = "Collects call traces from instrumented processes into per-client trace files",
    long_about = None,
    after_help = r#"EXAMPLES
  $ calltrace-service start --trace-dir /var/tmp/traces
  $ calltrace-service --instance-id ci start --enable-exits
  $ calltrace-service --instance-id ci stop"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        help = "Socket path clients connect to (default: <temp>/calltrace-service.sock)",
        value_hint = ValueHint::FilePath,
        conflicts_with = "instance_id"
    )]
    endpoint: Option<PathBuf>,
    #[arg(long, help = "Run a separately named instance (calltrace-service-<ID>.sock)")]
    instance_id: Option<String>,
    #[arg(long, short, help = "Log at debug level regardless of RUST_LOG")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run the service until a shutdown is requested")]
    Start(StartArgs),
    #[command(about = "Ask the running service to shut down")]
    Stop,
}

#[derive(Args)]
struct StartArgs {
    #[arg(
        long,
        default_value = ".",
        help = "Directory that receives trace files",
        value_hint = ValueHint::DirPath
    )]
    trace_dir: PathBuf,
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE, help = "Bytes per buffer (minimum 1 MiB)")]
    buffer_size: usize,
    #[arg(
        long,
        default_value_t = DEFAULT_GROWTH_INCREMENT,
        help = "Buffers added per pool allocation (minimum 16)"
    )]
    growth_increment: usize,
    #[arg(long, help = "Also trace function exits")]
    enable_exits: bool,
    #[arg(long, value_parser = parse_flags, help = "Raw capability flag word, e.g. 0x21")]
    flags: Option<u32>,
}

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let code = if err.kind() == ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `calltrace-service --help` for usage."));
            }
        },
    };
    init_tracing(cli.verbose);

    let endpoint = match (&cli.endpoint, &cli.instance_id) {
        (Some(path), _) => path.clone(),
        (None, instance) => default_endpoint(instance.as_deref()),
    };
    match cli.command {
        Command::Start(args) => {
            let mut flags = args.flags.unwrap_or(DEFAULT_FLAGS);
            if args.enable_exits {
                flags |= TRACE_FLAG_EXIT;
            }
            let config = ServiceConfig::new()
                .with_trace_dir(args.trace_dir)
                .with_buffer_size(args.buffer_size)
                .with_growth_increment(args.growth_increment)
                .with_flags(flags)
                .with_endpoint(endpoint);
            run_service(config)?;
            Ok(0)
        }
        Command::Stop => {
            request_shutdown_at(&endpoint)?;
            info!(endpoint = %endpoint.display(), "shutdown requested");
            Ok(0)
        }
    }
}

fn run_service(config: ServiceConfig) -> Result<(), Error> {
    if !config.trace_dir().is_dir() {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("trace directory does not exist")
            .with_path(config.trace_dir()));
    }
    let mut service = Service::new(config);
    let signals = install_signal_handler(Arc::clone(service.core()))?;
    let result = service.start(false);
    signals.close();
    result
}

/// Turns SIGINT/SIGTERM into a shutdown request.
fn install_signal_handler(core: Arc<ServiceCore>) -> Result<signal_hook::iterator::Handle, Error> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to install signal handler")
            .with_source(err)
    })?;
    let handle = signals.handle();
    thread::Builder::new()
        .name("calltrace-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "signal received");
                core.request_shutdown();
            }
        })
        .map_err(|err| {
            Error::new(ErrorKind::Resource)
                .with_message("failed to start signal thread")
                .with_source(err)
        })?;
    Ok(handle)
}

fn clap_error_summary(err: &clap::Error) -> String {
    err.to_string()
        .lines()
        .next()
        .map(|line| line.trim_start_matches("error: ").trim().to_string())
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn parse_flags(value: &str) -> Result<u32, String> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|_| format!("invalid flag word: {value}"))
}

fn init_tracing(verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    err.message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", err.kind()))
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }
    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(path) = err.path() {
        lines.push(format!("  path: {}", path.display()));
    }
    for cause in error_causes(err) {
        lines.push(format!("  caused by: {cause}"));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    lines.join("\n")
}
