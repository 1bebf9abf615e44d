//! Nexus CLI - Command-line interface
//!
//! Connects to one device, sends a single command or runs an interactive
//! console, and journals the session.

use anyhow::Context;
use clap::{Parser, Subcommand};
use nexus_core::cli::{format_event, format_reply, print_exit_codes, CliResult, ExitCodes, OutputFormat};
use nexus_core::core::transport::socket_id;
use nexus_core::{
    AppConfig, EventKind, Hub, InboundEvent, LogTag, SerialFlowControl, SerialParity, TcpConfig,
    Transport,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// How long `--command` waits for unsolicited serial/TCP output
const REPLY_WINDOW: Duration = Duration::from_millis(500);

/// Nexus CLI
#[derive(Parser, Debug)]
#[command(
    name = "nexus-cli",
    version,
    about = "Serial, TCP and Telnet device console",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "NEXUS_CONFIG")]
    config: Option<PathBuf>,

    /// Write diagnostics to this file instead of stderr
    #[arg(long)]
    trace_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts,

    /// Connect to a serial port
    Serial {
        /// Serial port name (e.g., COM3, /dev/ttyUSB0)
        #[arg(short, long)]
        port: String,

        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,

        /// Data bits (5-8)
        #[arg(long)]
        data_bits: Option<u8>,

        /// Parity (none, odd, even)
        #[arg(long)]
        parity: Option<String>,

        /// Stop bits (1, 2)
        #[arg(long)]
        stop_bits: Option<u8>,

        /// Flow control (none, hw, sw)
        #[arg(long)]
        flow: Option<String>,

        /// Send command and exit
        #[arg(short = 'c', long)]
        command: Option<String>,

        /// Journal file path
        #[arg(short = 'l', long)]
        log: Option<PathBuf>,
    },

    /// Connect to a raw TCP host
    Tcp {
        /// Host address
        #[arg(short = 'H', long)]
        host: String,

        /// Port number
        #[arg(short, long)]
        port: u16,

        /// Dial timeout (milliseconds)
        #[arg(long)]
        timeout: Option<u64>,

        /// Send command and exit
        #[arg(short = 'c', long)]
        command: Option<String>,

        /// Journal file path
        #[arg(short = 'l', long)]
        log: Option<PathBuf>,
    },

    /// Connect to a Telnet host
    Telnet {
        /// Host address
        #[arg(short = 'H', long)]
        host: String,

        /// Port number
        #[arg(short, long, default_value = "23")]
        port: u16,

        /// Login command sent at the password prompt
        #[arg(short = 'P', long, env = "NEXUS_TELNET_PASSWORD")]
        password: Option<String>,

        /// Send command and exit
        #[arg(short = 'c', long)]
        command: Option<String>,

        /// Journal file path
        #[arg(short = 'l', long)]
        log: Option<PathBuf>,
    },

    /// Print the exit code table
    ExitCodes,
}

/// A resolved connect request
struct Target {
    id: String,
    transport: Transport,
    command: Option<String>,
    log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_tracing(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(ExitCodes::ERROR);
        }
    };

    let result = match run(&cli).await {
        Ok(result) => result,
        Err(e) => CliResult::error(ExitCodes::ERROR, format!("{e:#}")),
    };

    match (&result, result.message()) {
        (CliResult::Error(..), Some(msg)) => eprintln!("Error: {msg}"),
        (CliResult::Success(_), Some(msg)) if !cli.quiet => eprintln!("{msg}"),
        _ => {}
    }
    result.to_exit_code()
}

fn init_tracing(cli: &Cli) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else if cli.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let Some(path) = &cli.trace_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("trace file {} has no file name", path.display()))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(AppConfig::load().unwrap_or_else(|e| {
            warn!("Using default configuration: {}", e);
            AppConfig::default()
        })),
    }
}

async fn run(cli: &Cli) -> anyhow::Result<CliResult> {
    if let Commands::ExitCodes = cli.command {
        print_exit_codes();
        return Ok(CliResult::success());
    }

    let (hub, events) = Hub::new(load_config(cli)?);

    let target = match resolve_target(cli, hub.config()) {
        Ok(Some(target)) => target,
        Ok(None) => return Ok(list_ports(cli, &hub)),
        Err(msg) => return Ok(CliResult::invalid_args(msg)),
    };

    if let Some(path) = target.log {
        hub.start_journal(Some(path)).context("failed to open journal")?;
    }

    if !cli.quiet {
        eprintln!("Connecting to {} ({})...", target.id, target.transport.kind());
    }
    if let Err(e) = hub.connect(&target.id, &target.transport).await {
        hub.stop_journal();
        return Ok(CliResult::from(&e));
    }

    let result = match &target.command {
        Some(command) => send_once(cli, &hub, events, &target.id, command).await,
        None => interactive(cli, &hub, events, &target.id).await?,
    };

    for e in hub.disconnect_all().await {
        debug!("Teardown: {}", e);
    }
    hub.stop_journal();
    Ok(result)
}

/// Build the connect request; `Ok(None)` for `list-ports`
fn resolve_target(cli: &Cli, config: &AppConfig) -> Result<Option<Target>, String> {
    let target = match &cli.command {
        Commands::ListPorts | Commands::ExitCodes => return Ok(None),
        Commands::Serial {
            port,
            baud,
            data_bits,
            parity,
            stop_bits,
            flow,
            command,
            log,
        } => {
            let mut params = config.serial.clone();
            if let Some(baud) = baud {
                params.baud_rate = *baud;
            }
            if let Some(bits) = data_bits {
                params = params.data_bits(*bits);
            }
            if let Some(bits) = stop_bits {
                params = params.stop_bits(*bits);
            }
            if let Some(parity) = parity {
                params = params.parity(parity.parse::<SerialParity>()?);
            }
            if let Some(flow) = flow {
                params = params.flow_control(parse_flow(flow)?);
            }
            Target {
                id: port.clone(),
                transport: Transport::Serial(params),
                command: command.clone(),
                log: log.clone(),
            }
        }
        Commands::Tcp {
            host,
            port,
            timeout,
            command,
            log,
        } => {
            let mut params: TcpConfig = config.tcp.clone();
            if let Some(ms) = timeout {
                params = params.timeout(Duration::from_millis(*ms));
            }
            Target {
                id: socket_id(host, *port),
                transport: Transport::Tcp(params),
                command: command.clone(),
                log: log.clone(),
            }
        }
        Commands::Telnet {
            host,
            port,
            password,
            command,
            log,
        } => {
            let mut params = config.telnet.clone();
            if let Some(password) = password {
                params = params.password(password);
            }
            Target {
                id: socket_id(host, *port),
                transport: Transport::Telnet(params),
                command: command.clone(),
                log: log.clone(),
            }
        }
    };
    Ok(Some(target))
}

fn parse_flow(flow: &str) -> Result<SerialFlowControl, String> {
    match flow.to_lowercase().as_str() {
        "none" => Ok(SerialFlowControl::None),
        "hw" | "hardware" | "rtscts" => Ok(SerialFlowControl::Hardware),
        "sw" | "software" | "xonxoff" => Ok(SerialFlowControl::Software),
        other => Err(format!("unknown flow control '{other}'")),
    }
}

fn list_ports(cli: &Cli, hub: &Hub) -> CliResult {
    let ports = hub.list_ports();

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::json!(ports)),
        OutputFormat::Text if ports.is_empty() => {
            if !cli.quiet {
                println!("No serial ports found.");
            }
        }
        OutputFormat::Text => {
            for port in &ports {
                println!("{port}");
            }
        }
    }
    CliResult::success()
}

fn print_event(cli: &Cli, event: &InboundEvent) {
    println!("{}", format_event(event, cli.format));
}

async fn send_once(
    cli: &Cli,
    hub: &Hub,
    mut events: mpsc::Receiver<InboundEvent>,
    id: &str,
    command: &str,
) -> CliResult {
    match hub.send(id, command).await {
        Ok(Some(reply)) => {
            println!("{}", format_reply(id, &reply, cli.format));
            CliResult::success()
        }
        Ok(None) => {
            let window = tokio::time::sleep(REPLY_WINDOW);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    () = &mut window => break,
                    event = events.recv() => match event {
                        Some(event) => print_event(cli, &event),
                        None => break,
                    },
                }
            }
            CliResult::success()
        }
        Err(e) => CliResult::from(&e),
    }
}

async fn interactive(
    cli: &Cli,
    hub: &Hub,
    mut events: mpsc::Receiver<InboundEvent>,
    id: &str,
) -> anyhow::Result<CliResult> {
    if !cli.quiet {
        eprintln!("Connected. Type one command per line, Ctrl+C to exit.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                hub.print(LogTag::Info, "interrupted");
                return Ok(CliResult::success());
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(CliResult::connection_failed("event channel closed"));
                };
                print_event(cli, &event);
                if event.source == id && event.kind != EventKind::Data {
                    return Ok(CliResult::connection_failed(format!("{id}: connection lost")));
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    return Ok(CliResult::success());
                };
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                match hub.send(id, line).await {
                    Ok(Some(reply)) => println!("{}", format_reply(id, &reply, cli.format)),
                    Ok(None) => {}
                    Err(e) => {
                        eprintln!("Error: {e}");
                        if !hub.is_connected(id) {
                            return Ok(CliResult::from(&e));
                        }
                    }
                }
            }
        }
    }
}
