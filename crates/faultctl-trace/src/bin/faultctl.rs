//! Runtime fault injection for booster daemons.
//!
//! Enables named fault points (USDT probes compiled into the target) in a
//! running process.  Timeout faults are emulated by holding the target
//! stopped; all other faults stream their handler output until Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! # Fail power-on-hour queries for one device (requires root)
//! sudo faultctl 4121 DcaGetPohFail -p /dev/nvme0n1
//!
//! # Make every CLI query hang for 30 seconds
//! sudo faultctl 4121 CliReturnTimeOut30S
//!
//! # Capture handler output as JSON lines
//! sudo faultctl --output events.jsonl 4121 DrmReturnErr DcaCreatePipeFail
//!
//! # Show the catalog
//! faultctl --list --json
//! ```

use clap::{CommandFactory, Parser};
use faultctl_fault::catalog::FaultCatalog;
use faultctl_fault::compile::{CompilationPlan, CompileError};
use faultctl_fault::plan::{ActivationPlan, TimeoutSpec};
use faultctl_fault::process::{ProcessControl, ProcessError, Procfs};
use faultctl_fault::timeout::{TimeoutConfig, TimeoutController, TimeoutReport};
use faultctl_trace::engine::{EngineConfig, LibbpfEngine, TracingEngine, BUNDLED_SOURCE, DEFAULT_PROVIDER};
use faultctl_trace::session::{load_source, ProbeSession, SessionError};
use faultctl_trace::sink::{EventSink, SinkError};
use log::info;
use snafu::Snafu;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// CLI errors for the faultctl binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("Invalid fault parameter: {source}"), context(false))]
    Compile { source: CompileError },
    #[snafu(display("{source}"), context(false))]
    Session { source: SessionError },
    #[snafu(display("Timeout emulation failed: {source}"), context(false))]
    Process { source: ProcessError },
    #[snafu(display("Event stream failed: {source}"), context(false))]
    Sink { source: SinkError },
    #[snafu(display("I/O error: {source}"), context(false))]
    Io { source: io::Error },
    #[snafu(display("JSON error: {source}"), context(false))]
    Json { source: serde_json::Error },
}

#[derive(Parser, Debug)]
#[command(name = "faultctl")]
#[command(about = "Enable USDT fault injection points in a running booster process")]
#[command(version, disable_help_flag = true)]
struct Cli {
    /// Print this help and the supported fault points.  `-h` works as
    /// the first argument only.
    #[arg(long = "help")]
    help: bool,

    /// BPF source with one handler per fault point (default: the
    /// handlers built into faultctl).
    #[arg(long, env = "FAULTCTL_SOURCE")]
    source: Option<PathBuf>,

    /// USDT provider the probes are registered under.
    #[arg(long, env = "FAULTCTL_PROVIDER", default_value = DEFAULT_PROVIDER)]
    provider: String,

    /// Compiler for the BPF source.
    #[arg(long, env = "CLANG", default_value = "clang")]
    clang: PathBuf,

    /// tracefs mount point (default: /sys/kernel/tracing, then
    /// /sys/kernel/debug/tracing).
    #[arg(long)]
    tracefs: Option<PathBuf>,

    /// Also write every handler event to this file as JSON lines.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// State poll interval while waiting for a timeout stop, in
    /// milliseconds.
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
    poll_ms: u64,

    /// Print the supported fault points and exit.
    #[arg(long)]
    list: bool,

    /// With --list, print the catalog as JSON.
    #[arg(long, requires = "list")]
    json: bool,

    /// Target process id.
    #[arg(value_name = "PID", allow_negative_numbers = true)]
    pid: Option<String>,

    /// Fault point names, each optionally followed by `-p <value>`.
    #[arg(value_name = "FAULT", trailing_var_arg = true, allow_hyphen_values = true)]
    faults: Vec<String>,
}

impl Cli {
    /// Parse `args` (program name first).  A leading `-h` asks for help;
    /// anywhere else it is just another fault token.
    fn parse_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        if args.get(1).is_some_and(|a| a == "-h") {
            args[1] = OsString::from("--help");
        }
        Self::try_parse_from(args)
    }

    /// The instrumentation source text: `--source` if given, otherwise
    /// the bundled handlers.
    fn instrumentation(&self) -> Result<String, SessionError> {
        match self.source {
            Some(ref path) => load_source(path),
            None => Ok(BUNDLED_SOURCE.to_string()),
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            clang: self.clang.clone(),
            provider: self.provider.clone(),
            tracefs: self.tracefs.clone(),
            ..Default::default()
        }
    }
}

/// What the command line asks for, decided before any setup work.
#[derive(Debug, PartialEq)]
enum Action {
    Usage { status: u8, reason: Option<String> },
    List,
    Run { pid: u32, plan: ActivationPlan },
}

fn decide(cli: &Cli, catalog: &FaultCatalog) -> Action {
    if cli.help {
        return Action::Usage { status: 0, reason: None };
    }
    if cli.list {
        return Action::List;
    }
    let Some(raw) = cli.pid.as_deref() else {
        return Action::Usage { status: 0, reason: None };
    };
    let pid = match raw.parse::<u32>() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            return Action::Usage {
                status: 1,
                reason: Some(format!("Invalid or missing PID: {raw:?}")),
            }
        }
    };
    if cli.faults.is_empty() {
        return Action::Usage { status: 0, reason: None };
    }
    match ActivationPlan::parse(&cli.faults, catalog) {
        Ok(plan) => Action::Run { pid, plan },
        Err(e) => Action::Usage {
            status: 1,
            reason: Some(e.to_string()),
        },
    }
}

fn usage(catalog: &FaultCatalog) -> String {
    let mut text = Cli::command().render_help().to_string();
    text.push_str("\nsupported fault injection functions:\n");
    for def in catalog.list_all() {
        text.push_str(&format!(" - {def}\n"));
    }
    text
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let catalog = FaultCatalog::builtin();

    let cli = match Cli::parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}");
            print!("{}", usage(&catalog));
            return ExitCode::FAILURE;
        }
    };

    let result = match decide(&cli, &catalog) {
        Action::Usage { status, reason } => {
            if let Some(reason) = reason {
                eprintln!("{reason}");
            }
            print!("{}", usage(&catalog));
            return ExitCode::from(status);
        }
        Action::List => cmd_list(&catalog, cli.json),
        Action::Run { pid, plan } => cmd_run(&cli, &catalog, pid, &plan),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_list(catalog: &FaultCatalog, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(catalog.list_all())?);
    } else {
        for def in catalog.list_all() {
            println!(" - {def}");
        }
    }
    Ok(())
}

fn cmd_run(cli: &Cli, catalog: &FaultCatalog, pid: u32, plan: &ActivationPlan) -> Result<(), CliError> {
    let build = CompilationPlan::build(plan, catalog)?;
    for m in &build.macros {
        info!("Parameter for {}: {}", m.fault_name, m.literal_value);
    }
    let source = cli.instrumentation()?;

    let engine = LibbpfEngine::new(cli.engine_config());
    let mut session = ProbeSession::open(engine, &source, &build.macros, pid)?;
    for attachment in session.attach(&build.probes)? {
        println!(
            "Enabled probe: {} for function: {}",
            attachment.probe_id, attachment.source_fault_name
        );
    }

    let timeout = plan.timeout_spec(catalog);
    let mut capture: Option<Box<dyn Write>> = None;
    if timeout.is_some() {
        ctrlc_simple();
    } else if let Some(ref path) = cli.output {
        capture = Some(Box::new(LineWriter::new(File::create(path)?)));
        info!("Capturing events to {}", path.display());
    }

    // The session stays open until serve returns; dropping it detaches.
    let finished = serve(
        &mut session,
        timeout.as_ref(),
        Procfs::new(),
        Duration::from_millis(cli.poll_ms),
        &CANCELLED,
        io::stdout().lock(),
        capture,
    )?;
    match finished {
        Finished::Timeout(report) => {
            println!("Exiting... ({}, {} stop(s) serviced)", report.reason, report.cycles)
        }
        Finished::Sink(n) => info!("Trace stream closed after {n} event(s)"),
    }
    Ok(())
}

/// The terminal loop a run ended in.
#[derive(Debug, PartialEq, Eq)]
enum Finished {
    Timeout(TimeoutReport),
    Sink(u64),
}

/// Run the timeout controller when `timeout` is set, otherwise stream the
/// session's events to `out`.  Exactly one of the two loops runs.
fn serve<E, P, W>(
    session: &mut ProbeSession<E>,
    timeout: Option<&TimeoutSpec>,
    process: P,
    poll_interval: Duration,
    cancel: &AtomicBool,
    out: W,
    capture: Option<Box<dyn Write>>,
) -> Result<Finished, CliError>
where
    E: TracingEngine,
    P: ProcessControl,
    W: Write,
{
    match timeout {
        Some(spec) => {
            println!("Timeout injection probe enabled ({}). Monitoring process state...", spec.fault_name);
            let mut config = TimeoutConfig::for_spec(session.pid(), spec);
            config.poll_interval = poll_interval;
            let report = TimeoutController::new(config, process).run(cancel)?;
            Ok(Finished::Timeout(report))
        }
        None => {
            let events = session.events()?;
            let mut sink = EventSink::new(out);
            if let Some(capture) = capture {
                sink = sink.with_capture(capture);
            }
            println!("Start USDT tracing (standard mode)...");
            Ok(Finished::Sink(sink.drain(events)?))
        }
    }
}

/// Set by SIGINT/SIGTERM while the timeout controller runs.
static CANCELLED: AtomicBool = AtomicBool::new(false);

/// Minimal signal handler without pulling in the ctrlc crate.
fn ctrlc_simple() {
    extern "C" fn handler(_: libc::c_int) {
        CANCELLED.store(true, Ordering::Relaxed);
    }

    let h = handler as *const () as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, h);
        libc::signal(libc::SIGTERM, h);
    }
}
