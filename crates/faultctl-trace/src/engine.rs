//! Tracing engine backends.
//!
//! [`TracingEngine`] is the seam between the probe session and whatever
//! actually builds and loads BPF code.  [`LibbpfEngine`] compiles the
//! instrumentation source with an external `clang` (parameter macros are
//! passed as `-D` flags), loads the object through libbpf and attaches one
//! handler program per fault point to the target's USDT probe.
//!
//! Requires `CAP_SYS_ADMIN` (root) for loading and attaching.

use faultctl_fault::compile::{MacroDefinition, ProbeRequest};
use libbpf_rs::{Link, Object, ObjectBuilder};
use log::{debug, info};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to prepare build directory: {0}")]
    Workspace(#[source] io::Error),

    #[error("Failed to run {clang}: {source}")]
    ClangSpawn {
        clang: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Instrumentation compile failed ({status}):\n{stderr}")]
    Compile { status: String, stderr: String },

    #[error("Failed to open BPF object: {0}")]
    Open(#[source] libbpf_rs::Error),

    #[error("Failed to load BPF programs: {0}")]
    Load(#[source] libbpf_rs::Error),

    #[error("Instrumentation has not been compiled")]
    NotCompiled,

    #[error("No handler program named '{0}' in the instrumentation")]
    HandlerNotFound(String),

    #[error("Failed to attach '{handler}' to USDT probe {provider}:{probe} in process {pid}: {source}")]
    Attach {
        handler: String,
        provider: String,
        probe: String,
        pid: u32,
        #[source]
        source: libbpf_rs::Error,
    },

    #[error("No tracefs mount found (tried {0:?})")]
    NoTracefs(Vec<PathBuf>),

    #[error("Failed to open trace pipe {path}: {source}")]
    TracePipe {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ═══════════════════════════════════════════════════════════════════════
//  Engine trait
// ═══════════════════════════════════════════════════════════════════════

/// Operations the probe session needs from a tracing engine.
pub trait TracingEngine {
    /// Keeps one probe attached while alive.
    type Link;
    /// Line-oriented trace output.
    type Events: io::BufRead;

    /// Build `source` with `macros` defined and make its programs ready
    /// for attachment.
    fn compile(&mut self, source: &str, macros: &[MacroDefinition]) -> Result<(), EngineError>;

    /// Bind the handler for `probe` to its USDT probe inside `pid`.
    fn attach(&mut self, pid: u32, probe: &ProbeRequest) -> Result<Self::Link, EngineError>;

    /// Open the event stream.
    fn events(&mut self) -> Result<Self::Events, EngineError>;
}

// ═══════════════════════════════════════════════════════════════════════
//  libbpf backend
// ═══════════════════════════════════════════════════════════════════════

/// USDT provider the booster daemons register their probes under.
pub const DEFAULT_PROVIDER: &str = "BOOSTER";

/// Handler source compiled into the binary, used when no source file is
/// given.
pub const BUNDLED_SOURCE: &str = include_str!("bpf/fault_injection.bpf.c");

/// Well-known tracefs mount points, preferred first.
pub const TRACEFS_CANDIDATES: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Configuration for [`LibbpfEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Compiler used for the instrumentation source.
    pub clang: PathBuf,
    /// USDT provider name.
    pub provider: String,
    /// Extra compiler arguments, placed before the macro flags.
    pub clang_args: Vec<String>,
    /// tracefs root.  `None` picks the first of [`TRACEFS_CANDIDATES`]
    /// that exists.
    pub tracefs: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clang: PathBuf::from("clang"),
            provider: DEFAULT_PROVIDER.to_string(),
            clang_args: vec![
                "-g".to_string(),
                "-O2".to_string(),
                "-target".to_string(),
                "bpf".to_string(),
                format!("-D__TARGET_ARCH_{}", target_arch()),
            ],
            tracefs: None,
        }
    }
}

impl EngineConfig {
    /// Full clang command line for compiling `src` into `obj`.
    pub fn clang_command_args(&self, src: &Path, obj: &Path, macros: &[MacroDefinition]) -> Vec<String> {
        let mut args = self.clang_args.clone();
        args.extend(macros.iter().map(MacroDefinition::to_flag));
        args.push("-c".to_string());
        args.push(src.display().to_string());
        args.push("-o".to_string());
        args.push(obj.display().to_string());
        args
    }

    /// The trace pipe to read events from.
    pub fn trace_pipe(&self) -> Result<PathBuf, EngineError> {
        if let Some(ref root) = self.tracefs {
            return Ok(root.join("trace_pipe"));
        }
        TRACEFS_CANDIDATES
            .iter()
            .map(Path::new)
            .find(|root| root.join("trace_pipe").exists())
            .map(|root| root.join("trace_pipe"))
            .ok_or_else(|| EngineError::NoTracefs(TRACEFS_CANDIDATES.iter().map(PathBuf::from).collect()))
    }
}

/// `__TARGET_ARCH_*` suffix for the host architecture.
fn target_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" | "x86" => "x86",
        "aarch64" => "arm64",
        "arm" => "arm",
        "riscv64" => "riscv",
        "powerpc64" => "powerpc",
        "s390x" => "s390",
        "loongarch64" => "loongarch",
        other => other,
    }
}

/// libbpf-backed [`TracingEngine`].
pub struct LibbpfEngine {
    config: EngineConfig,
    object: Option<Object>,
}

impl LibbpfEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            object: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn build_object(&self, source: &str, macros: &[MacroDefinition]) -> Result<(TempDir, PathBuf), EngineError> {
        let dir = tempfile::Builder::new()
            .prefix("faultctl-")
            .tempdir()
            .map_err(EngineError::Workspace)?;
        let src = dir.path().join("fault_injection.bpf.c");
        let obj = dir.path().join("fault_injection.bpf.o");
        std::fs::write(&src, source).map_err(EngineError::Workspace)?;

        let args = self.config.clang_command_args(&src, &obj, macros);
        debug!("{} {}", self.config.clang.display(), args.join(" "));
        let output = Command::new(&self.config.clang)
            .args(&args)
            .output()
            .map_err(|source| EngineError::ClangSpawn {
                clang: self.config.clang.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(EngineError::Compile {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok((dir, obj))
    }
}

impl TracingEngine for LibbpfEngine {
    type Link = Link;
    type Events = BufReader<File>;

    fn compile(&mut self, source: &str, macros: &[MacroDefinition]) -> Result<(), EngineError> {
        info!("Compiling instrumentation with {} parameter macro(s)", macros.len());
        // The object file is only needed until libbpf has loaded it.
        let (_dir, obj) = self.build_object(source, macros)?;

        let open = ObjectBuilder::default()
            .open_file(&obj)
            .map_err(EngineError::Open)?;
        let object = open.load().map_err(EngineError::Load)?;
        info!("BPF programs loaded");
        self.object = Some(object);
        Ok(())
    }

    fn attach(&mut self, pid: u32, probe: &ProbeRequest) -> Result<Link, EngineError> {
        let object = self.object.as_mut().ok_or(EngineError::NotCompiled)?;
        let handler = OsStr::new(&probe.fault_name);
        let prog = object
            .progs_mut()
            .find(|p| p.name() == handler)
            .ok_or_else(|| EngineError::HandlerNotFound(probe.fault_name.clone()))?;

        let binary = format!("/proc/{pid}/exe");
        prog.attach_usdt(pid as i32, &binary, &self.config.provider, &probe.probe_id)
            .map_err(|source| EngineError::Attach {
                handler: probe.fault_name.clone(),
                provider: self.config.provider.clone(),
                probe: probe.probe_id.clone(),
                pid,
                source,
            })
    }

    fn events(&mut self) -> Result<BufReader<File>, EngineError> {
        let path = self.config.trace_pipe()?;
        let file = File::open(&path).map_err(|source| EngineError::TracePipe { path, source })?;
        Ok(BufReader::new(file))
    }
}
