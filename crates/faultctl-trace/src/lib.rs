//! USDT probe attachment and event streaming for faultctl.
//!
//! The target daemons are built with static USDT probes at every fault
//! point (provider `BOOSTER` by default).  This crate compiles the BPF
//! fault handlers, attaches the requested ones to a running process and
//! streams what they report.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  Target process (boosterd, cli)     │
//! │    DTRACE_PROBE(BOOSTER, <probe>)   │
//! └──────────────┬──────────────────────┘
//!                │ uprobe on USDT note
//! ═══════════════╪══════════════════════════
//! ┌──────────────▼──────────────────────┐
//! │  BPF handler per fault point        │
//! │    override return / SIGSTOP        │
//! │    bpf_trace_printk(...)            │
//! └──────────────┬──────────────────────┘
//!                │ tracefs trace_pipe
//! ┌──────────────▼──────────────────────┐
//! │  ProbeSession → EventSink           │
//! │    → TraceEvent stream (stdout)     │
//! │    → JSON lines (--output)          │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use faultctl_fault::catalog::FaultCatalog;
//! use faultctl_fault::compile::CompilationPlan;
//! use faultctl_fault::plan::ActivationPlan;
//! use faultctl_trace::engine::{EngineConfig, LibbpfEngine, BUNDLED_SOURCE};
//! use faultctl_trace::session::ProbeSession;
//! use faultctl_trace::sink::EventSink;
//!
//! let catalog = FaultCatalog::builtin();
//! let plan = ActivationPlan::parse(&["DrmReturnErr"], &catalog).unwrap();
//! let build = CompilationPlan::build(&plan, &catalog).unwrap();
//!
//! let engine = LibbpfEngine::new(EngineConfig::default());
//! let mut session = ProbeSession::open(engine, BUNDLED_SOURCE, &build.macros, 12345).unwrap();
//! session.attach(&build.probes).unwrap();
//!
//! let mut sink = EventSink::new(std::io::stdout());
//! sink.drain(session.events().unwrap()).unwrap();
//! ```

pub mod engine;
pub mod events;
pub mod session;
pub mod sink;
