//! Fault point catalog, activation planning and timeout emulation for
//! faultctl.
//!
//! This crate holds everything that does not need the tracing engine:
//!
//! 1. **[`catalog`]** — the fault points the target binaries expose
//! 2. **[`plan`]** — turning `name [-p value]...` tokens into an
//!    [`ActivationPlan`](plan::ActivationPlan)
//! 3. **[`compile`]** — parameter macros and probe requests for the
//!    instrumentation build
//! 4. **[`process`]** / **[`timeout`]** — the stop/wait/resume loop that
//!    emulates long-running calls for timeout faults
//!
//! # Architecture
//!
//! ```text
//! argv tokens ──→ ActivationPlan::parse ──→ CompilationPlan::build ──→ (faultctl-trace)
//!                        │
//!                        └─ timeout_spec() ──→ TimeoutController::run
//!                                                 │  /proc/<pid>/stat
//!                                                 └─ kill(pid, SIGCONT)
//! ```

pub mod catalog;
pub mod compile;
pub mod plan;
pub mod process;
pub mod timeout;
