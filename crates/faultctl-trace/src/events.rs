//! Trace events as emitted by the probe handlers.
//!
//! Handlers report through `bpf_trace_printk`, so events arrive as lines of
//! the kernel trace pipe:
//!
//! ```text
//!         boosterd-4121    [002] d..31  5137.123456: bpf_trace_printk: Probe DcaGetPohFail: Matched path
//! ```
//!
//! [`TraceEvent::parse`] splits that into fields.  Lines that do not fit
//! the layout are kept as raw events so nothing is dropped.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One line of trace output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Task (thread) name.
    pub task: Option<String>,
    /// Thread id of the task that hit the probe.
    pub pid: Option<u32>,
    pub cpu: Option<u32>,
    /// irqs-off / need-resched / preempt-depth flags, when the kernel
    /// prints them.
    pub flags: Option<String>,
    /// Kernel timestamp in seconds.
    pub timestamp: Option<f64>,
    /// Handler message.
    pub message: String,
    /// The line as read, without the trailing newline.
    pub line: String,
}

/// Prefixes the kernel puts between the timestamp and the message.
const PRINTK_PREFIXES: [&str; 2] = ["bpf_trace_printk: ", "0: "];

impl TraceEvent {
    /// An event that could not be split into fields.
    pub fn raw(line: &str) -> Self {
        Self {
            task: None,
            pid: None,
            cpu: None,
            flags: None,
            timestamp: None,
            message: line.to_string(),
            line: line.to_string(),
        }
    }

    /// Parse one trace pipe line.  Never fails; see [`TraceEvent::raw`].
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\n', '\r']);
        Self::parse_fields(line).unwrap_or_else(|| Self::raw(line))
    }

    fn parse_fields(line: &str) -> Option<Self> {
        let open = line.find(" [")?;
        let close = open + line[open..].find(']')?;

        let (task, pid) = split_task_pid(line[..open].trim())?;
        let cpu = line[open + 2..close].trim().parse::<u32>().ok()?;

        // "<flags> <timestamp>: <message>" or "<timestamp>: <message>"
        let rest = line[close + 1..].trim_start();
        let colon = rest.find(": ")?;
        let mut head = rest[..colon].split_whitespace();
        let (flags, ts) = match (head.next(), head.next(), head.next()) {
            (Some(ts), None, None) => (None, ts),
            (Some(flags), Some(ts), None) => (Some(flags.to_string()), ts),
            _ => return None,
        };
        let timestamp = ts.parse::<f64>().ok()?;

        let mut message = &rest[colon + 2..];
        for prefix in PRINTK_PREFIXES {
            if let Some(stripped) = message.strip_prefix(prefix) {
                message = stripped;
                break;
            }
        }

        Some(Self {
            task: Some(task.to_string()),
            pid: Some(pid),
            cpu: Some(cpu),
            flags,
            timestamp: Some(timestamp),
            message: message.to_string(),
            line: line.to_string(),
        })
    }

    /// Whether this line was split into fields.
    pub fn is_parsed(&self) -> bool {
        self.pid.is_some()
    }
}

/// `comm-tid`; the name itself may contain dashes.
fn split_task_pid(s: &str) -> Option<(&str, u32)> {
    let dash = s.rfind('-')?;
    let pid = s[dash + 1..].parse().ok()?;
    Some((&s[..dash], pid))
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}
