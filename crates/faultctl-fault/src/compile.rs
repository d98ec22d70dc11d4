//! Activation plan → instrumentation build inputs.
//!
//! Fault parameters reach the BPF handlers as compile-time string
//! constants: `DcaGetPohFail -p /dev/nvme0n1` becomes
//! `-DPARAMS_DcaGetPohFail="/dev/nvme0n1"`.  Values come straight from the
//! operator, so they are escaped into a single C string literal here and
//! never spliced into the compiler command line raw.

use crate::catalog::FaultCatalog;
use crate::plan::ActivationPlan;
use std::fmt;
use thiserror::Error;

/// Prefix of every parameter macro name.
pub const MACRO_PREFIX: &str = "PARAMS_";

/// Errors from planning the instrumentation build.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("fault point '{0}' is not in the catalog")]
    UnknownFault(String),

    #[error("fault point name '{0}' is not a valid macro identifier")]
    InvalidName(String),

    #[error("parameter for '{fault}' contains control character {ch:?} at byte {offset}")]
    ControlCharacter {
        fault: String,
        ch: char,
        offset: usize,
    },

    #[error("malformed string literal: {0}")]
    MalformedLiteral(String),
}

/// A `PARAMS_<fault>` compile-time constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroDefinition {
    pub fault_name: String,
    /// Quoted and escaped C string literal, e.g. `"/dev/nvme0n1"`.
    pub literal_value: String,
}

impl MacroDefinition {
    /// Build a definition for `fault_name` carrying `value`.
    pub fn new(fault_name: &str, value: &str) -> Result<Self, CompileError> {
        if !is_identifier(fault_name) {
            return Err(CompileError::InvalidName(fault_name.to_string()));
        }
        Ok(Self {
            fault_name: fault_name.to_string(),
            literal_value: escape_literal(fault_name, value)?,
        })
    }

    /// Macro name, `PARAMS_<fault>`.
    pub fn name(&self) -> String {
        format!("{MACRO_PREFIX}{}", self.fault_name)
    }

    /// Compiler flag defining this macro.
    pub fn to_flag(&self) -> String {
        format!("-D{}={}", self.name(), self.literal_value)
    }

    /// The original parameter value.
    pub fn value(&self) -> Result<String, CompileError> {
        unescape_literal(&self.literal_value)
    }
}

impl fmt::Display for MacroDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name(), self.literal_value)
    }
}

/// Probe to attach for one requested fault point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    /// USDT probe name in the target.
    pub probe_id: String,
    /// Fault point (and BPF handler program) name.
    pub fault_name: String,
}

/// Everything the attachment session needs from the activation plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationPlan {
    pub macros: Vec<MacroDefinition>,
    pub probes: Vec<ProbeRequest>,
}

impl CompilationPlan {
    /// Resolve `plan` against `catalog`.
    ///
    /// One macro per parameterized entry, one probe per entry.  Both lists
    /// are sorted by fault name.
    pub fn build(plan: &ActivationPlan, catalog: &FaultCatalog) -> Result<Self, CompileError> {
        let mut out = Self::default();
        for entry in plan.entries() {
            let def = catalog
                .lookup(&entry.fault_name)
                .ok_or_else(|| CompileError::UnknownFault(entry.fault_name.clone()))?;

            if let Some(value) = entry.parameter.as_deref().filter(|v| !v.is_empty()) {
                out.macros.push(MacroDefinition::new(def.name, value)?);
            }
            out.probes.push(ProbeRequest {
                probe_id: def.probe_id.to_string(),
                fault_name: def.name.to_string(),
            });
        }
        Ok(out)
    }

    /// Compiler flags for all macros.
    pub fn flags(&self) -> Vec<String> {
        self.macros.iter().map(MacroDefinition::to_flag).collect()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote `value` as a C string literal.
///
/// Backslashes and double quotes are escaped; control characters are
/// rejected.
pub fn escape_literal(fault: &str, value: &str) -> Result<String, CompileError> {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for (offset, ch) in value.char_indices() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c if c.is_control() => {
                return Err(CompileError::ControlCharacter {
                    fault: fault.to_string(),
                    ch: c,
                    offset,
                })
            }
            c => out.push(c),
        }
    }
    out.push('"');
    Ok(out)
}

/// Inverse of [`escape_literal`].
pub fn unescape_literal(literal: &str) -> Result<String, CompileError> {
    let inner = literal
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| CompileError::MalformedLiteral(literal.to_string()))?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(esc @ ('\\' | '"')) => out.push(esc),
                _ => return Err(CompileError::MalformedLiteral(literal.to_string())),
            },
            '"' => return Err(CompileError::MalformedLiteral(literal.to_string())),
            c => out.push(c),
        }
    }
    Ok(out)
}
