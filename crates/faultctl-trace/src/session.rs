//! Probe attachment session: compiled fault handlers bound to one target.

use crate::engine::{EngineError, TracingEngine};
use faultctl_fault::compile::{MacroDefinition, ProbeRequest};
use faultctl_fault::process;
use log::{debug, info};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Instrumentation source not found: {0}")]
    SourceMissing(PathBuf),

    #[error("Failed to read instrumentation source {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Process {0} does not exist")]
    NoSuchProcess(u32),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Read the instrumentation source text.
pub fn load_source(path: &Path) -> Result<String, SessionError> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            SessionError::SourceMissing(path.to_path_buf())
        } else {
            SessionError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// A fault handler bound to its probe in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeAttachment {
    pub probe_id: String,
    pub source_fault_name: String,
}

/// Compiled instrumentation plus the probes attached so far.
///
/// Links are released on [`ProbeSession::detach`] or when the session is
/// dropped.
pub struct ProbeSession<E: TracingEngine> {
    engine: E,
    pid: u32,
    attachments: BTreeMap<String, (ProbeAttachment, E::Link)>,
}

impl<E: TracingEngine> ProbeSession<E> {
    /// Compile `source` with `macros` for target `pid`.
    pub fn open(mut engine: E, source: &str, macros: &[MacroDefinition], pid: u32) -> Result<Self, SessionError> {
        if !process::is_alive(pid) {
            return Err(SessionError::NoSuchProcess(pid));
        }
        for m in macros {
            debug!("define {m}");
        }
        engine.compile(source, macros)?;
        Ok(Self {
            engine,
            pid,
            attachments: BTreeMap::new(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Attach every probe in `probes`, in order.
    ///
    /// A probe id that is already attached is left alone and its existing
    /// attachment returned.  Stops at the first failure; attachments made
    /// before it stay in the session.
    pub fn attach(&mut self, probes: &[ProbeRequest]) -> Result<Vec<ProbeAttachment>, SessionError> {
        let mut out = Vec::with_capacity(probes.len());
        for probe in probes {
            if let Some((existing, _)) = self.attachments.get(&probe.probe_id) {
                debug!("probe {} already attached", probe.probe_id);
                out.push(existing.clone());
                continue;
            }
            let link = self.engine.attach(self.pid, probe)?;
            info!("Enabled fault point {} in process {}", probe.fault_name, self.pid);
            let attachment = ProbeAttachment {
                probe_id: probe.probe_id.clone(),
                source_fault_name: probe.fault_name.clone(),
            };
            self.attachments
                .insert(probe.probe_id.clone(), (attachment.clone(), link));
            out.push(attachment);
        }
        Ok(out)
    }

    /// Currently attached probes, ordered by probe id.
    pub fn attachments(&self) -> impl Iterator<Item = &ProbeAttachment> {
        self.attachments.values().map(|(a, _)| a)
    }

    /// Release every link.  Returns how many were released.
    pub fn detach(&mut self) -> usize {
        let n = self.attachments.len();
        self.attachments.clear();
        if n > 0 {
            info!("Detached {n} probe(s) from process {}", self.pid);
        }
        n
    }

    /// Open the handlers' event stream.
    pub fn events(&mut self) -> Result<E::Events, SessionError> {
        Ok(self.engine.events()?)
    }
}
