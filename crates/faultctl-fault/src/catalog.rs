//! Fault point definitions.
//!
//! Every fault point the controller can activate is described by a
//! [`FaultDefinition`]: the symbolic name operators type on the command
//! line, the USDT probe it binds to inside the target binary, and whether
//! the controller has to actively participate (timeout faults) once the
//! probe fires.  The [`FaultCatalog`] is built once at startup and shared
//! by reference; it is never mutated afterwards.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// How the controller participates once a fault point is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultClass {
    /// The probe handler alters the target on its own (return codes,
    /// arguments, memory).  Nothing else to do on the controller side.
    Plain,
    /// The probe handler stops the target; the controller holds it
    /// stopped for `secs` seconds and then resumes it.
    Timeout {
        /// Suspension length in seconds.
        secs: u64,
    },
}

impl FaultClass {
    /// Suspension duration for timeout faults.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            FaultClass::Plain => None,
            FaultClass::Timeout { secs } => Some(Duration::from_secs(*secs)),
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultClass::Plain => write!(f, "plain"),
            FaultClass::Timeout { secs } => write!(f, "timeout({secs}s)"),
        }
    }
}

/// A single fault point known to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultDefinition {
    /// Name used on the command line and for the BPF handler program.
    pub name: &'static str,
    /// USDT probe name inside the target binary.
    pub probe_id: &'static str,
    /// One-line description shown in the usage text.
    pub description: &'static str,
    /// Whether the handler reads a `-p` parameter.
    pub accepts_param: bool,
    pub class: FaultClass,
}

impl FaultDefinition {
    /// A plain fault whose probe id equals its name.
    pub const fn plain(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            probe_id: name,
            description,
            accepts_param: false,
            class: FaultClass::Plain,
        }
    }

    /// A plain fault whose handler reads a `-p` parameter.
    pub const fn with_param(name: &'static str, description: &'static str) -> Self {
        Self {
            accepts_param: true,
            ..Self::plain(name, description)
        }
    }

    /// A timeout fault that suspends the target for `secs` seconds.
    pub const fn timeout(name: &'static str, description: &'static str, secs: u64) -> Self {
        Self {
            class: FaultClass::Timeout { secs },
            ..Self::plain(name, description)
        }
    }

    /// Whether the controller must run the timeout emulation loop.
    pub fn is_timeout(&self) -> bool {
        matches!(self.class, FaultClass::Timeout { .. })
    }
}

impl fmt::Display for FaultDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<35} ({})", self.name, self.description)
    }
}

/// Name of the 30 second timeout fault.  Checked before the 90 second one
/// when both are requested.
pub const CLI_TIMEOUT_30S: &str = "CliReturnTimeOut30S";
/// Name of the 90 second timeout fault.
pub const CLI_TIMEOUT_90S: &str = "CliReturnTimeOut90S";

/// Timeout fault names in precedence order.
pub const TIMEOUT_PRECEDENCE: [&str; 2] = [CLI_TIMEOUT_30S, CLI_TIMEOUT_90S];

const BUILTIN: &[FaultDefinition] = &[
    // ── Data manager ────────────────────────────────────────────
    FaultDefinition::plain(
        "DmgChangeWearNormalDay",
        "data mgr get various wear to predicte disk life.",
    ),
    FaultDefinition::plain(
        "DmgChangeWear90Day",
        "data mgr get various wear to predicte disk life.",
    ),
    FaultDefinition::plain(
        "DmgChangeWear30Day",
        "data mgr get various wear to predicte disk life.",
    ),
    FaultDefinition::plain(
        "DmgChangeWear1Day",
        "data mgr get various wear to predicte disk life.",
    ),
    FaultDefinition::plain("DmgChangeCheckWhitelistTrue", "data mgr check whitelist."),
    FaultDefinition::plain("DmgChangeCheckWhitelistFalse", "data mgr check whitelist."),
    FaultDefinition::plain(
        "DmgChangeCheckWhitelistCacheTrue",
        "data mgr check whitelist cache.",
    ),
    FaultDefinition::plain(
        "DmgChangeCheckWhitelistCacheFalse",
        "data mgr check whitelist cache.",
    ),
    // ── Data collect manager ────────────────────────────────────
    FaultDefinition::plain(
        "DcmReturnLinkErrEinal",
        "data collect mgr meet link err when getting data from agent.",
    ),
    FaultDefinition::plain(
        "DcmReturnLinkErrEpipe",
        "data collect mgr meet link err when getting data from agent.",
    ),
    FaultDefinition::plain(
        "DcmReturnLinkErrEnosys",
        "data collect mgr meet link err when getting data from agent.",
    ),
    // ── DRM / CLI / SPDK ────────────────────────────────────────
    FaultDefinition::plain("DrmReturnErr", "drm get health info failed."),
    FaultDefinition::timeout(CLI_TIMEOUT_30S, "cli query info failed.", 30),
    FaultDefinition::timeout(CLI_TIMEOUT_90S, "cli query info failed.", 90),
    FaultDefinition::plain(
        "DrmDiskDiagReponseParseFail",
        "drm disk diag parse response failed.",
    ),
    FaultDefinition::plain("DcaCreatePipeFail", "dca create pipe failed."),
    FaultDefinition::plain("DcaClosePipeFail", "dca close pipe failed."),
    FaultDefinition::plain("SpdkReturnJsonTimeOut", "spdk return json time out."),
    // ── DCA / DHA ───────────────────────────────────────────────
    FaultDefinition::with_param("DcaGetPohFail", "dca get power on hour failed."),
    FaultDefinition::with_param("DcaGetDhaSingleFail", "dha get single disk info failed."),
    FaultDefinition::plain("CliEnableCollect", "cli set dha collect no interval."),
    FaultDefinition::plain("DhaEbpfCheckEvent", "dha ebpf reader check event."),
    FaultDefinition::plain("DhaEbpfGetSnErr", "dha ebpf reader get sn err."),
    FaultDefinition::plain("DhaEbpfCorruptShm", "dha ebpf reader corrupt shm."),
    FaultDefinition::plain("DhaEbpfReaderLockUp", "dha ebpf reader lockup."),
    FaultDefinition::plain("DhaEbpfProducerLockUp", "dha ebpf producer lockup."),
    // ── DRM disk diagnose ───────────────────────────────────────
    FaultDefinition::plain(
        "DrmDiskDiagOfflineDiskFail",
        "drm disk diagnose offline disk failed",
    ),
    FaultDefinition::plain(
        "DrmDiskDiagOnlineDiskFail",
        "drm disk diagnose online disk failed",
    ),
    FaultDefinition::plain(
        "DrmDiskDiagSelfTestDiskFail",
        "drm disk diagnose selftest disk prefail",
    ),
    FaultDefinition::plain(
        "DrmDiskDiagChangeLimitFail",
        "drm disk diagnose change limit failed",
    ),
    FaultDefinition::plain(
        "DrmDiskDiagOnlineDiagFail",
        "drm disk diagnose online diag failed",
    ),
    FaultDefinition::plain(
        "DrmDiskDiagUpdateDiagStatusFail",
        "drm disk diagnose update diag status failed",
    ),
    FaultDefinition::plain(
        "DrmDiskDiagGetDiagInfoFail",
        "drm disk diagnose get diag info failed",
    ),
    FaultDefinition::plain(
        "DrmDiskDiagFormatInfoFail",
        "drm disk diagnose format info failed",
    ),
];

/// Immutable name → definition registry.
///
/// Iteration order is the order definitions were registered in, so the
/// usage text lists faults grouped the way they were declared.
#[derive(Debug, Clone)]
pub struct FaultCatalog {
    defs: Vec<FaultDefinition>,
    index: BTreeMap<&'static str, usize>,
}

impl FaultCatalog {
    /// The catalog of fault points compiled into the booster daemons.
    pub fn builtin() -> Self {
        Self::from_definitions(BUILTIN.iter().cloned())
    }

    /// Build a catalog from arbitrary definitions.
    ///
    /// A later definition with an already registered name replaces the
    /// earlier one in place, keeping names unique.
    pub fn from_definitions(defs: impl IntoIterator<Item = FaultDefinition>) -> Self {
        let mut catalog = Self {
            defs: Vec::new(),
            index: BTreeMap::new(),
        };
        for def in defs {
            match catalog.index.get(def.name) {
                Some(&slot) => catalog.defs[slot] = def,
                None => {
                    catalog.index.insert(def.name, catalog.defs.len());
                    catalog.defs.push(def);
                }
            }
        }
        catalog
    }

    /// Look up a fault point by name.
    pub fn lookup(&self, name: &str) -> Option<&FaultDefinition> {
        self.index.get(name).map(|&slot| &self.defs[slot])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All definitions, in registration order.
    pub fn list_all(&self) -> &[FaultDefinition] {
        &self.defs
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl Default for FaultCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
