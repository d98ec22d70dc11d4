//! Activation requests — which fault points to turn on, and with what.
//!
//! The command line carries a flat token list such as
//! `DcaGetPohFail -p /dev/nvme0n1 DrmReturnErr`.  [`ActivationPlan::parse`]
//! scans it against the [`FaultCatalog`] and produces an immutable plan.
//! Unknown names are warned about and skipped; they never reach the plan.

use crate::catalog::{FaultCatalog, TIMEOUT_PRECEDENCE};
use log::warn;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Token that introduces a fault parameter.
pub const PARAM_MARKER: &str = "-p";

/// Errors from building an activation plan.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("no valid fault points to enable (skipped: {skipped:?})")]
    Empty { skipped: Vec<String> },
}

/// One requested fault point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationEntry {
    pub fault_name: String,
    /// Value given with `-p`.  Never `Some("")`.
    pub parameter: Option<String>,
}

/// The timeout fault that will drive the emulation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutSpec {
    pub fault_name: String,
    pub duration: Duration,
}

/// Validated set of fault points to activate.
///
/// Keyed by fault name; a repeated name replaces the earlier request
/// (last write wins).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationPlan {
    entries: BTreeMap<String, ActivationEntry>,
}

impl ActivationPlan {
    /// Scan `tokens` left to right against `catalog`.
    ///
    /// A known name followed by `-p <value>` consumes three tokens.  A
    /// trailing `-p` with no value after it is not a parameter and is
    /// scanned as its own candidate name.
    pub fn parse<S: AsRef<str>>(tokens: &[S], catalog: &FaultCatalog) -> Result<Self, PlanError> {
        let mut builder = ActivationPlanBuilder::new(catalog);
        let mut i = 0;
        while i < tokens.len() {
            let name = tokens[i].as_ref();
            if !catalog.contains(name) {
                warn!("fault point '{name}' not found in catalog, skipping");
                builder.skip(name);
                i += 1;
                continue;
            }

            if i + 2 < tokens.len() && tokens[i + 1].as_ref() == PARAM_MARKER {
                builder.insert(name, Some(tokens[i + 2].as_ref()));
                i += 3;
            } else {
                builder.insert(name, None);
                i += 1;
            }
        }
        builder.build()
    }

    pub fn get(&self, name: &str) -> Option<&ActivationEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Entries sorted by fault name.
    pub fn entries(&self) -> impl Iterator<Item = &ActivationEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Select the timeout fault that drives the emulation loop.
    ///
    /// `CliReturnTimeOut30S` is checked before `CliReturnTimeOut90S`; when
    /// both are requested the 30 second one is used and the other is
    /// ignored.  Timeout faults outside that pair (custom catalogs) are
    /// considered afterwards, in name order.
    pub fn timeout_spec(&self, catalog: &FaultCatalog) -> Option<TimeoutSpec> {
        let ranked = TIMEOUT_PRECEDENCE
            .iter()
            .copied()
            .chain(self.entries.keys().map(String::as_str));

        for name in ranked {
            if !self.contains(name) {
                continue;
            }
            if let Some(duration) = catalog.lookup(name).and_then(|d| d.class.timeout()) {
                return Some(TimeoutSpec {
                    fault_name: name.to_string(),
                    duration,
                });
            }
        }
        None
    }
}

/// Incremental plan construction with catalog checks.
pub struct ActivationPlanBuilder<'a> {
    catalog: &'a FaultCatalog,
    plan: ActivationPlan,
    skipped: Vec<String>,
}

impl<'a> ActivationPlanBuilder<'a> {
    pub fn new(catalog: &'a FaultCatalog) -> Self {
        Self {
            catalog,
            plan: ActivationPlan::default(),
            skipped: Vec::new(),
        }
    }

    /// Record a request for `name`.  Returns `false` (and records the name
    /// as skipped) if the catalog does not know it.
    pub fn insert(&mut self, name: &str, parameter: Option<&str>) -> bool {
        let Some(def) = self.catalog.lookup(name) else {
            self.skip(name);
            return false;
        };

        let parameter = parameter.filter(|p| !p.is_empty()).map(str::to_string);
        if let Some(ref value) = parameter {
            if !def.accepts_param {
                warn!("fault point '{name}' does not read a parameter, '{value}' is passed anyway");
            }
        }
        if self.plan.entries.contains_key(name) {
            warn!("fault point '{name}' requested more than once, keeping the last request");
        }

        self.plan.entries.insert(
            name.to_string(),
            ActivationEntry {
                fault_name: name.to_string(),
                parameter,
            },
        );
        true
    }

    fn skip(&mut self, name: &str) {
        self.skipped.push(name.to_string());
    }

    /// Names that were rejected so far.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Finish the plan.  An empty plan is an error.
    pub fn build(self) -> Result<ActivationPlan, PlanError> {
        if self.plan.is_empty() {
            return Err(PlanError::Empty {
                skipped: self.skipped,
            });
        }
        Ok(self.plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FaultDefinition, CLI_TIMEOUT_30S, CLI_TIMEOUT_90S};
    use proptest::prelude::*;

    fn parse(tokens: &[&str]) -> Result<ActivationPlan, PlanError> {
        ActivationPlan::parse(tokens, &FaultCatalog::builtin())
    }

    #[test]
    fn single_fault_without_param() {
        let plan = parse(&["DrmReturnErr"]).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get("DrmReturnErr").unwrap().parameter, None);
    }

    #[test]
    fn fault_with_param() {
        let plan = parse(&["DcaGetPohFail", "-p", "/dev/nvme0n1"]).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.get("DcaGetPohFail").unwrap().parameter.as_deref(),
            Some("/dev/nvme0n1")
        );
    }

    #[test]
    fn mixed_faults_and_params() {
        let plan = parse(&[
            "DcaGetPohFail",
            "-p",
            "/dev/nvme0n1",
            "DrmReturnErr",
            "DcaGetDhaSingleFail",
            "-p",
            "/dev/sda",
        ])
        .unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.get("DrmReturnErr").unwrap().parameter, None);
        assert_eq!(
            plan.get("DcaGetDhaSingleFail").unwrap().parameter.as_deref(),
            Some("/dev/sda")
        );
    }

    #[test]
    fn unknown_fault_is_skipped() {
        let plan = parse(&["UnknownFn", "DrmReturnErr"]).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(!plan.contains("UnknownFn"));
    }

    #[test]
    fn only_unknown_faults_is_empty_error() {
        let err = parse(&["UnknownFn"]).unwrap_err();
        assert_eq!(
            err,
            PlanError::Empty {
                skipped: vec!["UnknownFn".to_string()]
            }
        );
    }

    #[test]
    fn no_tokens_is_empty_error() {
        let err = parse(&[]).unwrap_err();
        assert_eq!(err, PlanError::Empty { skipped: vec![] });
    }

    #[test]
    fn trailing_marker_is_not_a_param() {
        let plan = parse(&["DcaGetPohFail", "-p"]).unwrap();
        assert_eq!(plan.get("DcaGetPohFail").unwrap().parameter, None);
        assert!(!plan.contains("-p"));
    }

    #[test]
    fn trailing_marker_is_scanned_as_name() {
        let err = parse(&["UnknownFn", "-p"]).unwrap_err();
        assert_eq!(
            err,
            PlanError::Empty {
                skipped: vec!["UnknownFn".to_string(), "-p".to_string()]
            }
        );
    }

    #[test]
    fn marker_after_unknown_name_is_its_own_token() {
        // The unknown name consumes one token; "-p" and the value are then
        // scanned as names.
        let err = parse(&["UnknownFn", "-p", "/dev/sda"]).unwrap_err();
        assert_eq!(
            err,
            PlanError::Empty {
                skipped: vec![
                    "UnknownFn".to_string(),
                    "-p".to_string(),
                    "/dev/sda".to_string()
                ]
            }
        );
    }

    #[test]
    fn param_value_may_be_a_fault_name() {
        let plan = parse(&["DcaGetPohFail", "-p", "DrmReturnErr"]).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan.get("DcaGetPohFail").unwrap().parameter.as_deref(),
            Some("DrmReturnErr")
        );
    }

    #[test]
    fn duplicate_name_last_write_wins() {
        let plan = parse(&["DcaGetPohFail", "-p", "/dev/a", "DcaGetPohFail"]).unwrap();
        assert_eq!(plan.get("DcaGetPohFail").unwrap().parameter, None);

        let plan = parse(&["DcaGetPohFail", "DcaGetPohFail", "-p", "/dev/b"]).unwrap();
        assert_eq!(
            plan.get("DcaGetPohFail").unwrap().parameter.as_deref(),
            Some("/dev/b")
        );
    }

    #[test]
    fn empty_param_is_absent() {
        let plan = parse(&["DcaGetPohFail", "-p", ""]).unwrap();
        assert_eq!(plan.get("DcaGetPohFail").unwrap().parameter, None);
    }

    #[test]
    fn timeout_spec_30s() {
        let catalog = FaultCatalog::builtin();
        let plan = parse(&[CLI_TIMEOUT_30S]).unwrap();
        let spec = plan.timeout_spec(&catalog).unwrap();
        assert_eq!(spec.fault_name, CLI_TIMEOUT_30S);
        assert_eq!(spec.duration, Duration::from_secs(30));
    }

    #[test]
    fn timeout_spec_90s() {
        let catalog = FaultCatalog::builtin();
        let plan = parse(&["DrmReturnErr", CLI_TIMEOUT_90S]).unwrap();
        let spec = plan.timeout_spec(&catalog).unwrap();
        assert_eq!(spec.duration, Duration::from_secs(90));
    }

    #[test]
    fn timeout_spec_30s_checked_first() {
        let catalog = FaultCatalog::builtin();
        let plan = parse(&[CLI_TIMEOUT_90S, CLI_TIMEOUT_30S]).unwrap();
        let spec = plan.timeout_spec(&catalog).unwrap();
        assert_eq!(spec.fault_name, CLI_TIMEOUT_30S);
        assert_eq!(spec.duration, Duration::from_secs(30));
    }

    #[test]
    fn no_timeout_spec_for_plain_faults() {
        let catalog = FaultCatalog::builtin();
        let plan = parse(&["DrmReturnErr", "SpdkReturnJsonTimeOut"]).unwrap();
        assert_eq!(plan.timeout_spec(&catalog), None);
    }

    #[test]
    fn custom_timeout_fault() {
        let catalog = FaultCatalog::from_definitions([
            FaultDefinition::plain("Quick", "q"),
            FaultDefinition::timeout("Hang5", "h", 5),
        ]);
        let plan = ActivationPlan::parse(&["Quick", "Hang5"], &catalog).unwrap();
        let spec = plan.timeout_spec(&catalog).unwrap();
        assert_eq!(spec.fault_name, "Hang5");
        assert_eq!(spec.duration, Duration::from_secs(5));
    }

    fn token() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("DcaGetPohFail".to_string()),
            Just("DrmReturnErr".to_string()),
            Just(CLI_TIMEOUT_30S.to_string()),
            Just(PARAM_MARKER.to_string()),
            "[A-Za-z/_.]{0,12}",
        ]
    }

    proptest! {
        #[test]
        fn unknown_names_never_activate(tokens in prop::collection::vec(token(), 0..12)) {
            let catalog = FaultCatalog::builtin();
            if let Ok(plan) = ActivationPlan::parse(&tokens, &catalog) {
                for entry in plan.entries() {
                    prop_assert!(catalog.contains(&entry.fault_name));
                }
            }
        }

        #[test]
        fn parsing_is_idempotent(tokens in prop::collection::vec(token(), 0..12)) {
            let catalog = FaultCatalog::builtin();
            prop_assert_eq!(
                ActivationPlan::parse(&tokens, &catalog),
                ActivationPlan::parse(&tokens, &catalog)
            );
        }

        #[test]
        fn param_triple_is_exact(value in "[a-zA-Z0-9/_. -]{1,24}") {
            let tokens = vec!["DcaGetPohFail".to_string(), PARAM_MARKER.to_string(), value.clone()];
            let plan = ActivationPlan::parse(&tokens, &FaultCatalog::builtin()).unwrap();
            prop_assert_eq!(
                plan.get("DcaGetPohFail").unwrap().parameter.as_deref(),
                Some(value.as_str())
            );
        }
    }
}
