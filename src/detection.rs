//! Detection rule engine.
//!
//! Rules are evaluated in a fixed order on each incoming point against the
//! previous point from the vessel's track window. Each rule yields at most
//! one candidate alert; tier-2 variants are consulted only when their tier-1
//! counterpart stayed silent. A panicking rule is a programmer error: it is
//! caught, logged with the offending point identity, and skipped without
//! aborting the session.

pub mod rules;

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::config::DetectionConfig;
use crate::models::{AisPoint, RuleType};

/// A candidate alert produced by one rule, before the cooldown gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub rule: RuleType,
    /// 0-100
    pub severity: i64,
    pub summary: String,
    /// Raw metrics the rule computed; field set is rule-specific
    pub evidence: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RuleEngine {
    config: DetectionConfig,
}

impl RuleEngine {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Run all rules against `(prev, curr)`. Multiple rules may fire on the
    /// same point; each produces its own candidate.
    pub fn evaluate(&self, prev: Option<&AisPoint>, curr: &AisPoint) -> Vec<Candidate> {
        let cfg = &self.config;
        let mut out = Vec::new();

        if let Some(candidate) =
            self.run_rule(curr, "POSITION_INVALID", || {
                rules::position_invalid(cfg, prev, curr)
            })
        {
            out.push(candidate);
        }

        let Some(prev) = prev else {
            return out;
        };

        match self.run_rule(curr, "TELEPORT", || rules::teleport(cfg, prev, curr)) {
            Some(candidate) => out.push(candidate),
            None => {
                if let Some(candidate) =
                    self.run_rule(curr, "TELEPORT_T2", || rules::teleport_t2(cfg, prev, curr))
                {
                    out.push(candidate);
                }
            }
        }

        match self.run_rule(curr, "TURN_RATE", || rules::turn_rate(cfg, prev, curr)) {
            Some(candidate) => out.push(candidate),
            None => {
                if let Some(candidate) =
                    self.run_rule(curr, "TURN_RATE_T2", || rules::turn_rate_t2(cfg, prev, curr))
                {
                    out.push(candidate);
                }
            }
        }

        if let Some(candidate) =
            self.run_rule(curr, "ACCELERATION", || rules::acceleration(cfg, prev, curr))
        {
            out.push(candidate);
        }

        if let Some(candidate) = self.run_rule(curr, "HEADING_COG_CONSISTENCY", || {
            rules::heading_cog_consistency(cfg, prev, curr)
        }) {
            out.push(candidate);
        }

        out
    }

    fn run_rule(
        &self,
        curr: &AisPoint,
        name: &str,
        rule: impl FnOnce() -> Option<Candidate>,
    ) -> Option<Candidate> {
        match catch_unwind(AssertUnwindSafe(rule)) {
            Ok(candidate) => candidate,
            Err(_) => {
                warn!(
                    mmsi = %curr.mmsi,
                    timestamp = %curr.timestamp,
                    "rule {name} panicked, point skipped for this rule"
                );
                None
            }
        }
    }
}
