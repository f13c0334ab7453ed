//! Escalation policy - pure ladder configuration
//!
//! An ordered list of reminder phases, each with a dwell time and a
//! reminder template. No state, no side effects: the engine asks the policy
//! where a message goes next and when it becomes eligible. Delays are
//! fractional hours so drill configurations can run minute-scale ladders
//! without code changes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Phase;
use crate::error::{Result, VaultError};

/// One reminder phase: dwell time required in this phase before the sweep
/// advances out of it, and the template sent to the owner on entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub delay_hours: f64,
    pub template: String,
}

/// Where the ladder goes after a given stage times out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Remind(u8),
    Disclose,
}

/// Immutable ladder configuration, injected at engine construction
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    phases: Vec<PhaseSpec>,
    disclosure_template: String,
    sealed_template: String,
}

impl EscalationPolicy {
    pub fn new(
        phases: Vec<PhaseSpec>,
        disclosure_template: impl Into<String>,
        sealed_template: impl Into<String>,
    ) -> Result<Self> {
        if phases.is_empty() {
            return Err(VaultError::Config(
                "escalation policy needs at least one phase".to_string(),
            ));
        }
        if let Some(bad) = phases.iter().find(|p| p.delay_hours <= 0.0) {
            return Err(VaultError::Config(format!(
                "non-positive delay_hours in phase template {}",
                bad.template
            )));
        }
        Ok(Self {
            phases,
            disclosure_template: disclosure_template.into(),
            sealed_template: sealed_template.into(),
        })
    }

    /// Number of reminder phases in the ladder
    pub fn stage_count(&self) -> u8 {
        self.phases.len() as u8
    }

    /// Reminder template for a 1-based stage
    pub fn template(&self, stage: u8) -> Option<&str> {
        self.phases
            .get(stage.checked_sub(1)? as usize)
            .map(|p| p.template.as_str())
    }

    pub fn disclosure_template(&self) -> &str {
        &self.disclosure_template
    }

    pub fn sealed_template(&self) -> &str {
        &self.sealed_template
    }

    /// Dwell time required in a stage before the ladder advances out of it
    pub fn dwell(&self, stage: u8) -> Option<Duration> {
        let spec = self.phases.get(stage.checked_sub(1)? as usize)?;
        Some(Duration::milliseconds(
            (spec.delay_hours * 3_600_000.0) as i64,
        ))
    }

    /// Earliest instant at which a message that entered `stage` at
    /// `entered_at` becomes sweep-eligible
    pub fn target_time(&self, entered_at: DateTime<Utc>, stage: u8) -> Option<DateTime<Utc>> {
        Some(entered_at + self.dwell(stage)?)
    }

    /// Eligibility check used by the sweep
    pub fn is_due(&self, stage: u8, entered_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.target_time(entered_at, stage) {
            Some(target) => now >= target,
            None => false,
        }
    }

    /// Step after `stage` times out
    pub fn next(&self, stage: u8) -> NextStep {
        if stage >= self.stage_count() {
            NextStep::Disclose
        } else {
            NextStep::Remind(stage + 1)
        }
    }

    /// Human-readable "stage X of N" summary surfaced to callers
    pub fn summary(&self, phase: Phase) -> String {
        match phase.stage() {
            Some(stage) => {
                let total = self.stage_count();
                format!(
                    "stage {} of {}, {} stage(s) remain before disclosure",
                    stage,
                    total,
                    total.saturating_sub(stage)
                )
            },
            None => phase.to_string(),
        }
    }
}
