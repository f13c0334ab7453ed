//! Core domain types for the escalation ladder
//!
//! `Phase` is the single source of truth for where a message sits in the
//! ladder; the boolean mirrors (`escalation_active`, `disclosed`,
//! `presence_confirmed`) are derived from it at write time, never the
//! other way around.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Position of a message in the escalation ladder.
///
/// `Stage(k)` is the k-th reminder phase (1-based). `Disclosed` and
/// `ConfirmedAlive` are absorbing: no operation moves a message out of
/// either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Stage(u8),
    Disclosed,
    ConfirmedAlive,
}

impl Phase {
    /// True for the two absorbing phases
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Disclosed | Phase::ConfirmedAlive)
    }

    /// True while the message is in a reminder phase (sweep-eligible)
    pub fn is_ladder(&self) -> bool {
        matches!(self, Phase::Stage(_))
    }

    /// Ladder stage number, if any
    pub fn stage(&self) -> Option<u8> {
        match self {
            Phase::Stage(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Stage(n) => write!(f, "phase_{}", n),
            Phase::Disclosed => write!(f, "disclosed"),
            Phase::ConfirmedAlive => write!(f, "confirmed_alive"),
        }
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Phase::Idle),
            "disclosed" => Ok(Phase::Disclosed),
            "confirmed_alive" => Ok(Phase::ConfirmedAlive),
            other => {
                let stage = other
                    .strip_prefix("phase_")
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|n| *n >= 1);
                stage
                    .map(Phase::Stage)
                    .ok_or_else(|| format!("unknown phase: {}", other))
            },
        }
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// The entity under escalation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedMessage {
    pub id: Uuid,
    pub owner_id: String,
    /// Reminder targets; either may be absent
    pub owner_email: Option<String>,
    pub owner_phone: Option<String>,
    /// Disclosure targets; absent channels are skipped
    pub recipient_email: Option<String>,
    pub recipient_phone: Option<String>,
    /// Sealed payload, released only on disclosure
    #[serde(skip_serializing)]
    pub content: String,
    pub phase: Phase,
    pub phase_entered_at: Option<DateTime<Utc>>,
    pub escalation_active: bool,
    pub advance_count: i64,
    pub disclosed: bool,
    pub presence_confirmed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProtectedMessage {
    /// Create a new sealed message in IDLE
    pub fn new(owner_id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            owner_email: None,
            owner_phone: None,
            recipient_email: None,
            recipient_phone: None,
            content: content.into(),
            phase: Phase::Idle,
            phase_entered_at: None,
            escalation_active: false,
            advance_count: 0,
            disclosed: false,
            presence_confirmed: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Ephemeral single-use fast-lane credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastLaneCode {
    pub id: i64,
    pub target_phone: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Time source injected into the engine so eligibility checks are
/// deterministic under test and in drills
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip() {
        for phase in [
            Phase::Idle,
            Phase::Stage(1),
            Phase::Stage(3),
            Phase::Disclosed,
            Phase::ConfirmedAlive,
        ] {
            let parsed: Phase = phase.to_string().parse().unwrap();
            assert_eq!(parsed, phase);
        }
    }

    #[test]
    fn test_phase_rejects_garbage() {
        assert!("phase_0".parse::<Phase>().is_err());
        assert!("phase_x".parse::<Phase>().is_err());
        assert!("unlocked".parse::<Phase>().is_err());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Phase::Disclosed.is_terminal());
        assert!(Phase::ConfirmedAlive.is_terminal());
        assert!(!Phase::Idle.is_terminal());
        assert!(!Phase::Stage(2).is_terminal());
        assert!(Phase::Stage(2).is_ladder());
        assert!(!Phase::Idle.is_ladder());
    }

    #[test]
    fn test_new_message_is_idle() {
        let msg = ProtectedMessage::new("owner-1", "sealed text");
        assert_eq!(msg.phase, Phase::Idle);
        assert!(!msg.escalation_active);
        assert!(!msg.disclosed);
        assert!(!msg.presence_confirmed);
        assert_eq!(msg.advance_count, 0);
    }
}
