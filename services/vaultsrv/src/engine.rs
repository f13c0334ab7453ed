//! Escalation engine - the absence-verification state machine
//!
//! Four operations (`start`, `sweep`, `confirm_presence`, `fast_unlock`)
//! plus fast-lane code issuance. All of them funnel into the same
//! conditional-write discipline in `storage`: whichever operation's write
//! lands first on an unchanged phase wins, and a loser surfaces as a domain
//! error or a benign no-op. Notifications always go out after the state
//! write has committed and never gate or revert it.

use chrono::Duration;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vault_token::{SurvivalToken, TokenCodec};

use crate::config::FastLaneConfig;
use crate::domain::{Clock, Phase, ProtectedMessage};
use crate::error::{Result, VaultError};
use crate::notify::{NotificationFailure, NotificationGateway};
use crate::policy::{EscalationPolicy, NextStep};
use crate::storage::{self, FastUnlockOutcome};

/// Bounded retries when an operation keeps losing phase races
const MAX_CAS_ATTEMPTS: usize = 3;

/// Result of `start`
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub phase: Phase,
    pub advance_count: i64,
    pub summary: String,
}

/// Result of one `sweep` pass
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    /// Intermediate reminder advances
    pub advanced: u64,
    /// Messages that reached DISCLOSED this pass
    pub disclosed: u64,
    /// Per-channel notification failures, for operational visibility
    pub failures: Vec<NotificationFailure>,
}

/// Result of `confirm_presence`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmOutcome {
    Confirmed,
    /// The record was already terminal; a stale or doubly-clicked link
    /// degrades to this, it is not an error
    AlreadyResolved,
}

#[derive(Debug, Serialize)]
pub struct ConfirmReport {
    pub outcome: ConfirmOutcome,
    pub failures: Vec<NotificationFailure>,
}

/// Result of `fast_unlock`
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum FastUnlockReport {
    Unlocked {
        content: String,
        failures: Vec<NotificationFailure>,
    },
    /// Message already terminal; the code was not burned. Content rides
    /// along only when the terminal phase is DISCLOSED (already public).
    AlreadyResolved {
        phase: Phase,
        content: Option<String>,
    },
}

/// Result of `request_fast_lane`
#[derive(Debug, Serialize)]
pub struct FastLaneIssued {
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub failures: Vec<NotificationFailure>,
}

/// The engine. Holds the record store, the immutable policy, the
/// notification gateway, the token codec and an injected clock.
pub struct EscalationEngine {
    pool: SqlitePool,
    policy: EscalationPolicy,
    gateway: NotificationGateway,
    codec: TokenCodec,
    clock: Arc<dyn Clock>,
    fast_lane: FastLaneConfig,
}

impl EscalationEngine {
    pub fn new(
        pool: SqlitePool,
        policy: EscalationPolicy,
        gateway: NotificationGateway,
        codec: TokenCodec,
        clock: Arc<dyn Clock>,
        fast_lane: FastLaneConfig,
    ) -> Self {
        Self {
            pool,
            policy,
            gateway,
            codec,
            clock,
            fast_lane,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Begin the ladder: IDLE -> PHASE_1, then remind the owner.
    ///
    /// Safe to repeat: a second call surfaces `AlreadyInProgress` with the
    /// phase set by the first acceptance and has no further side effects.
    pub async fn start(&self, message_id: &Uuid, initiator: &str) -> Result<StartOutcome> {
        let now = self.clock.now();
        let msg = storage::get_message(&self.pool, message_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(message_id.to_string()))?;

        if msg.phase.is_terminal() {
            return Err(VaultError::AlreadyTerminal { phase: msg.phase });
        }
        if msg.escalation_active {
            return Err(VaultError::AlreadyInProgress { phase: msg.phase });
        }

        if !storage::cas_start(&self.pool, message_id, now).await? {
            // Someone else moved the record between our read and write
            let current = storage::get_message(&self.pool, message_id)
                .await?
                .ok_or_else(|| VaultError::NotFound(message_id.to_string()))?;
            return if current.phase.is_terminal() {
                Err(VaultError::AlreadyTerminal {
                    phase: current.phase,
                })
            } else {
                Err(VaultError::AlreadyInProgress {
                    phase: current.phase,
                })
            };
        }

        let phase = Phase::Stage(1);
        let summary = self.policy.summary(phase);
        info!(
            "escalation started for message {} by {} ({})",
            message_id, initiator, summary
        );

        let failures = self.remind_owner(&msg, 1, now).await;
        if !failures.is_empty() {
            warn!(
                "start reminder for {} had {} channel failure(s)",
                message_id,
                failures.len()
            );
        }

        Ok(StartOutcome {
            phase,
            advance_count: msg.advance_count + 1,
            summary,
        })
    }

    /// Advance every ladder message whose dwell time has elapsed.
    ///
    /// Idempotent under overlap: each advance is a compare-and-swap on the
    /// phase last read, and a successful advance resets the eligibility
    /// boundary, so a back-to-back sweep finds nothing to do.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();

        let purged = storage::purge_stale_fast_lane_codes(&self.pool, now).await?;
        if purged > 0 {
            debug!("purged {} stale fast-lane code(s)", purged);
        }

        let candidates = storage::list_ladder_messages(&self.pool).await?;
        let mut report = SweepReport::default();

        for msg in candidates {
            let Some(stage) = msg.phase.stage() else {
                continue;
            };
            let Some(entered_at) = msg.phase_entered_at else {
                warn!("message {} in {} has no phase timestamp", msg.id, msg.phase);
                continue;
            };

            // A stage beyond the configured ladder (policy shrank) is due
            // immediately for its final step
            let due = stage > self.policy.stage_count()
                || self.policy.is_due(stage, entered_at, now);
            if !due {
                continue;
            }

            match self.policy.next(stage) {
                NextStep::Remind(next) => {
                    match storage::cas_advance(&self.pool, &msg.id, msg.phase, Phase::Stage(next), now)
                        .await
                    {
                        Ok(true) => {
                            report.advanced += 1;
                            debug!("message {} advanced to phase_{}", msg.id, next);
                            report.failures.extend(self.remind_owner(&msg, next, now).await);
                        },
                        Ok(false) => {
                            debug!("message {} moved concurrently, skipping", msg.id);
                        },
                        Err(e) => {
                            // Record stays in its phase; the next sweep retries it
                            error!("advance of message {} failed: {}", msg.id, e);
                        },
                    }
                },
                NextStep::Disclose => {
                    match storage::cas_disclose(&self.pool, &msg.id, msg.phase, now).await {
                        Ok(true) => {
                            report.disclosed += 1;
                            info!("message {} disclosed after full ladder", msg.id);
                            let params = json!({
                                "message_id": msg.id,
                            });
                            report.failures.extend(
                                self.gateway
                                    .notify_recipient(
                                        &msg,
                                        self.policy.disclosure_template(),
                                        &params,
                                    )
                                    .await,
                            );
                        },
                        Ok(false) => {
                            debug!("message {} moved concurrently, skipping", msg.id);
                        },
                        Err(e) => {
                            error!("disclosure of message {} failed: {}", msg.id, e);
                        },
                    }
                },
            }
        }

        info!(
            "sweep complete: {} advanced, {} disclosed, {} notification failure(s)",
            report.advanced,
            report.disclosed,
            report.failures.len()
        );
        Ok(report)
    }

    /// Redeem a survival token: any non-terminal phase -> CONFIRMED_ALIVE.
    pub async fn confirm_presence(&self, raw_token: &str) -> Result<ConfirmReport> {
        let claims = self.codec.decode(raw_token)?;
        let now = self.clock.now();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let msg = storage::get_message(&self.pool, &claims.message_id)
                .await?
                .ok_or(VaultError::InvalidToken)?;

            if msg.owner_id != claims.owner_id {
                return Err(VaultError::InvalidToken);
            }
            if msg.phase.is_terminal() {
                // Stale link; the record already resolved one way or the other
                return Ok(ConfirmReport {
                    outcome: ConfirmOutcome::AlreadyResolved,
                    failures: Vec::new(),
                });
            }

            if storage::cas_confirm_alive(&self.pool, &msg.id, msg.phase, now).await? {
                info!("presence confirmed for message {}, ladder halted", msg.id);
                let params = json!({ "message_id": msg.id });
                let failures = self
                    .gateway
                    .notify_recipient(&msg, self.policy.sealed_template(), &params)
                    .await;
                return Ok(ConfirmReport {
                    outcome: ConfirmOutcome::Confirmed,
                    failures,
                });
            }
            // Lost to a concurrent sweep; re-read and try against the new phase
        }

        Err(VaultError::StorageConflict(format!(
            "presence confirmation for {} kept losing phase races",
            claims.message_id
        )))
    }

    /// Instantaneous disclosure by proving control of the owner's phone.
    /// Works from IDLE or any intermediate phase; code consumption and
    /// disclosure commit in one transaction.
    pub async fn fast_unlock(
        &self,
        message_id: &Uuid,
        phone: &str,
        code: &str,
    ) -> Result<FastUnlockReport> {
        let now = self.clock.now();
        let msg = storage::get_message(&self.pool, message_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(message_id.to_string()))?;

        match storage::consume_code_and_disclose(&self.pool, message_id, phone, code, now).await? {
            FastUnlockOutcome::NoCode => Err(VaultError::VerificationFailed),
            FastUnlockOutcome::AlreadyTerminal(phase) => {
                debug!(
                    "fast unlock of {} ignored, already {} (code kept)",
                    message_id, phase
                );
                let content = (phase == Phase::Disclosed).then(|| msg.content.clone());
                Ok(FastUnlockReport::AlreadyResolved { phase, content })
            },
            FastUnlockOutcome::Unlocked => {
                info!("message {} fast-unlocked via verified phone", message_id);
                let params = json!({ "message_id": message_id });
                let failures = self
                    .gateway
                    .notify_recipient(&msg, self.policy.disclosure_template(), &params)
                    .await;
                Ok(FastUnlockReport::Unlocked {
                    content: msg.content,
                    failures,
                })
            },
        }
    }

    /// Issue a single-use numeric code to the owner's registered phone.
    pub async fn request_fast_lane(&self, message_id: &Uuid, phone: &str) -> Result<FastLaneIssued> {
        let now = self.clock.now();
        let msg = storage::get_message(&self.pool, message_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(message_id.to_string()))?;

        if msg.owner_phone.as_deref() != Some(phone) {
            return Err(VaultError::VerificationFailed);
        }

        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let expires_at = now + Duration::minutes(self.fast_lane.code_ttl_minutes);
        storage::insert_fast_lane_code(&self.pool, phone, &code, expires_at, now).await?;

        info!("fast-lane code issued for message {}", message_id);
        let params = json!({ "code": code, "expires_at": expires_at });
        let failures = self
            .gateway
            .send_sms(phone, &self.fast_lane.template, &params)
            .await;

        Ok(FastLaneIssued {
            expires_at,
            failures,
        })
    }

    async fn remind_owner(
        &self,
        msg: &ProtectedMessage,
        stage: u8,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Vec<NotificationFailure> {
        let template = match self.policy.template(stage) {
            Some(t) => t.to_string(),
            None => {
                warn!("no reminder template for stage {} of {}", stage, msg.id);
                return Vec::new();
            },
        };

        let token = self
            .codec
            .encode(&SurvivalToken::new(msg.id, &msg.owner_id, now));
        let params = json!({
            "message_id": msg.id,
            "stage": stage,
            "summary": self.policy.summary(Phase::Stage(stage)),
            "confirm_token": token,
        });

        self.gateway.notify_owner(msg, &template, &params).await
    }
}
