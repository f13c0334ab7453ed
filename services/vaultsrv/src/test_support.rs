//! Test and drill helpers
//!
//! A manual clock and an in-process recording channel, used by the unit and
//! integration tests to drive deterministic ladder timelines without real
//! time or real providers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::domain::Clock;
use crate::notify::{ChannelKind, NotificationChannel};

/// Clock whose time only moves when told to
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// One captured send
#[derive(Debug, Clone)]
pub struct SentNotification {
    pub recipient: String,
    pub template: String,
    pub params: Value,
}

/// Channel that records instead of delivering; can be told to fail
pub struct RecordingChannel {
    kind: ChannelKind,
    sent: Mutex<Vec<SentNotification>>,
    fail: AtomicBool,
}

impl RecordingChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Make every subsequent send return an error
    pub fn fail_next_sends(&self) {
        self.fail.store(true, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    /// Templates in send order, for terse assertions
    pub fn templates(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.template.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, recipient: &str, template: &str, params: &Value) -> anyhow::Result<()> {
        if self.fail.load(Ordering::Relaxed) {
            anyhow::bail!("simulated {} provider outage", self.kind);
        }
        self.sent.lock().unwrap().push(SentNotification {
            recipient: recipient.to_string(),
            template: template.to_string(),
            params: params.clone(),
        });
        Ok(())
    }
}
