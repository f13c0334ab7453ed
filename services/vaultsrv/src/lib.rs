//! VaultSrv - sealed-message absence-verification escalation service
//!
//! An author leaves a sealed message; a recipient can ask for disclosure.
//! The engine walks the message up a configurable reminder ladder and
//! disclosure happens only when the author stops answering - or instantly
//! through the phone-verified fast lane. The author can halt everything
//! with a one-click survival token.

pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod notify;
pub mod policy;
pub mod storage;
pub mod sweeper;
pub mod test_support;

pub use config::VaultConfig;
pub use engine::EscalationEngine;
pub use error::{Result, VaultError};
pub use policy::EscalationPolicy;
