//! # TaskGate Core
//!
//! Shared configuration and error types used by the scheduler, the guardrail
//! pipeline and the `taskgate` binary.

pub mod config;
pub mod error;

pub use config::{GuardrailConfig, RoutingRuleConfig, SchedulerConfig, TaskGateConfig};
pub use error::{Result, TaskGateError};
