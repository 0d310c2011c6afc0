//! Subscription lifecycle and usage-entitlement engine.
//!
//! Tracks what an account may consume under its plan, meters consumption per
//! billing period, and drives subscriptions through trial, paid, past-due
//! and cancelled states with an append-only payment ledger.

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;

pub use engine::{Deadline, Engine};
pub use error::EngineError;
