//! Data models for subscription-engine.

pub mod billing;
pub mod owner;
pub mod plan;
pub mod subscription;
pub mod usage;

pub use billing::*;
pub use owner::*;
pub use plan::*;
pub use subscription::*;
pub use usage::*;
