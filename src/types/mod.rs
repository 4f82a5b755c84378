// Core types for the staking engine
// Principle: Minimal, auditable

pub mod primitives;
pub mod account;

pub use primitives::*;
pub use account::*;
