// Tests module
// Integration: complete staking lifecycles driven through the runtime
// Invariants: property-based checks of the accounting identities

pub mod integration;
