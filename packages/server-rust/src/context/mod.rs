//! Per-operation tenant context propagation.

pub mod carrier;

pub use carrier::{ContextCarrier, ScopeHandle};
