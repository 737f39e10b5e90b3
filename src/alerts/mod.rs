//! Alerts: persisted records of matched messages and their creation.

pub mod factory;
pub mod model;

pub use factory::{AlertFactory, AlertResult};
pub use model::{Alert, AlertCounts, AlertStatus, CompositeKey};
