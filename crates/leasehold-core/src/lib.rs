//! `leasehold-core` — configuration, errors and identifier types shared by
//! the scheduler and the operator CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::LeaseholdConfig;
pub use error::{CoreError, Result};
pub use types::{InstanceId, Ticket};
