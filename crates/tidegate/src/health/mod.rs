mod accounting;
mod failure;
pub mod monitor;

pub use accounting::{ClientAccounting, ConnectionToken};
pub use failure::{FailureManager, FailureStatus};
