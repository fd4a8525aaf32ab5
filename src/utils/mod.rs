//! The `utils` module holds the pieces shared by every component: the error
//! type and logging initialization.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result, Status};
