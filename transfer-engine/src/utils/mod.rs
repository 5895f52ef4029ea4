//! Utility modules for the transfer engine.

pub mod errors;
pub mod logger;

pub use errors::{Result, TransferError};
