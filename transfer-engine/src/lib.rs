//! Site Transfer Engine
//!
//! Moves a site between hosts as a self-describing archive: a checksummed
//! container format, a chunked upload/download protocol that survives
//! constrained HTTP connections, and a priority-ordered export/import pipeline
//! that checkpoints after every step.

pub mod archive;
pub mod chunk;
pub mod config;
pub mod context;
pub mod database;
pub mod entity;
pub mod fs;
pub mod pipeline;
pub mod recovery;
pub mod site;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use context::TransferContext;
pub use utils::errors::TransferError;
pub type Result<T> = std::result::Result<T, TransferError>;
