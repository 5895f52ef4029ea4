//! Site filesystem helpers.

pub mod walker;
