//! Core contracts for stash: the persistence capability shared by every backend,
//! its error taxonomy, and the native secret-store / data-protection seams.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod persistence;
pub mod protect;
pub mod secret_store;
