//! Concrete persistence backends: plain file, data-protected file, and OS keyring
//! (with a signal file for modification times), plus the native adapters they use.

pub mod file;
pub mod key_provider;
pub mod keyring_persistence;
pub mod keyring_store;
pub mod protected_file;
pub mod protector;
