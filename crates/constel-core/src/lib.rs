// constel-core: Wire types, key derivation, identity files, config, utilities
// No internal constel dependencies; this is the foundation crate.

pub mod config;
pub mod constants;
pub mod crypto;
pub mod fs;
pub mod identity;
pub mod naming;
pub mod observability;
pub mod protocol;
pub mod retry;
pub mod state;
