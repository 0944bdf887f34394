//! # constellation: Node activation and debugd peer-bootstrap
//!
//! Facade crate that re-exports the workspace crates so consumers
//! can depend on a single `constellation` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | constel-core | Wire protocol, key derivation, identity, config |
//! | [`atls`] | constel-atls | Attested TLS, measurement watcher |
//! | [`debugd`] | constel-debugd | Debug daemon, peer downloader, `cdbg deploy` |
//! | [`activation`] | constel-activation | Node activation service and client |
//! | [`recovery`] | constel-recovery | State-disk key recovery |
//! | [`cli`] | constel-cli | Clap commands |

pub use constel_activation as activation;
pub use constel_atls as atls;
pub use constel_cli as cli;
pub use constel_core as core;
pub use constel_debugd as debugd;
pub use constel_recovery as recovery;
