// constel-cli: Clap commands for node daemons and operator tooling
// Depends on constel-core, constel-atls, constel-debugd, constel-activation, constel-recovery

pub mod commands;
pub mod ui;

pub use commands::run;
