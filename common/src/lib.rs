//! Shared helpers for the orchex crates.

#[cfg(feature = "cli")]
mod color_mode_cli_arg;
#[cfg(feature = "elapsed")]
pub mod elapsed;

#[cfg(feature = "cli")]
pub use color_mode_cli_arg::ColorModeCliArg;
