//! CLI support library for the `orchex` binary.

pub mod ui;

pub use ui::ConsoleUi;
