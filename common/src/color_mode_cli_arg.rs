//! Standard type to use with the `--color` CLI option.

use clap::ValueEnum;
use std::io::IsTerminal;

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ColorModeCliArg {
    #[default]
    Auto,
    Always,
    Never,
}

impl ColorModeCliArg {
    /// Resolve the flag to an on/off decision for stdout.
    pub fn colors_enabled(self) -> bool {
        match self {
            ColorModeCliArg::Auto => std::io::stdout().is_terminal(),
            ColorModeCliArg::Always => true,
            ColorModeCliArg::Never => false,
        }
    }
}
