pub mod commands;
pub mod display;

pub use commands::{Cli, Commands, ExportFormatArg, SearchFieldArg, SessionCommands, StatusFilterArg};
pub use display::Display;
