/// torrotate daemon library
///
/// Command-line parsing, logging setup and the wiring that turns a
/// `RotatorConfig` into a running rotation loop.

pub mod app;
pub mod cli;
pub mod logging;

pub use cli::Cli;
