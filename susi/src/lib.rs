pub mod cli;
pub mod components;
pub mod load_config;
pub mod logging;

pub use cli::{run, Cli, Commands};
