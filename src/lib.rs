pub mod config;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod shell;
pub mod utils;
