pub mod config;
pub mod context;
pub mod core;
pub mod fs;
pub mod logging;
