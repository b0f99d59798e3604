pub mod config;
pub mod error;
pub mod http;
pub mod output;
pub mod plugins;
pub mod scanner;
pub mod target;
