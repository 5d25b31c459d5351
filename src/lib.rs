pub mod backend;
pub mod cli;
pub mod config;
pub mod console;
pub mod entities;
pub mod error;
pub mod fixtures;
pub mod http_api;
pub mod instances;
pub mod license;
pub mod model;
pub mod operator_log;
pub mod pairing;
pub mod runtime_state;
pub mod store;
pub mod webhooks;

pub use console::Console;
pub use error::{ConsoleError, ConsoleResult};
