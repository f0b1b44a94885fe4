pub mod bytestore;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fs;
pub mod globus;
pub mod mimetype;
pub mod model;
pub mod monitor;
pub mod store;

pub use config::Settings;
pub use error::{BridgeError, Result};
