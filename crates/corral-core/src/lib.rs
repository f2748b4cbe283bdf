pub mod config;
pub mod error;
pub mod models;

pub use config::CorralConfig;
pub use error::{CorralError, Result};
pub use models::*;
