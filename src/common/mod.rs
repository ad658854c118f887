//! Common utilities and types shared across electkv

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, ElectionConfig};
pub use error::{Error, Result};
pub use utils::{local_hostname, parse_duration, validate_segment};
