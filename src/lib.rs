pub mod config;
pub mod db;
pub mod dialect;
pub mod error;
pub mod schema;
pub mod session;
pub mod tenant;

pub use error::{Error, Result};
