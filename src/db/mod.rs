mod connection;
mod cursor;
pub mod namespace;
mod target;

pub use connection::*;
pub use cursor::*;
pub use namespace::{TableNames, TablePrefixer};
pub use target::*;
