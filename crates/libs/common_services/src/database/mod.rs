//! Postgres implementations of the storage traits.

mod stores;
mod tables;
mod utils;

pub use stores::*;
pub use tables::*;
pub use utils::*;
