#![deny(clippy::unwrap_used)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_sign_loss,
    clippy::module_inception,
    clippy::struct_excessive_bools,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap
)]

pub mod backend;
pub mod classifier;
pub mod clustering;
pub mod database;
pub mod lease;
pub mod metadata;
pub mod queue;
pub mod search;
pub mod upload;
pub mod utils;
