#![deny(clippy::unwrap_used)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

pub mod backoff;
pub mod context;
pub mod demo;
pub mod handlers;
pub mod jobs;
pub mod worker;
