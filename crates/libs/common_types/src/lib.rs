#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::struct_excessive_bools
)]
pub mod classification;
pub mod embedding;
pub mod person;
pub mod photo;
pub mod task;

pub use classification::*;
pub use embedding::*;
pub use person::*;
pub use photo::*;
pub use task::*;

/// Opaque photo identifier, assigned at upload.
pub type PhotoId = String;
/// Opaque person identifier, assigned by the clustering engine.
pub type PersonId = String;
pub type OwnerId = i32;
