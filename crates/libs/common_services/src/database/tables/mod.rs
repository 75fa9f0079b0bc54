mod person;
mod photo;
mod task;

pub use person::*;
pub use photo::*;
pub use task::*;
