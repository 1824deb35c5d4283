// HTTP API modules

pub mod callbacks;
pub mod common;
pub mod workflows;

pub use common::{ErrorKind, ErrorResponse};
