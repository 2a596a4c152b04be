//! Shared types for the dataset controller and its loader workers

pub mod conf;
pub mod consts;
mod errors;
pub mod models;

pub use conf::Conf;
pub use errors::Error;
