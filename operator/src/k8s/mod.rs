//! The k8s facing half of the dataset controller

pub mod claims;
pub mod cluster;
pub mod controller;
pub mod jobs;
pub mod refs;
pub mod volumes;

#[cfg(test)]
pub mod fake;
