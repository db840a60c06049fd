pub mod config;
pub mod counter;
pub mod envelope;
pub mod error;
pub mod field;
pub mod handshake;
pub mod noise;
pub mod share;
pub mod traffic_model;

pub use error::{PrivCountError, Result};
