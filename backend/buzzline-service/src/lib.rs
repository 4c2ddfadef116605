//! Buzzline: a demo producer that publishes a random sentence every interval
//! and a consumer that logs each one, both built on `event_stream`.

pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod logging;
pub mod producer;
pub mod sentences;
pub mod signal;

pub use config::BuzzlineConfig;
pub use error::{AppError, SetupError};
