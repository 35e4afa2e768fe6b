pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod lease;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod strategy;
pub mod worker;

pub use error::{Error, Result};
