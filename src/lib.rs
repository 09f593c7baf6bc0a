//! replymux - request/reply multiplexing over RabbitMQ
//!
//! Publishes requests to a work queue and routes every reply, arriving on a
//! single shared reply queue, back to the request that produced it by
//! correlation id.

pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod utils;

pub use client::{ReplyHandle, ReplyStream, RmqClient};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
