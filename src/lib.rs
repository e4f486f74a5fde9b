//! Mail Gateway: drive request handlers by email.

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod mail;
pub mod models;
pub mod store;
