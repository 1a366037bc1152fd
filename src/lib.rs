pub mod auth;
pub mod config;
pub mod controller;
pub mod error;
pub mod listener;
pub mod logging;
pub mod relay;
pub mod sanitizer;
pub mod session;
pub mod smtp;

pub use tracing;
