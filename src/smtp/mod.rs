//! The client facing side of the proxy: ESMTP framing, replies and the
//! per-connection command loop.

pub mod command;
pub mod connection;
pub mod extensions;
pub mod handler;
pub mod status;

pub use self::handler::Handler;
