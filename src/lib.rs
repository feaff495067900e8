//! Session and request correlation for out-of-process translation and ML engines.

pub mod channel;
pub mod child;
pub mod config;
pub mod consts;
pub mod deferred;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod extract;
pub mod id;
pub mod protocol;
pub mod session;
