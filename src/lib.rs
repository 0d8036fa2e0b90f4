#![allow(clippy::uninlined_format_args)]

pub mod auth;
pub mod config;
pub mod content;
pub mod data;
pub mod proxy;
pub mod reddit;
pub mod session;
pub mod storage;
pub mod vote;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
