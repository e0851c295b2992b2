#![doc = include_str!("../README.md")]

mod action;
mod batcher;
mod cache;
mod client;
mod config;
mod coordinator;
mod error;
mod session;
mod transport;
mod unit;

pub use crate::action::*;
pub use crate::batcher::*;
pub use crate::cache::*;
pub use crate::client::*;
pub use crate::config::*;
pub use crate::error::*;
pub use crate::session::*;
pub use crate::transport::*;
pub use crate::unit::*;
