#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod coap;
pub mod encoding;
pub mod error;
pub mod net;
pub mod raft;
pub mod storage;

pub use error::{Error, Result};
pub use raft::Node;
