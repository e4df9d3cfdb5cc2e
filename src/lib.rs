//! Client library for the Fallout 4 Pip-Boy companion protocol: a binary
//! tree-mutation codec, a shared value-graph materializer, the connection
//! state machine, and a relay mode that re-serves the tree to further
//! downstream clients.

pub mod channel;
pub mod client;
pub mod codec;
pub mod command;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod relay;
pub mod tree;
pub mod wire;

pub use client::PipboyClient;
pub use error::{Error, Result};
