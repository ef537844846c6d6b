//! Wire types shared between the Outpost daemon and its clients.
//!
//! This crate is deliberately free of I/O: it defines the frame shapes,
//! method names, event payloads and the closed error-code set, and nothing
//! else. Both the server and the CLI client depend on it so the two sides
//! cannot drift apart.

mod protocol;

pub use protocol::*;
