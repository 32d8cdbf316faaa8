//! Relays a local text stream over one or more duplex channels.
//!
//! A server accepts any number of clients and broadcasts each stdin line to
//! all of them; a client owns one channel. Both roles print whatever arrives
//! on stdout. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command line for both roles.
//! - [`registry`] keeps the ordered, lock-guarded set of live channels.
//! - [`relay`] implements the fan-out (broadcast) and fan-in (drain) loops
//!   and the task wiring around them.
//! - [`input`] provides local line sources: stdin or random chatter.
//! - [`transport`] defines the channel contract the relay consumes.
//! - [`gate`] is the TCP transport, with a WebSocket upgrade as circuit
//!   initialization; [`endpoint`] builds and parses its URLs.
//! - `memory` is an in-process channel for tests, built only for unit tests
//!   or with the `test-util` feature.
//! - [`node`] starts a server or client from configuration.

pub mod cli;
pub mod endpoint;
pub mod gate;
pub mod input;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod node;
pub mod registry;
pub mod relay;
pub mod transport;
