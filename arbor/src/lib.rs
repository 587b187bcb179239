//! Threaded broadcast chat over newline-delimited JSON.
//!
//! A server keeps a tree of chat messages and relays new ones to every
//! connected client. Clients rebuild a thread from whatever they have seen
//! and ask the server for missing ancestors one at a time.
//!
//! - [`message`] defines [`message::ChatMessage`], one node of the tree.
//! - [`store`] and [`tree`] hold messages and their parent/child links.
//! - [`protocol`] is the wire envelope and its per-kind validation.
//! - [`io`] serializes envelope reads and writes over a byte stream.
//! - [`broadcaster`] fans frames out to connected peers.
//! - [`server`] accepts connections and dispatches envelopes by kind.
//! - [`client`] tracks a client's view of the tree and runs the terminal client.
//! - [`cli`] parses the command line for both modes.

pub mod broadcaster;
pub mod cli;
pub mod client;
pub mod error;
pub mod io;
pub mod message;
pub mod protocol;
pub mod server;
pub mod store;
pub mod tree;
