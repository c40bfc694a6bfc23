//! Linking between two streams
//!
//! [`StandardLink`] is the `si-standard-link` kind: it acquires both streams
//! from their endpoints, pairs their ports with [`match_ports`] and creates
//! one native link per pair.

mod matching;
mod standard;

pub use matching::match_ports;
pub use standard::StandardLink;
