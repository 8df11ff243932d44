//! Low-level NNTP line protocol (spec §4.1/§4.3, glossary "NNTP").
//!
//! This module knows nothing about pooling, yEnc, or usage types — it is
//! the wire-protocol layer the pool hands out connections over.

mod client;

pub use client::{NntpConnection, NntpStatusLine};
