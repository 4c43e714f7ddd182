//! Path multiplexing for the pathway reverse proxy
//!
//! Maps slash-delimited request paths onto registered backends using
//! longest-match semantics. Exact routes match only their own path; prefix
//! routes match their path and every descendant.

pub mod mux;
pub mod trie;

pub use mux::{Backend, BackendId, Mux};
pub use trie::Trie;
