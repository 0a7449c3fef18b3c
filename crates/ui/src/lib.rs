#![deny(unsafe_code)]

//! Terminal chat client for a local document-chat backend.

/// Session controller, stream reducer and view snapshots.
pub mod chat;
/// Settings persistence.
pub mod settings;
pub mod terminal;
