//! Browser process management and CDP plumbing.
//!
//! `launcher` brings up one browser per account profile with a fixed
//! debugging port; `connection` attaches over CDP and drains the event
//! handler; `input` synthesises raw mouse and keyboard events.

pub mod connection;
pub mod input;
pub mod launcher;

pub use connection::attach;
pub use launcher::{launch, LaunchSpec, SessionBrowser};
