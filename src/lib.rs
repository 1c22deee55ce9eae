//! # Wordstat Sessions
//!
//! Session pool and automation core for harvesting keyword statistics
//! under multiple logged-in identities.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - `proxy` - proxy specification parsing
//! - `store` - embedded account store (sqlite, WAL, additive schema)
//! - `secrets` - credential file loading
//! - `browser` - profile launcher, CDP attachment, raw input
//! - `selectors` - ordered selector fallback shared by all page drivers
//! - `probe` - non-intrusive authentication check
//! - `captcha` - coordinate-CAPTCHA solving via an external HTTP service
//! - `login` - identity-provider login flow per account
//! - `pool` - the coordinator: owns sessions, hands out leases
//! - `events` - events to the UI collaborator and the secret-answer bridge
//!
//! The pool is the single owner of live sessions; everything below it is
//! a capability it composes. The UI, phrase editing and data migrations
//! live outside this crate and talk to it through `SessionPool`,
//! `CoreEvent` and `SecretAnswerBridge`.

pub mod browser;
pub mod captcha;
pub mod config;
pub mod error;
pub mod events;
pub mod login;
pub mod pool;
pub mod probe;
pub mod proxy;
pub mod secrets;
pub mod selectors;
pub mod store;
pub mod utils;

pub use captcha::Solver;
pub use config::{Config, Selectors};
pub use error::{CoreError, Result};
pub use events::{CoreEvent, EventSink, SecretAnswerBridge};
pub use pool::{Lease, ReleaseOutcome, SessionPool, SessionState};
pub use probe::ProbeOutcome;
pub use proxy::ProxyEndpoint;
pub use store::{AccountRecord, AccountStatus, AccountStore};
