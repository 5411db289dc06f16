//! Testing support for the store.
//!
//! ```text
//! ┌──────────── Pair ────────────┐
//! │ Node (primary)  Node (standby)│
//! │   engine ◀── LocalTransport ──▶ engine
//! │   failpoints        failpoints│
//! └──────────────────────────────┘
//! ```
//!
//! [`failpoint`] is compiled into every build so engines can carry a
//! registry; the injection sites only act under `cfg(test)` or the
//! `failpoints` feature. The harness and end-to-end scenarios are test-only.

pub mod failpoint;

#[cfg(test)]
pub(crate) mod harness;

#[cfg(test)]
mod scenarios;

pub use failpoint::{FailpointAction, FailpointRegistry, FailpointResult, FailpointStats};
