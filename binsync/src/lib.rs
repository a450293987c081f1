//! binsync - per-source worker agent for binlog migration fleets.
//!
//! A fleet control plane records the desired state of every *source* (an
//! upstream binlog endpoint) and *subtask* (a migration pipeline bound to a
//! source) in a replicated coordination store. The worker in this crate is
//! the local actor bound to one source: it drives the source's relay stream
//! and subtasks from their observed stage toward the expected stage in the
//! store, and re-converges whenever the store or a local pipeline changes.
//!
//! # Architecture
//!
//! ```text
//! coordination store ──watch/read──► StageFollower (subtask) ─┐
//!                    ──watch/read──► StageFollower (relay)   ─┤
//! control-plane RPCs ───────────────────────────────────────►│
//!                                                            ▼
//!                                                    Worker (writer lock)
//!                                      ┌─────────┬───────────┴─┬──────────┐
//!                                      ▼         ▼             ▼          ▼
//!                                SubTaskHolder RelayHolder RelayPurger Checker
//! ```
//!
//! The migration pipelines and the relay stream process are external; the
//! worker drives them through the seams in [`factory`] and
//! [`subtask::Pipeline`] / [`relay::RelayUnit`].

pub mod binlog;
pub mod config;
pub mod factory;
pub mod logging;
pub mod metrics;
pub mod relay;
pub mod stage;
pub mod store;
pub mod subtask;
pub mod worker;

/// Crate version, injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
