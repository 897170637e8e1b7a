//! Polling update coordinator
//!
//! A [`DataUpdateCoordinator`] periodically (or on demand) fetches one
//! snapshot of vendor state through a [`DataSource`], keeps the latest good
//! snapshot and notifies its listeners once per completed fetch.
//!
//! # Key Types
//!
//! - [`DataUpdateCoordinator`] - Scheduling, in-flight dedup and fan-out
//! - [`DataSource`] - The vendor adapter the coordinator polls
//! - [`UpdateError`] - Classified fetch failure
//! - [`CoordinatorConfig`] - Interval, timeout and debounce settings
//! - [`CoordinatorEntity`] - An entity rendering one field of the snapshot
//! - [`PushSender`] - Thread-safe push hand-off into a coordinator

pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod entity;
pub mod error;
pub mod listener;
pub mod push;
pub mod source;

pub use config::{CoordinatorConfig, CONF_SCAN_INTERVAL, DEFAULT_REQUEST_TIMEOUT};
pub use coordinator::{CoordinatorBuilder, DataEq, DataUpdateCoordinator};
pub use debounce::{DebouncedFn, Debouncer};
pub use entity::{CoordinatorEntity, EntityDescription};
pub use error::UpdateError;
pub use listener::{ListenerCallback, ListenerId, RemoveListener};
pub use push::{PushClosed, PushSender};
pub use source::{DataSource, FnSource};
