//! Core host types for coordinated integrations
//!
//! This crate provides the value types shared between the host and the
//! integrations that feed it: [`EntityId`], [`State`] and [`DeviceInfo`].

mod device_info;
mod entity_id;
mod state;

pub use device_info::DeviceInfo;
pub use entity_id::{slugify, EntityId, EntityIdError};
pub use state::{Attributes, State};

/// State value reported by an entity whose source is currently failing
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value reported by an entity that has no value yet
pub const STATE_UNKNOWN: &str = "unknown";

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;
