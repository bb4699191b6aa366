//! Core types shared by the JitSpill crates: errors, identities and configuration.

pub mod config;
pub mod error;
pub mod ids;

pub use config::SpillConfig;
pub use error::{CoreError, CoreResult};
pub use ids::{BufferId, ProxyId};
