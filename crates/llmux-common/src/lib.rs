mod config;
mod error;
mod family;
mod models;
mod service;

pub use config::GlobalConfig;
pub use error::ProxyError;
pub use family::ModelFamily;
pub use models::{FamilyCost, ModelRegistry, family_cost, maybe_reassign_model};
pub use service::{Dialect, Service};
