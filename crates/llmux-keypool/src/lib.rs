mod checker;
mod events;
mod pool;
mod record;
mod registry;

pub use checker::spawn_recheckers;
pub use events::{KeyEvent, KeyEventHub, KeyEventKind};
pub use pool::{AcquireError, DisableReason, ServicePool, KEY_REUSE_DELAY};
pub use record::{
    AwsLoggingStatus, FamilyUsage, KeyExtra, KeyPatch, KeyRecord, KeySecret, default_families,
};
pub use registry::KeyPool;
