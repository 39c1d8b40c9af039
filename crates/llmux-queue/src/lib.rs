mod dispatcher;
mod estimator;
mod queue;

pub use dispatcher::spawn_dispatcher;
pub use estimator::WaitEstimator;
pub use queue::{AdmissionQueue, DISPATCH_TICK, PartitionStats, Ticket};
