pub mod classify;
pub mod engine;
pub mod preprocess;
pub mod sign;
pub mod state;
pub mod stats;
pub mod upstream;
pub mod user_store;

pub use engine::{InboundRequest, ProxyEngine, ProxyOutcome};
pub use state::AppState;
pub use upstream::{
    Headers, UpstreamClient, UpstreamFailure, UpstreamHttpRequest, UpstreamHttpResponse,
    UpstreamBody, WreqUpstreamClient,
};
pub use user_store::{NoopUserStore, UserStore};
