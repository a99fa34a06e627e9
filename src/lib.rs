pub mod api_keys;
pub mod clock;
pub mod config;
pub mod context;
pub mod csrf;
pub mod db;
pub mod error;
pub mod middleware;
pub mod rate_limit;
pub mod session;

pub use api_keys::{ApiKey, ApiKeyAuthenticator, NewApiKey};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AccessConfig;
pub use context::{AuthSource, AuthorizationContext, Scope};
pub use csrf::CsrfProtection;
pub use db::Database;
pub use error::{AccessError, AccessResult, StoreError};
pub use middleware::{access_control_middleware, AccessControl, Decision, InboundRequest};
pub use rate_limit::{Limit, RateLimiter};
pub use session::{MemorySession, SessionHandle, SessionStore};
