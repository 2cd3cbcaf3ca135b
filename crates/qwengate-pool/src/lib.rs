//! Identity pool: a fleet of (token, cookie) credential pairs with health
//! tracking, round-robin selection, failure classification, and background
//! token refresh.

pub mod exchange;
pub mod identity;
pub mod pool;

pub use exchange::{ExchangeError, RefreshedToken, TokenExchanger};
pub use identity::{HealthState, Identity};
pub use pool::{FailureKind, IdentityPool, PoolStatus, RefreshOutcome};
