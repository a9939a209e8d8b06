pub mod client_ip;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod dedup;
pub mod error;
pub mod gatekeeper;
pub mod health;
pub mod lock;
pub mod normalize;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod store;
pub mod validation;
pub mod webhook;

pub use config::Config;
pub use dedup::{DedupConfig, DedupCoordinator};
pub use error::{Dimension, GatekeeperError, Result};
pub use gatekeeper::{Gatekeeper, MaintenanceReport};
pub use lock::{LockManager, LockToken};
pub use rate_limit_config::{RateLimitConfig, RateLimitRule};
pub use rate_limiter::{RateLimitStatus, RateLimiter};
pub use webhook::{WebhookConfig, WebhookEngine};
