//! Signed webhook delivery with retry and backoff.

pub mod backoff;
pub mod engine;
pub mod redis_repository;
pub mod repository;
pub mod signature;
pub mod transport;
pub mod types;

pub use backoff::RetryPolicy;
pub use engine::{WebhookConfig, WebhookEngine};
pub use redis_repository::RedisWebhookRepository;
pub use repository::{MemoryWebhookRepository, WebhookRepository};
pub use transport::{DeliveryMode, HttpResponse, HttpTransport, ReqwestTransport};
pub use types::{Delivery, DeliveryStatus, SweepReport, Webhook, SUPPORTED_EVENTS};
