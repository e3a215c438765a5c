pub use livecore::{self, CachedValue, ClientEvent, PushEnvelope, PushEvent, QueryKey, ResourceKind};

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod handle;
pub mod http;
pub mod notifications;
pub mod query;
pub mod registry;
pub mod router;
pub mod socket;
pub mod stream;
pub mod transport;

pub use client::{SyncClient, SyncClientBuilder};
pub use config::SyncConfig;
pub use error::{ConnectionError, FetchError, SubscribeError, TeardownError};
pub use registry::{Subscription, SubscriptionRegistry};
