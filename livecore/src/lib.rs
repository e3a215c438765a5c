pub mod envelope;
pub mod error;
pub mod framing;
pub mod key;
pub mod merge;
pub mod net;
pub mod protocol;
pub mod sse;
pub mod types;
pub mod value;

pub use envelope::PushEnvelope;
pub use error::{MalformedEventError, UnsupportedEventKind};
pub use key::{QueryKey, ResourceKind};
pub use protocol::ClientEvent;
pub use types::events::PushEvent;
pub use value::CachedValue;
