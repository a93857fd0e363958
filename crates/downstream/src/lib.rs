pub mod provider;
pub mod record;

pub use provider::{ProviderClient, ProviderError, ProviderStatus};
pub use record::{DownstreamAck, ForwardError, RecordClient};
