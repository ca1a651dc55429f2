pub mod base;
pub mod dns;
pub mod engine;
pub mod error;
pub mod health;
pub mod latency;
mod metrics;
pub mod retry;
pub mod traceroute;

#[cfg(test)]
mod testutil;

use schemars::schema::RootSchema;
use sparrow_commons::CheckKind;

pub use base::Check;
pub use engine::{
    CheckFactory,
    Engine,
};
pub use error::CheckError;
pub use retry::{
    retry,
    RetryError,
};

/// JSON schema of the result `data` payload for one check kind.
pub fn data_schema(kind: CheckKind) -> RootSchema {
    match kind {
        CheckKind::Health => health::data_schema(),
        CheckKind::Latency => latency::data_schema(),
        CheckKind::Dns => dns::data_schema(),
        CheckKind::Traceroute => traceroute::data_schema(),
    }
}
