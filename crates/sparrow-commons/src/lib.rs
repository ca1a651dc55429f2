pub mod models;
pub mod utils;

pub use models::check::{
    CheckConfig,
    CheckKind,
    DnsConfig,
    HealthConfig,
    LatencyConfig,
    RetryConfig,
    TracerouteConfig,
    TracerouteProtocol,
    TracerouteTarget,
    ValidationError,
};
pub use models::peer::PeerRecord;
pub use models::result::{
    CheckResult,
    DnsData,
    DnsResult,
    HealthData,
    HealthStatus,
    Hop,
    HopAddress,
    LatencyData,
    LatencyResult,
    ResultEnvelope,
    TracerouteData,
    TracerouteResult,
};
pub use models::runtime::{
    ConfigDocument,
    DocumentError,
    RuntimeConfig,
};
