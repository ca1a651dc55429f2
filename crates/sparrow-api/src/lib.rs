pub mod error;
pub mod healthz;
pub mod openapi;
pub mod server;

pub use error::ApiError;
pub use healthz::{
    HealthState,
    HealthzProber,
};
pub use server::{
    run_server,
    ApiConfig,
    CheckReader,
    TlsConfig,
};
