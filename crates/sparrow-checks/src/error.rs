use sparrow_commons::{
    CheckKind,
    ValidationError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckError {
    /// A config for one kind was handed to a check of another kind.
    #[error("config for `{got}` handed to `{expected}` check")]
    ConfigMismatch {
        expected: CheckKind,
        got: CheckKind,
    },

    #[error(transparent)]
    InvalidConfig(#[from] ValidationError),

    #[error("no factory registered for kind `{0}`")]
    UnknownKind(CheckKind),

    #[error("failed to build metric collectors: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("check `{kind}` terminated: {reason}")]
    Terminal { kind: CheckKind, reason: String },
}
