use crate::connection::BrokerError;
use crate::transport::TransportError;

/// Pool error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self(err.into())
    }
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        Self(err.into())
    }
}

impl From<deadpool::managed::PoolError<Error>> for Error {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            err => Self(err.into()),
        }
    }
}

impl From<deadpool::managed::BuildError<Error>> for Error {
    fn from(err: deadpool::managed::BuildError<Error>) -> Self {
        Self(err.into())
    }
}
