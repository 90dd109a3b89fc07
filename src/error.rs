use std::fmt;

#[derive(Debug)]
pub enum Error {
    Http(reqwest::Error),
    /// Every candidate endpoint failed at the transport level; the gateway
    /// itself is unreachable and the previous snapshot stays in place.
    Unreachable { host: String },
    /// The auth collaborator reports its credential is no longer valid.
    AuthRequired,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Unreachable { host } => write!(f, "gateway unreachable: {host}"),
            Error::AuthRequired => write!(f, "authentication required"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
