use failure::{Backtrace, Context, Fail};
use std::fmt;

/// Error kinds produced while parsing or encoding KRPC wire data.
#[derive(Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "node id must be exactly 40 hex digits")]
    InvalidFormat,

    #[fail(display = "node id must be exactly 20 raw bytes")]
    InvalidLength,

    #[fail(display = "node info compact form must be exactly 26 bytes")]
    InvalidNodeInfo,

    #[fail(display = "peer compact form must be exactly 6 bytes")]
    InvalidCompactPeer,

    #[fail(display = "bencoding could not be decoded")]
    InvalidBencoding,

    #[fail(display = "message did not match the expected krpc shape")]
    InvalidMessage,
}

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
