use failure::{Backtrace, Context, Fail};
use std::fmt;

#[derive(Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "peer sent a malformed wire message")]
    InvalidPeerMessage,

    #[fail(display = "operation attempted while the connection was not in the required state")]
    InvalidStatus,

    #[fail(display = "i/o error on the peer connection")]
    Io,

    #[fail(display = "underlying bencode error")]
    Encoding,

    #[fail(display = "ring buffer overflow")]
    Overflow,
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

impl From<std::io::Error> for Error {
    fn from(cause: std::io::Error) -> Error {
        Error {
            inner: cause.context(ErrorKind::Io),
        }
    }
}

impl From<crate::ring::OverflowError> for Error {
    fn from(cause: crate::ring::OverflowError) -> Error {
        Error {
            inner: cause.context(ErrorKind::Overflow),
        }
    }
}

impl From<krpc_encoding::Error> for Error {
    fn from(_: krpc_encoding::Error) -> Error {
        ErrorKind::Encoding.into()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
