use failure::{Backtrace, Context, Fail};
use std::fmt;

#[derive(Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "failed to bind the dht udp socket")]
    BindError,

    #[fail(display = "node id must be exactly 40 hex digits")]
    InvalidFormat,

    #[fail(display = "system error: {}", message)]
    SystemError { message: String },

    #[fail(display = "info-hash log store error")]
    StoreError,

    #[fail(display = "krpc transport error")]
    Krpc,

    #[fail(display = "peer wire protocol error")]
    PeerWire,
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
    fn from(_: std::io::Error) -> Error {
        ErrorKind::StoreError.into()
    }
}

impl From<tokio_krpc::Error> for Error {
    fn from(_: tokio_krpc::Error) -> Error {
        ErrorKind::Krpc.into()
    }
}

impl From<peer_wire::Error> for Error {
    fn from(_: peer_wire::Error) -> Error {
        ErrorKind::PeerWire.into()
    }
}

impl From<krpc_encoding::Error> for Error {
    fn from(_: krpc_encoding::Error) -> Error {
        ErrorKind::InvalidFormat.into()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
