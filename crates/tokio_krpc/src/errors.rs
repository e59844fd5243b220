use failure::{Backtrace, Context, Fail};
use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Fail)]
pub enum ErrorKind {
    #[fail(display = "failed to bind udp socket")]
    BindError,

    #[fail(display = "failed to send datagram to {}", to)]
    SendError { to: SocketAddr },

    #[fail(display = "no transaction found with id {:?}", transaction_id)]
    TransactionError { transaction_id: Vec<u8> },

    #[fail(display = "transaction map mutex was poisoned")]
    LockPoisoned,

    #[fail(display = "received message did not match the shape of the query it answers")]
    InvalidMessage,

    #[fail(display = "underlying krpc encoding error")]
    Encoding,

    #[fail(display = "krpc peer returned an error: {}", message)]
    RemoteError { message: String },

    #[fail(display = "i/o error on the krpc socket")]
    Io,
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

impl From<krpc_encoding::Error> for Error {
    fn from(_: krpc_encoding::Error) -> Error {
        ErrorKind::Encoding.into()
    }
}

impl From<std::io::Error> for Error {
    fn from(cause: std::io::Error) -> Error {
        Error {
            inner: cause.context(ErrorKind::Io),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
