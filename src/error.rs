use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::AddrParseError;
use std::num::ParseIntError;

#[derive(Debug)]
pub struct Error {
    err: Box<ErrorKind>,
}

#[derive(Debug)]
pub enum ErrorKind {
    StringError(String),
    IOError(io::Error),
    AddrParseError(AddrParseError),
    ParseIntError(ParseIntError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(s.to_string())),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    /// True if this error wraps an `io::Error` whose raw OS error is `EINTR`.
    pub fn is_interrupted(&self) -> bool {
        matches!(&*self.err, ErrorKind::IOError(e) if e.kind() == io::ErrorKind::Interrupted)
    }

    /// True if this error wraps an `io::Error` that means "would block" (EAGAIN/EWOULDBLOCK).
    pub fn is_would_block(&self) -> bool {
        matches!(&*self.err, ErrorKind::IOError(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(String::from(err))),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::IOError(err)),
        }
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error {
            err: Box::new(ErrorKind::AddrParseError(err)),
        }
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Error {
            err: Box::new(ErrorKind::ParseIntError(err)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::IOError(e) => Display::fmt(e, f),
            ErrorKind::AddrParseError(e) => Display::fmt(e, f),
            ErrorKind::ParseIntError(e) => Display::fmt(e, f),
        }
    }
}

impl std::error::Error for Error {}
