use std::fmt;
use std::io;
use std::result::Result as StdResult;

pub type Result<T> = StdResult<T, Error>;

/// Error domain of the I/O core.
///
/// Setup failures (init, bind, option setters, arming accept) are returned
/// directly from the call; failures discovered while an operation is in
/// flight are delivered to the caller-supplied handler, exactly once.
/// The platform would-block signal is never surfaced through this type;
/// it is absorbed internally as the retry trigger.
#[derive(Debug)]
pub enum Error {
    /// Misuse of the API sequencing, e.g. accepting before init/bind.
    InvalidArgument,
    /// The readiness backend rejected a registration or poll call.
    Backend(io::Error),
    /// A socket option could not be set.
    Option(io::Error),
    /// Handle creation failed.
    Init(io::Error),
    Bind(io::Error),
    Listen(io::Error),
    Accept(io::Error),
    /// Transport failure surfaced to a read/write handler.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "Invalid Argument"),
            Error::Backend(e) => write!(f, "Backend Error: {}", e),
            Error::Option(e) => write!(f, "Socket Option Error: {}", e),
            Error::Init(e) => write!(f, "Init Error: {}", e),
            Error::Bind(e) => write!(f, "Bind Error: {}", e),
            Error::Listen(e) => write!(f, "Listen Error: {}", e),
            Error::Accept(e) => write!(f, "Accept Error: {}", e),
            Error::Io(e) => write!(f, "IO Error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::InvalidArgument => None,
            Error::Backend(e)
            | Error::Option(e)
            | Error::Init(e)
            | Error::Bind(e)
            | Error::Listen(e)
            | Error::Accept(e)
            | Error::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
