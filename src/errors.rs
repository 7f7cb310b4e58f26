use std::fmt;
use std::io;

/// Everything that can end an acquisition run early.
///
/// Spurious triggers and cancellation are not errors, they are handled
/// inside the acquisition loop.
#[derive(Debug)]
pub enum DaqError {
    /// Discovery returned an empty chain.
    NoBoards,
    /// Board generation predates trigger support (pre-V4 evaluation boards).
    IncompatibleBoard { serial: u16, board_type: u8 },
    InvalidConfig(String),
    /// Serialized record length disagrees with the topology the encoder was built for.
    EncodingMismatch { expected: usize, actual: usize },
    /// Fault reported by the board collaborator.
    Board(String),
    /// The interrupt handler could not be installed.
    Signal(String),
    Io(io::Error),
}

impl DaqError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            DaqError::NoBoards => 2,
            DaqError::IncompatibleBoard { .. } => 3,
            DaqError::Io(_) => 4,
            DaqError::InvalidConfig(_) => 5,
            DaqError::EncodingMismatch { .. } | DaqError::Board(_) | DaqError::Signal(_) => 1,
        }
    }
}

impl fmt::Display for DaqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaqError::NoBoards => write!(f, "no DRS4 evaluation board found"),
            DaqError::IncompatibleBoard { serial, board_type } => write!(
                f,
                "board #{serial} has type {board_type}, pre-V4 boards have no trigger support"
            ),
            DaqError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            DaqError::EncodingMismatch { expected, actual } => write!(
                f,
                "encoded record is {actual} bytes, topology requires {expected}"
            ),
            DaqError::Board(msg) => write!(f, "board error: {msg}"),
            DaqError::Signal(msg) => write!(f, "cannot install interrupt handler: {msg}"),
            DaqError::Io(err) => write!(f, "output I/O error: {err}"),
        }
    }
}

impl std::error::Error for DaqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaqError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DaqError {
    fn from(err: io::Error) -> Self {
        DaqError::Io(err)
    }
}

/// Failures while parsing a data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The stream ends inside a record.
    StreamTooShort { pos: usize, needed: usize },
    UnexpectedTag { pos: usize, found: Vec<u8> },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::StreamTooShort { pos, needed } => {
                write!(f, "stream ends at byte {pos}, {needed} more bytes needed")
            }
            DecodeError::UnexpectedTag { pos, found } => write!(
                f,
                "unexpected tag {:?} at byte {pos}",
                String::from_utf8_lossy(found)
            ),
        }
    }
}

impl std::error::Error for DecodeError {}
