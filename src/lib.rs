pub mod board;
pub mod config;
pub mod errors;
pub mod event;
pub mod reader;
pub mod session;
pub mod sim;
pub mod trigger;
pub mod utils;
pub mod waveform;
pub mod writer;

#[cfg(test)]
pub(crate) mod mock;

pub use board::*;
pub use config::*;
pub use errors::*;
pub use event::*;
pub use reader::*;
pub use session::*;
pub use sim::*;
pub use trigger::*;
pub use utils::*;
pub use waveform::*;
pub use writer::*;
