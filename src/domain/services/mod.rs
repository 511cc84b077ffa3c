mod event_stream_decoder;
mod session_controller;
mod transcript;

pub use event_stream_decoder::*;
pub use session_controller::*;
pub use transcript::*;
