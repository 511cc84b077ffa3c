mod event;
mod message;
mod relay;
mod session;
mod slash_commands;
mod stream_event;
mod upstream;

pub use event::*;
pub use message::*;
pub use relay::*;
pub use session::*;
pub use slash_commands::*;
pub use stream_event::*;
pub use upstream::*;
