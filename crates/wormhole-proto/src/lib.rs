pub mod error;
pub mod messages;
pub mod welcome;

pub use error::ClientError;
pub use messages::{ClientCommand, ClientFrame, ParseError, ServerMessage};
pub use welcome::WelcomeInfo;
