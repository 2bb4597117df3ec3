pub mod error;
pub mod credentials;
pub mod store;
pub mod accumulator;
pub mod controller;

pub use error::{ChatError, Result};
pub use credentials::{CredentialProvider, NoCredentials, StaticToken};
pub use store::{ConversationStore, ConversationUpdate};
pub use accumulator::TurnAccumulator;
pub use controller::{ChatConfig, ChatStreamController, TurnOutcome};
