pub mod message;
pub mod fragment;
pub mod job;
pub mod state;

pub use message::{Conversation, Feedback, Message, MessageRole, Metadata};
pub use fragment::{ChatFragment, FragmentType};
pub use job::{JobEvent, JobEventSink, JobPatch, JobStatus, ProcessingJob};
pub use state::{ConnectionState, NetworkStatus};
