mod client;
mod record;

pub use client::{ApiErrorClass, ConversationPage, ConvoClient, ConvoError, UpdatedWindow};
pub use record::{ConversationRecord, ConversationState};
