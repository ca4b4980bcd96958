pub mod cancel;
pub mod completion;
pub mod openai;
pub mod provider;
pub mod types;

pub use cancel::{cancel_channel, CancelHandle, CancelSignal};
pub use completion::{CompletionClient, CompletionOutcome, Finish};
pub use openai::OpenAiProvider;
pub use provider::ChatProvider;
pub use types::{ChatMessage, ChatRequest};
