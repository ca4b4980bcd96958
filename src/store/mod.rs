pub mod chunks;
pub mod sessions;

pub use chunks::{ChunkStore, DocumentChunk};
pub use sessions::{Message, Sender, Session, SessionStore, TurnMetrics};
