//! Retrieval-augmented generation: the abstract vector-backend contract,
//! the per-vendor adapters, and the retriever that merges ranked chunk
//! matches across backends.

pub mod backend;
pub mod backends;
pub mod context;
pub mod retriever;
pub mod types;

pub use backend::{BackendHit, BackendKind, BackendRegistry, VectorBackend, VectorDbConfig};
pub use retriever::Retriever;
pub use types::Reference;
