//! Vendor adapters for the abstract vector-backend contract.
//!
//! Each adapter is a thin mapping from `search`/`upsert` to one vendor's
//! wire shape. The `local` store runs against the embedded chunk database
//! and needs no external service.

pub mod chroma;
pub mod local;
pub mod milvus;
pub mod pgvector;
pub mod qdrant;
pub mod weaviate;

pub use chroma::ChromaBackend;
pub use local::LocalVectorStore;
pub use milvus::MilvusBackend;
pub use pgvector::PgVectorBackend;
pub use qdrant::QdrantBackend;
pub use weaviate::WeaviateBackend;
