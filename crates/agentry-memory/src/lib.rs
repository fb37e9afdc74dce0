pub mod recent_entity;
pub mod retriever;
pub mod store;

pub use recent_entity::RecentEntityTracker;
pub use retriever::{RetrievalWeights, Retriever, RetrieverConfig, ScoredMemory};
pub use store::{MemoryStore, SqliteMemoryStore};
