pub mod filter;
pub mod store;

pub use filter::{Condition, Filter};
pub use store::{ChildPayload, ScoredPoint, ScrollPage, VectorPoint, VectorStore};
