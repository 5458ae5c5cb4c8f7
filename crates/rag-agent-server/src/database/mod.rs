pub mod conversation;
pub mod graph;
pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod routes;

pub use conversation::ConversationStore;
pub use graph::GraphStore;
pub use memory::MemoryStore;
pub use models::*;
pub use pool::DbPool;
pub use repository::Repository;
pub use routes::RouteStore;
