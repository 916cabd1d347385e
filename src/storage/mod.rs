pub mod engine;
pub mod memory;
pub mod persistence;
pub mod registry;
pub mod retry;

pub use engine::PersistentStore;
pub use memory::MemoryStore;
pub use persistence::FileStore;
pub use registry::{EnvironmentHandle, StoreEnvironment, StoreRegistry};
pub use retry::{RetryPolicy, RetryState};
