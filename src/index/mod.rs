pub mod ann;
pub mod cache;
pub mod persistence;
pub mod store;
pub mod write_queue;

pub use ann::AnnIndex;
pub use cache::TenantCache;
pub use store::{IndexStore, SearchOptions};
pub use write_queue::{
    create_write_queue, BatchApplyFn, WriteQueueHandle, WriteQueueOptions,
};
