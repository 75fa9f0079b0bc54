mod lease_store;
mod person_store;
mod photo_store;
mod task_queue;

pub use lease_store::PgLeaseManager;
pub use person_store::PgClusterStore;
pub use photo_store::PgMetadataStore;
pub use task_queue::PgTaskQueue;
