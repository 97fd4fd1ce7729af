pub mod backup;
pub mod persistence;
pub mod pool;
pub mod store;
pub mod table;

pub use backup::{BackupManifest, restore_from};
pub use persistence::DurabilityMode;
pub use pool::{PersistentTablePool, PoolStats};
pub use store::PersistentStore;
pub use table::{PersistentTable, TableCursor};
