// ============================================================================
// Replicated Table State Machine
// ============================================================================
//
// `ReliableTable` binds one logical name to one physical table and speaks the
// replication framework's state-provider contract. Speculative writes live in
// the in-flight registry between pre-apply and apply; copy streams ship the
// full state to new replicas.
//
// ============================================================================

pub mod copy_stream;
pub mod naming;
pub mod registry;
pub mod reliable_table;

pub use copy_stream::CopyStream;
pub use naming::table_name_for;
pub use registry::{InFlightRegistry, OperationContext};
pub use reliable_table::ReliableTable;
