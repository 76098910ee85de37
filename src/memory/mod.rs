// ============================================================================
// In-Memory Store
// ============================================================================
//
// Reference implementation of every store contract:
//
//   MemoryDatabase         tables, connections, journal
//   MemoryTransaction      TransactionHandle with pending changes
//   MemorySession          Session with change tracking and filtered reads
//   MemorySessionResolver  SessionResolver keyed by connection string
//
// Whether sessions on one connection can share a transaction is a switch on
// the database, so both coordinator paths can be exercised.
//
// ============================================================================

pub mod change;
pub mod database;
pub mod entity;
pub mod filter;
pub mod resolver;
pub mod session;
pub mod transaction;

pub use change::Change;
pub use database::{JournalEntry, MemoryConnection, MemoryDatabase};
pub use entity::{Entity, Tenancy};
pub use filter::MemoryFilterExecutor;
pub use resolver::MemorySessionResolver;
pub use session::MemorySession;
pub use transaction::{MemoryTransaction, TransactionId, TransactionState};
