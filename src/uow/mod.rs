pub mod active;
pub mod context;
pub mod events;
pub mod manager;
pub mod options;
pub mod state;

pub use active::{ActiveUnitOfWork, StoreResolvers};
pub use context::UnitOfWorkContext;
pub use events::UnitOfWorkEvents;
pub use manager::{UnitOfWorkHandle, UnitOfWorkManager};
pub use options::{TransactionScopeOption, UnitOfWorkDefaultOptions, UnitOfWorkOptions};
pub use state::{UnitOfWorkId, UnitOfWorkState};
