pub mod error;
pub mod guard;

pub use error::{ErrorKind, Result, UowError};
pub(crate) use guard::lock;
pub use guard::RestoreGuard;
