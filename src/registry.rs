pub mod file_lock;
pub mod types;
pub mod user_registry;

pub use types::{IdentityLookup, UserRecord};
pub use user_registry::UserRegistry;
