pub mod accountant;
pub mod types;

pub use accountant::TrafficAccountant;
pub use types::{Identity, RecordKind, SessionKey, TrafficRecord};
