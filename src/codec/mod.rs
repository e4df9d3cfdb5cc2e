pub mod localmap;
pub mod record;

pub use localmap::LocalMapUpdate;
pub use record::{Record, RecordPayload, ValueType};
