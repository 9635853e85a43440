pub mod event;
pub mod path;

pub use event::{Event, FailedEvent, ObjectMap, TokenId};
pub use path::JsonPath;
