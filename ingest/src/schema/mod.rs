//! Event-to-schema transforms: flattening, typing, mapping, table name
//! templating, and the processor composing them.

pub mod flatten;
pub mod mapper;
pub mod processor;
pub mod template;
pub mod typing;

pub use flatten::{Flattener, sanitize_identifier};
pub use mapper::FieldMapper;
pub use processor::{
    BatchHeader, ParseFn, ProcessedGroup, ProcessedPayload, Processor, parse_fallback, parse_json,
};
pub use template::{DEFAULT_TABLE_NAME, TableNameTemplate};
pub use typing::{DataType, TypeResolver, parse_timestamp};
