//! Data model shared by every provider: object metadata and byte ranges.

mod metadata;
mod range;

pub use self::metadata::{ObjectMetadata, ObjectType};
pub use self::range::ByteRange;
