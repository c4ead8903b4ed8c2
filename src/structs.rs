//! Schema driven encoding of little binary records.
//!
//! Protocol payloads are described as named struct types made of ordered
//! field definitions, each written as `"type name"` or `"type[count] name"`:
//!
//! ```
//! use piboot::structs::{Library, Record, Value};
//!
//! let mut lib = Library::new();
//! lib.define_type("point", &["int16le x", "int16le y"]).unwrap();
//! lib.define_type(
//!     "path",
//!     &["uint8 $n", "string name", "point[$n] points"],
//! )
//! .unwrap();
//!
//! let path = Record::new()
//!     .with("name", "triangle")
//!     .with(
//!         "points",
//!         vec![
//!             Value::from(Record::new().with("x", 0).with("y", 0)),
//!             Value::from(Record::new().with("x", 4).with("y", 0)),
//!             Value::from(Record::new().with("x", 0).with("y", -3)),
//!         ],
//!     );
//! let bytes = lib.encode("path", &path).unwrap();
//! assert_eq!(bytes[0], 3);
//! assert_eq!(lib.decode("path", &bytes).unwrap(), path);
//! ```
//!
//! Built-in field types are `uint8`, `int8`, `uint16le`, `uint16be`,
//! `int16le`, `int16be`, `uint32le`, `uint32be`, `int32le`, `int32be`,
//! `floatle`, `floatbe`, `doublele`, `doublebe` and `string` (NUL terminated
//! UTF-8). Any previously defined struct type can be used as a field type.
//!
//! An array count is either a literal, the name of an earlier integer field,
//! or the name of an earlier `$` field. `$` fields are transient: the encoder
//! fills them in from the length of the array that uses them, and the decoder
//! consumes them without putting them in the decoded record.

mod library;
mod schema;
mod value;

pub use library::Library;
pub use schema::{Count, Field, FieldType, Scalar, StructType};
pub use value::{Record, Value};

/// Result type alias for the struct codec.
pub type StructResult<T> = Result<T, crate::error::StructError>;
