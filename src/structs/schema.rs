//! Field descriptors and the parser for field definition strings.

use std::str::FromStr;

use super::StructResult;
use crate::error::StructError;

/// Built-in field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    U8,
    I8,
    U16Le,
    U16Be,
    I16Le,
    I16Be,
    U32Le,
    U32Be,
    I32Le,
    I32Be,
    F32Le,
    F32Be,
    F64Le,
    F64Be,
    /// NUL terminated UTF-8.
    Str,
}

impl Scalar {
    /// Encoded size, `None` for strings.
    pub fn size(self) -> Option<usize> {
        use Scalar::*;
        match self {
            U8 | I8 => Some(1),
            U16Le | U16Be | I16Le | I16Be => Some(2),
            U32Le | U32Be | I32Le | I32Be | F32Le | F32Be => Some(4),
            F64Le | F64Be => Some(8),
            Str => None,
        }
    }

    pub fn is_integer(self) -> bool {
        use Scalar::*;
        !matches!(self, F32Le | F32Be | F64Le | F64Be | Str)
    }
}

impl FromStr for Scalar {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        use Scalar::*;
        Ok(match s {
            "uint8" => U8,
            "int8" => I8,
            "uint16le" => U16Le,
            "uint16be" => U16Be,
            "int16le" => I16Le,
            "int16be" => I16Be,
            "uint32le" => U32Le,
            "uint32be" => U32Be,
            "int32le" => I32Le,
            "int32be" => I32Be,
            "floatle" => F32Le,
            "floatbe" => F32Be,
            "doublele" => F64Le,
            "doublebe" => F64Be,
            "string" => Str,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Scalar(Scalar),
    /// A struct type registered in the same library.
    Struct(String),
}

/// Where an array field gets its element count from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Count {
    Fixed(usize),
    /// An earlier field of the record.
    Field(String),
    /// An earlier `$` field, not part of the record.
    Transient(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    pub count: Option<Count>,
}

impl Field {
    pub fn is_transient(&self) -> bool {
        self.name.starts_with('$')
    }

    /// Parse a definition such as `"uint32le size"` or `"string[$n] names"`.
    pub fn parse(definition: &str) -> StructResult<Field> {
        let invalid = |reason: &str| StructError::InvalidDefinition {
            definition: definition.to_owned(),
            reason: reason.to_owned(),
        };

        let mut parts = definition.split_whitespace();
        let (ty, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ty), Some(name), None) => (ty, name),
            _ => return Err(invalid("expected '<type> <name>'")),
        };
        if !is_identifier(name.trim_start_matches('$')) {
            return Err(invalid("bad field name"));
        }

        let (type_name, count) = match ty.find('[') {
            None => (ty, None),
            Some(open) => {
                let inner = ty[open + 1..]
                    .strip_suffix(']')
                    .ok_or_else(|| invalid("unclosed array count"))?;
                let count = if let Ok(n) = inner.parse::<usize>() {
                    Count::Fixed(n)
                } else if inner.starts_with('$') && is_identifier(&inner[1..]) {
                    Count::Transient(inner.to_owned())
                } else if is_identifier(inner) {
                    Count::Field(inner.to_owned())
                } else {
                    return Err(invalid("bad array count"));
                };
                (&ty[..open], Some(count))
            }
        };

        let ty = match type_name.parse::<Scalar>() {
            Ok(scalar) => FieldType::Scalar(scalar),
            Err(()) if is_identifier(type_name) => FieldType::Struct(type_name.to_owned()),
            Err(()) => return Err(invalid("bad type name")),
        };

        Ok(Field {
            name: name.to_owned(),
            ty,
            count,
        })
    }
}

/// A named, ordered list of fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<Field>,
    /// Encoded size when it does not depend on the values.
    pub fixed_size: Option<usize>,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn parse_plain_field() {
    let field = Field::parse("uint32le size").unwrap();
    assert_eq!(field.name, "size");
    assert_eq!(field.ty, FieldType::Scalar(Scalar::U32Le));
    assert_eq!(field.count, None);
}

#[test]
fn parse_array_counts() {
    let field = Field::parse("uint8[16] digest").unwrap();
    assert_eq!(field.count, Some(Count::Fixed(16)));

    let field = Field::parse("point[len] points").unwrap();
    assert_eq!(field.ty, FieldType::Struct("point".into()));
    assert_eq!(field.count, Some(Count::Field("len".into())));

    let field = Field::parse("string[$n]   names").unwrap();
    assert_eq!(field.count, Some(Count::Transient("$n".into())));
}

#[test]
fn transient_names() {
    assert!(Field::parse("uint16le $count").unwrap().is_transient());
    assert!(!Field::parse("uint16le count").unwrap().is_transient());
}

#[test]
fn parse_rejects_garbage() {
    for bad in ["", "uint8", "uint8 a b", "uint8[ a", "uint8[1-2] a", "u-8 a", "uint8 9a"] {
        assert!(
            matches!(Field::parse(bad), Err(StructError::InvalidDefinition { .. })),
            "{:?} should not parse",
            bad
        );
    }
}
