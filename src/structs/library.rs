//! Registry of struct types and the encode/decode interpreter.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use log::trace;

use super::{
    schema::{Count, Field, FieldType, Scalar, StructType},
    value::{Record, Value},
    StructResult,
};
use crate::error::StructError;

/// Encode buffers start at the type's fixed size, or this when it has none.
const INITIAL_CAPACITY: usize = 64;

/// A set of named struct types.
#[derive(Debug, Clone, Default)]
pub struct Library {
    types: HashMap<String, StructType>,
}

impl Library {
    pub fn new() -> Self {
        Library::default()
    }

    /// Register a struct type from field definition strings. Redefining a
    /// name replaces the previous type.
    pub fn define_type(&mut self, name: &str, fields: &[&str]) -> StructResult<()> {
        let fields = fields
            .iter()
            .map(|d| Field::parse(d))
            .collect::<StructResult<Vec<_>>>()?;
        self.define(name, fields)
    }

    /// Register a struct type from parsed fields.
    pub fn define(&mut self, name: &str, fields: Vec<Field>) -> StructResult<()> {
        self.validate(&fields)?;
        let fixed_size = self.fixed_size_of(&fields);
        trace!("struct {} defined, fixed size {:?}", name, fixed_size);
        self.types.insert(
            name.to_owned(),
            StructType {
                name: name.to_owned(),
                fields,
                fixed_size,
            },
        );
        Ok(())
    }

    pub fn get_type(&self, name: &str) -> StructResult<&StructType> {
        self.types
            .get(name)
            .ok_or_else(|| StructError::UnknownType(name.to_owned()))
    }

    pub fn encode(&self, type_name: &str, record: &Record) -> StructResult<Vec<u8>> {
        let ty = self.get_type(type_name)?;
        let mut out = Vec::with_capacity(ty.fixed_size.unwrap_or(INITIAL_CAPACITY));
        self.encode_struct(ty, record, &mut out)?;
        Ok(out)
    }

    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> StructResult<Record> {
        let ty = self.get_type(type_name)?;
        let mut pos = 0;
        self.decode_struct(ty, bytes, &mut pos)
    }

    /// Like [`Library::decode`], also returning the number of bytes
    /// consumed so that trailing raw data can be located.
    pub fn decode_prefix(&self, type_name: &str, bytes: &[u8]) -> StructResult<(Record, usize)> {
        let ty = self.get_type(type_name)?;
        let mut pos = 0;
        let record = self.decode_struct(ty, bytes, &mut pos)?;
        Ok((record, pos))
    }

    // =========================================================================
    // Definition checks
    // =========================================================================

    fn validate(&self, fields: &[Field]) -> StructResult<()> {
        for (i, field) in fields.iter().enumerate() {
            let invalid = |reason: &str| StructError::InvalidDefinition {
                definition: field.name.clone(),
                reason: reason.to_owned(),
            };
            let earlier = &fields[..i];

            if earlier.iter().any(|f| f.name == field.name) {
                return Err(invalid("duplicate field name"));
            }
            if let FieldType::Struct(name) = &field.ty {
                self.get_type(name)?;
            }

            if field.is_transient() {
                if field.count.is_some() || !is_integer(&field.ty) {
                    return Err(invalid("transient fields must be plain integers"));
                }
                let users = fields[i + 1..]
                    .iter()
                    .filter(|f| f.count == Some(Count::Transient(field.name.clone())))
                    .count();
                if users != 1 {
                    return Err(invalid("transient field must count exactly one later array"));
                }
            }

            match &field.count {
                Some(Count::Field(name)) => {
                    let source = earlier.iter().find(|f| &f.name == name);
                    if !matches!(source, Some(f) if f.count.is_none() && !f.is_transient() && is_integer(&f.ty))
                    {
                        return Err(invalid("count must name an earlier integer field"));
                    }
                }
                Some(Count::Transient(name)) => {
                    if !earlier.iter().any(|f| &f.name == name) {
                        return Err(invalid("count must name an earlier transient field"));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn fixed_size_of(&self, fields: &[Field]) -> Option<usize> {
        fields.iter().try_fold(0usize, |total, field| {
            let element = match &field.ty {
                FieldType::Scalar(s) => s.size()?,
                FieldType::Struct(name) => self.types.get(name)?.fixed_size?,
            };
            let count = match &field.count {
                None => 1,
                Some(Count::Fixed(n)) => *n,
                Some(_) => return None,
            };
            Some(total + element * count)
        })
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    fn encode_struct(&self, ty: &StructType, record: &Record, out: &mut Vec<u8>) -> StructResult<()> {
        for field in &ty.fields {
            if field.is_transient() {
                let length = self.transient_length(ty, field, record)?;
                self.encode_value(field, &Value::Int(length as i64), out)?;
                continue;
            }

            let value = record
                .get(&field.name)
                .ok_or_else(|| StructError::MissingField(field.name.clone()))?;
            let count = match &field.count {
                None => {
                    self.encode_value(field, value, out)?;
                    continue;
                }
                Some(count) => count,
            };

            let items = value.as_array().ok_or_else(|| StructError::TypeMismatch {
                field: field.name.clone(),
                expected: "an array",
            })?;
            let expected = match count {
                Count::Fixed(n) => Some(*n),
                Count::Field(name) => {
                    let n = record
                        .get_int(name)
                        .ok_or_else(|| StructError::MissingField(name.clone()))?;
                    Some(usize::try_from(n).map_err(|_| StructError::OutOfRange {
                        field: name.clone(),
                        value: n,
                    })?)
                }
                Count::Transient(_) => None,
            };
            if let Some(expected) = expected {
                if expected != items.len() {
                    return Err(StructError::CountMismatch {
                        field: field.name.clone(),
                        expected,
                        actual: items.len(),
                    });
                }
            }
            for item in items {
                self.encode_value(field, item, out)?;
            }
        }
        Ok(())
    }

    /// Length of the array counted by the transient `field`.
    fn transient_length(&self, ty: &StructType, field: &Field, record: &Record) -> StructResult<usize> {
        let array = ty
            .fields
            .iter()
            .find(|f| f.count == Some(Count::Transient(field.name.clone())))
            .ok_or_else(|| StructError::MissingField(field.name.clone()))?;
        record
            .get(&array.name)
            .ok_or_else(|| StructError::MissingField(array.name.clone()))?
            .as_array()
            .map(<[Value]>::len)
            .ok_or_else(|| StructError::TypeMismatch {
                field: array.name.clone(),
                expected: "an array",
            })
    }

    fn encode_value(&self, field: &Field, value: &Value, out: &mut Vec<u8>) -> StructResult<()> {
        match &field.ty {
            FieldType::Struct(name) => {
                let record = value.as_record().ok_or_else(|| StructError::TypeMismatch {
                    field: field.name.clone(),
                    expected: "a struct",
                })?;
                self.encode_struct(self.get_type(name)?, record, out)
            }
            FieldType::Scalar(scalar) => encode_scalar(&field.name, *scalar, value, out),
        }
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    fn decode_struct(&self, ty: &StructType, bytes: &[u8], pos: &mut usize) -> StructResult<Record> {
        let mut record = Record::new();
        let mut transients: Vec<(&str, i64)> = Vec::new();

        for field in &ty.fields {
            if field.is_transient() {
                let n = self.decode_value(field, bytes, pos)?;
                transients.push((field.name.as_str(), n.as_int().unwrap_or_default()));
                continue;
            }

            let count = match &field.count {
                None => {
                    let value = self.decode_value(field, bytes, pos)?;
                    record.set(&field.name, value);
                    continue;
                }
                Some(Count::Fixed(n)) => *n as i64,
                Some(Count::Field(name)) => record
                    .get_int(name)
                    .ok_or_else(|| StructError::MissingField(name.clone()))?,
                Some(Count::Transient(name)) => transients
                    .iter()
                    .find(|(n, _)| *n == name.as_str())
                    .map(|(_, v)| *v)
                    .ok_or_else(|| StructError::MissingField(name.clone()))?,
            };
            let count = usize::try_from(count).map_err(|_| StructError::OutOfRange {
                field: field.name.clone(),
                value: count,
            })?;

            // Refuse counts the remaining bytes cannot possibly hold.
            let min_element = match &field.ty {
                FieldType::Scalar(s) => s.size().unwrap_or(1),
                FieldType::Struct(name) => self.get_type(name)?.fixed_size.unwrap_or(0),
            };
            let available = bytes.len() - *pos;
            let needed = count.saturating_mul(min_element);
            if needed > available {
                return Err(StructError::Truncated {
                    field: field.name.clone(),
                    needed,
                    available,
                });
            }

            let mut items = Vec::with_capacity(count.min(available));
            for _ in 0..count {
                items.push(self.decode_value(field, bytes, pos)?);
            }
            record.set(&field.name, Value::Array(items));
        }
        Ok(record)
    }

    fn decode_value(&self, field: &Field, bytes: &[u8], pos: &mut usize) -> StructResult<Value> {
        match &field.ty {
            FieldType::Struct(name) => {
                let ty = self.get_type(name)?;
                Ok(Value::Struct(self.decode_struct(ty, bytes, pos)?))
            }
            FieldType::Scalar(scalar) => decode_scalar(&field.name, *scalar, bytes, pos),
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn is_integer(ty: &FieldType) -> bool {
    matches!(ty, FieldType::Scalar(s) if s.is_integer())
}

fn encode_scalar(name: &str, scalar: Scalar, value: &Value, out: &mut Vec<u8>) -> StructResult<()> {
    use Scalar::*;

    if scalar == Str {
        let s = value.as_str().ok_or_else(|| StructError::TypeMismatch {
            field: name.to_owned(),
            expected: "a string",
        })?;
        if s.contains('\0') {
            return Err(StructError::TypeMismatch {
                field: name.to_owned(),
                expected: "a string without NUL characters",
            });
        }
        out.extend_from_slice(s.as_bytes());
        out.push(0);
        return Ok(());
    }

    if !scalar.is_integer() {
        let v = value.as_float().ok_or_else(|| StructError::TypeMismatch {
            field: name.to_owned(),
            expected: "a number",
        })?;
        // Writing to a Vec cannot fail.
        let _ = match scalar {
            F32Le => out.write_f32::<LittleEndian>(v as f32),
            F32Be => out.write_f32::<BigEndian>(v as f32),
            F64Le => out.write_f64::<LittleEndian>(v),
            _ => out.write_f64::<BigEndian>(v),
        };
        return Ok(());
    }

    let v = value.as_int().ok_or_else(|| StructError::TypeMismatch {
        field: name.to_owned(),
        expected: "an integer",
    })?;
    let range = || StructError::OutOfRange {
        field: name.to_owned(),
        value: v,
    };
    let _ = match scalar {
        U8 => out.write_u8(u8::try_from(v).map_err(|_| range())?),
        I8 => out.write_i8(i8::try_from(v).map_err(|_| range())?),
        U16Le => out.write_u16::<LittleEndian>(u16::try_from(v).map_err(|_| range())?),
        U16Be => out.write_u16::<BigEndian>(u16::try_from(v).map_err(|_| range())?),
        I16Le => out.write_i16::<LittleEndian>(i16::try_from(v).map_err(|_| range())?),
        I16Be => out.write_i16::<BigEndian>(i16::try_from(v).map_err(|_| range())?),
        U32Le => out.write_u32::<LittleEndian>(u32::try_from(v).map_err(|_| range())?),
        U32Be => out.write_u32::<BigEndian>(u32::try_from(v).map_err(|_| range())?),
        I32Le => out.write_i32::<LittleEndian>(i32::try_from(v).map_err(|_| range())?),
        _ => out.write_i32::<BigEndian>(i32::try_from(v).map_err(|_| range())?),
    };
    Ok(())
}

fn decode_scalar(name: &str, scalar: Scalar, bytes: &[u8], pos: &mut usize) -> StructResult<Value> {
    use Scalar::*;

    let rest = &bytes[*pos..];
    if scalar == Str {
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| StructError::UnterminatedString(name.to_owned()))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|_| StructError::InvalidUtf8(name.to_owned()))?;
        *pos += end + 1;
        return Ok(Value::Str(s.to_owned()));
    }

    let size = scalar.size().unwrap_or_default();
    if rest.len() < size {
        return Err(StructError::Truncated {
            field: name.to_owned(),
            needed: size,
            available: rest.len(),
        });
    }
    let b = &rest[..size];
    *pos += size;

    Ok(match scalar {
        U8 => Value::Int(b[0] as i64),
        I8 => Value::Int(b[0] as i8 as i64),
        U16Le => Value::Int(LittleEndian::read_u16(b) as i64),
        U16Be => Value::Int(BigEndian::read_u16(b) as i64),
        I16Le => Value::Int(LittleEndian::read_i16(b) as i64),
        I16Be => Value::Int(BigEndian::read_i16(b) as i64),
        U32Le => Value::Int(LittleEndian::read_u32(b) as i64),
        U32Be => Value::Int(BigEndian::read_u32(b) as i64),
        I32Le => Value::Int(LittleEndian::read_i32(b) as i64),
        I32Be => Value::Int(BigEndian::read_i32(b) as i64),
        F32Le => Value::Float(LittleEndian::read_f32(b) as f64),
        F32Be => Value::Float(BigEndian::read_f32(b) as f64),
        F64Le => Value::Float(LittleEndian::read_f64(b)),
        _ => Value::Float(BigEndian::read_f64(b)),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> Library {
        let mut lib = Library::new();
        lib.define_type(
            "header",
            &["uint32le size", "uint16le time", "uint16le date", "uint8 attr", "string filename"],
        )
        .unwrap();
        lib.define_type("point", &["int16be x", "int16be y"]).unwrap();
        lib.define_type(
            "shape",
            &[
                "uint8 $points",
                "uint16le ncolors",
                "string name",
                "point[$points] points",
                "uint32be[ncolors] colors",
                "doublele scale",
                "floatbe[2] offset",
            ],
        )
        .unwrap();
        lib
    }

    fn point(x: i16, y: i16) -> Value {
        Record::new().with("x", x).with("y", y).into()
    }

    #[test]
    fn fixed_layout() {
        let lib = library();
        let header = Record::new()
            .with("size", 0x0102_0304u32)
            .with("time", 0x0506u16)
            .with("date", 0x0708u16)
            .with("attr", 0x20u8)
            .with("filename", "a.txt");
        let bytes = lib.encode("header", &header).unwrap();
        assert_eq!(
            bytes,
            [4, 3, 2, 1, 6, 5, 8, 7, 0x20, b'a', b'.', b't', b'x', b't', 0]
        );
        assert_eq!(lib.decode("header", &bytes).unwrap(), header);
    }

    #[test]
    fn nested_and_counted_arrays() {
        let lib = library();
        let shape = Record::new()
            .with("ncolors", 2u16)
            .with("name", "héllo")
            .with("points", vec![point(1, -1), point(300, -300), point(0, 7)])
            .with("colors", vec![0xFF00_00FFu32, 0x00FF_00FF])
            .with("scale", 0.25)
            .with("offset", vec![1.5f32, -2.0]);
        let bytes = lib.encode("shape", &shape).unwrap();
        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..3], &[2, 0]);

        let decoded = lib.decode("shape", &bytes).unwrap();
        assert_eq!(decoded, shape);
        assert!(decoded.get("$points").is_none());
    }

    #[test]
    fn empty_arrays() {
        let lib = library();
        let shape = Record::new()
            .with("ncolors", 0u16)
            .with("name", "")
            .with("points", Vec::<Value>::new())
            .with("colors", Vec::<Value>::new())
            .with("scale", 1.0)
            .with("offset", vec![0.0f32, 0.0]);
        let bytes = lib.encode("shape", &shape).unwrap();
        assert_eq!(bytes.len(), 1 + 2 + 1 + 8 + 8);
        assert_eq!(lib.decode("shape", &bytes).unwrap(), shape);
    }

    #[test]
    fn fixed_sizes() {
        let lib = library();
        assert_eq!(lib.get_type("point").unwrap().fixed_size, Some(4));
        assert_eq!(lib.get_type("header").unwrap().fixed_size, None);
        assert_eq!(lib.get_type("shape").unwrap().fixed_size, None);
    }

    #[test]
    fn unknown_type() {
        let lib = library();
        assert_eq!(
            lib.decode("nope", &[]),
            Err(StructError::UnknownType("nope".into()))
        );
        assert!(matches!(
            lib.encode("nope", &Record::new()),
            Err(StructError::UnknownType(_))
        ));
        let mut lib = lib;
        assert_eq!(
            lib.define_type("line", &["vector a"]),
            Err(StructError::UnknownType("vector".into()))
        );
    }

    #[test]
    fn count_must_come_first() {
        let mut lib = Library::new();
        assert!(matches!(
            lib.define_type("bad", &["uint8[n] data", "uint8 n"]),
            Err(StructError::InvalidDefinition { .. })
        ));
        assert!(matches!(
            lib.define_type("bad", &["string n", "uint8[n] data"]),
            Err(StructError::InvalidDefinition { .. })
        ));
        assert!(matches!(
            lib.define_type("bad", &["uint8 $n", "uint8 data"]),
            Err(StructError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn encode_checks_values() {
        let lib = library();
        let header = Record::new()
            .with("size", -1)
            .with("time", 0u16)
            .with("date", 0u16)
            .with("attr", 0u8)
            .with("filename", "x");
        assert!(matches!(
            lib.encode("header", &header),
            Err(StructError::OutOfRange { .. })
        ));

        let missing = Record::new().with("size", 1u32);
        assert_eq!(
            lib.encode("header", &missing),
            Err(StructError::MissingField("time".into()))
        );

        let shape = Record::new()
            .with("ncolors", 3u16)
            .with("name", "")
            .with("points", Vec::<Value>::new())
            .with("colors", vec![1u32])
            .with("scale", 1.0)
            .with("offset", vec![0.0f32, 0.0]);
        assert!(matches!(
            lib.encode("shape", &shape),
            Err(StructError::CountMismatch { .. })
        ));
    }

    #[test]
    fn decode_stays_in_bounds() {
        let lib = library();
        assert!(matches!(
            lib.decode("header", &[1, 2, 3]),
            Err(StructError::Truncated { .. })
        ));
        assert_eq!(
            lib.decode("header", &[0, 0, 0, 0, 0, 0, 0, 0, 0, b'a']),
            Err(StructError::UnterminatedString("filename".into()))
        );
        // 255 points announced, none present
        assert!(matches!(
            lib.decode("shape", &[255, 0, 0, 0]),
            Err(StructError::Truncated { .. })
        ));
    }

    #[test]
    fn decode_prefix_reports_consumed() {
        let mut lib = library();
        let bytes = [1, 0, 2, 0, b'!', b'?'];
        lib.define_type("pair", &["uint16le a", "uint16le b"]).unwrap();
        let (record, used) = lib.decode_prefix("pair", &bytes).unwrap();
        assert_eq!(used, 4);
        assert_eq!(record.get_int("b"), Some(2));
    }
}
