use super::object_id::ObjectId;
use super::{read_str, read_u32, write_str};
use crate::error::{DbError, Result};
use std::cmp::Ordering;

/// Fixed-precision decimal: `mantissa * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decimal128 {
    pub mantissa: i64,
    pub scale: u8,
}

impl Decimal128 {
    pub fn new(mantissa: i64, scale: u8) -> Self {
        Self { mantissa, scale }
    }

    pub fn to_f64(self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale as i32)
    }
}

/// One element of the BSON-like type tree.
///
/// Type ordering for index keys follows §3/§4.6: `Null < Boolean < Numeric
/// < String < DateTime < ObjectId < Binary < Document < Array`, with
/// numerics (int32/int64/double/decimal) compared as reals among themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum DocValue {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Decimal(Decimal128),
    Str(String),
    DateTime(i64),
    ObjectId(ObjectId),
    Binary(Vec<u8>),
    Document(Vec<(String, DocValue)>),
    Array(Vec<DocValue>),
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I32: u8 = 2;
const TAG_I64: u8 = 3;
const TAG_F64: u8 = 4;
const TAG_DECIMAL: u8 = 5;
const TAG_STR: u8 = 6;
const TAG_DATETIME: u8 = 7;
const TAG_OID: u8 = 8;
const TAG_BINARY: u8 = 9;
const TAG_DOCUMENT: u8 = 10;
const TAG_ARRAY: u8 = 11;

impl DocValue {
    fn type_rank(&self) -> u8 {
        match self {
            DocValue::Null => 0,
            DocValue::Boolean(_) => 1,
            DocValue::Int32(_) | DocValue::Int64(_) | DocValue::Double(_) | DocValue::Decimal(_) => 2,
            DocValue::Str(_) => 3,
            DocValue::DateTime(_) => 4,
            DocValue::ObjectId(_) => 5,
            DocValue::Binary(_) => 6,
            DocValue::Document(_) => 7,
            DocValue::Array(_) => 8,
        }
    }

    fn as_real(&self) -> Option<f64> {
        match self {
            DocValue::Int32(v) => Some(*v as f64),
            DocValue::Int64(v) => Some(*v as f64),
            DocValue::Double(v) => Some(*v),
            DocValue::Decimal(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            DocValue::Null => out.push(TAG_NULL),
            DocValue::Boolean(b) => {
                out.push(TAG_BOOL);
                out.push(*b as u8);
            }
            DocValue::Int32(v) => {
                out.push(TAG_I32);
                out.extend_from_slice(&v.to_le_bytes());
            }
            DocValue::Int64(v) => {
                out.push(TAG_I64);
                out.extend_from_slice(&v.to_le_bytes());
            }
            DocValue::Double(v) => {
                out.push(TAG_F64);
                out.extend_from_slice(&v.to_le_bytes());
            }
            DocValue::Decimal(d) => {
                out.push(TAG_DECIMAL);
                out.extend_from_slice(&d.mantissa.to_le_bytes());
                out.push(d.scale);
            }
            DocValue::Str(s) => {
                out.push(TAG_STR);
                write_str(out, s);
            }
            DocValue::DateTime(millis) => {
                out.push(TAG_DATETIME);
                out.extend_from_slice(&millis.to_le_bytes());
            }
            DocValue::ObjectId(oid) => {
                out.push(TAG_OID);
                out.extend_from_slice(&oid.to_bytes());
            }
            DocValue::Binary(bytes) => {
                out.push(TAG_BINARY);
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            DocValue::Document(fields) => {
                out.push(TAG_DOCUMENT);
                out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
                for (name, value) in fields {
                    write_str(out, name);
                    value.encode(out);
                }
            }
            DocValue::Array(items) => {
                out.push(TAG_ARRAY);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub fn decode(bytes: &[u8], cursor: &mut usize) -> Result<Self> {
        if bytes.len() <= *cursor {
            return Err(DbError::Serialization("buffer truncated reading tag".into()));
        }
        let tag = bytes[*cursor];
        *cursor += 1;
        let take = |cursor: &mut usize, n: usize| -> Result<&[u8]> {
            if bytes.len() < *cursor + n {
                return Err(DbError::Serialization("buffer truncated reading value".into()));
            }
            let slice = &bytes[*cursor..*cursor + n];
            *cursor += n;
            Ok(slice)
        };
        match tag {
            TAG_NULL => Ok(DocValue::Null),
            TAG_BOOL => Ok(DocValue::Boolean(take(cursor, 1)?[0] != 0)),
            TAG_I32 => Ok(DocValue::Int32(i32::from_le_bytes(take(cursor, 4)?.try_into().unwrap()))),
            TAG_I64 => Ok(DocValue::Int64(i64::from_le_bytes(take(cursor, 8)?.try_into().unwrap()))),
            TAG_F64 => Ok(DocValue::Double(f64::from_le_bytes(take(cursor, 8)?.try_into().unwrap()))),
            TAG_DECIMAL => {
                let mantissa = i64::from_le_bytes(take(cursor, 8)?.try_into().unwrap());
                let scale = take(cursor, 1)?[0];
                Ok(DocValue::Decimal(Decimal128::new(mantissa, scale)))
            }
            TAG_STR => Ok(DocValue::Str(read_str(bytes, cursor)?)),
            TAG_DATETIME => Ok(DocValue::DateTime(i64::from_le_bytes(take(cursor, 8)?.try_into().unwrap()))),
            TAG_OID => Ok(DocValue::ObjectId(ObjectId::from_bytes(take(cursor, 12)?.try_into().unwrap()))),
            TAG_BINARY => {
                let len = read_u32(bytes, cursor)? as usize;
                Ok(DocValue::Binary(take(cursor, len)?.to_vec()))
            }
            TAG_DOCUMENT => {
                let count = read_u32(bytes, cursor)? as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = read_str(bytes, cursor)?;
                    let value = DocValue::decode(bytes, cursor)?;
                    fields.push((name, value));
                }
                Ok(DocValue::Document(fields))
            }
            TAG_ARRAY => {
                let count = read_u32(bytes, cursor)? as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(DocValue::decode(bytes, cursor)?);
                }
                Ok(DocValue::Array(items))
            }
            other => Err(DbError::Serialization(format!("unknown value tag {other}"))),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match json {
            J::Null => DocValue::Null,
            J::Bool(b) => DocValue::Boolean(b),
            J::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DocValue::Int64(i)
                } else {
                    DocValue::Double(n.as_f64().unwrap_or(0.0))
                }
            }
            J::String(s) => DocValue::Str(s),
            J::Array(items) => DocValue::Array(items.into_iter().map(DocValue::from_json).collect()),
            J::Object(map) => {
                DocValue::Document(map.into_iter().map(|(k, v)| (k, DocValue::from_json(v))).collect())
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            DocValue::Null => J::Null,
            DocValue::Boolean(b) => J::Bool(*b),
            DocValue::Int32(v) => J::Number((*v).into()),
            DocValue::Int64(v) => J::Number((*v).into()),
            DocValue::Double(v) => serde_json::Number::from_f64(*v).map(J::Number).unwrap_or(J::Null),
            DocValue::Decimal(d) => serde_json::Number::from_f64(d.to_f64()).map(J::Number).unwrap_or(J::Null),
            DocValue::Str(s) => J::String(s.clone()),
            DocValue::DateTime(millis) => J::Number((*millis).into()),
            DocValue::ObjectId(oid) => J::String(oid.to_hex()),
            DocValue::Binary(bytes) => J::String(hex_encode(bytes)),
            DocValue::Document(fields) => {
                let mut map = serde_json::Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.to_json());
                }
                J::Object(map)
            }
            DocValue::Array(items) => J::Array(items.iter().map(DocValue::to_json).collect()),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Eq for DocValue {}

impl PartialOrd for DocValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let (ra, rb) = (self.type_rank(), other.type_rank());
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (DocValue::Null, DocValue::Null) => Ordering::Equal,
            (DocValue::Boolean(a), DocValue::Boolean(b)) => a.cmp(b),
            (DocValue::Str(a), DocValue::Str(b)) => a.cmp(b),
            (DocValue::DateTime(a), DocValue::DateTime(b)) => a.cmp(b),
            (DocValue::ObjectId(a), DocValue::ObjectId(b)) => a.cmp(b),
            (DocValue::Binary(a), DocValue::Binary(b)) => a.cmp(b),
            (DocValue::Document(a), DocValue::Document(b)) => a.len().cmp(&b.len()).then_with(|| {
                a.iter().zip(b.iter()).map(|((_, x), (_, y))| x.cmp(y)).find(|o| *o != Ordering::Equal).unwrap_or(Ordering::Equal)
            }),
            (DocValue::Array(a), DocValue::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => {
                // Both numeric: compared as reals per spec, decimal taking
                // precedence over a lossy float compare when either side is
                // exact decimal.
                let a = self.as_real().unwrap_or(0.0);
                let b = other.as_real().unwrap_or(0.0);
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_cross_type_compare() {
        assert!(DocValue::Int32(1) < DocValue::Double(1.5));
        assert_eq!(
            DocValue::Decimal(Decimal128::new(150, 2)).cmp(&DocValue::Double(1.5)),
            Ordering::Equal
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let v = DocValue::Document(vec![
            ("a".into(), DocValue::Int64(1)),
            ("b".into(), DocValue::Array(vec![DocValue::Str("x".into()), DocValue::Null])),
        ]);
        let mut buf = Vec::new();
        v.encode(&mut buf);
        let mut cursor = 0;
        let back = DocValue::decode(&buf, &mut cursor).unwrap();
        assert_eq!(v, back);
        assert_eq!(cursor, buf.len());
    }
}
