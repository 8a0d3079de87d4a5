//! BSON-like document model.
//!
//! A document is a self-describing sequence of typed, named elements. Every
//! persisted document carries an `_id` (primary key, an [`ObjectId`] unless
//! the caller supplied one of the other id-bearing types) and a
//! `_collection` tag. The type tree and its ordering for index keys are
//! defined here; page/slot placement lives in [`crate::storage`].

mod object_id;
mod value;

pub use object_id::ObjectId;
pub use value::{DocValue, Decimal128};

use crate::error::{DbError, Result};
use std::cmp::Ordering;

/// A fully materialized document: its primary key, owning collection, and
/// ordered field list.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: ObjectId,
    pub collection: String,
    pub fields: Vec<(String, DocValue)>,
}

impl Document {
    pub fn new(id: ObjectId, collection: impl Into<String>) -> Self {
        Self {
            id,
            collection: collection.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: DocValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&DocValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn set(&mut self, name: impl Into<String>, value: DocValue) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    /// Builds a document from a JSON value, assigning `id` as `_id`.
    ///
    /// This is the host-facing convenience conversion; the engine never
    /// requires JSON — it operates on [`DocValue`] trees and their encoded
    /// bytes.
    pub fn from_json(id: ObjectId, collection: impl Into<String>, json: serde_json::Value) -> Result<Self> {
        let root = DocValue::from_json(json);
        let fields = match root {
            DocValue::Document(fields) => fields,
            other => vec![("value".to_string(), other)],
        };
        Ok(Self {
            id,
            collection: collection.into(),
            fields,
        })
    }

    pub fn as_json(&self) -> serde_json::Value {
        DocValue::Document(self.fields.clone()).to_json()
    }

    /// Encodes the document into its BSON-like byte representation.
    ///
    /// Framing: `[u32 totalLen][_id: 12 bytes][_collection: len-prefixed][fields...]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.id.to_bytes());
        write_str(&mut body, &self.collection);
        body.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for (name, value) in &self.fields {
            write_str(&mut body, name);
            value.encode(&mut body);
        }
        let mut out = Vec::with_capacity(body.len() + 4);
        out.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(DbError::Serialization("document buffer too short".into()));
        }
        let total_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if total_len != bytes.len() {
            return Err(DbError::Serialization(format!(
                "document length prefix {} does not match buffer length {}",
                total_len,
                bytes.len()
            )));
        }
        let mut cursor = 4usize;
        if bytes.len() < cursor + 12 {
            return Err(DbError::Serialization("document buffer truncated at _id".into()));
        }
        let id = ObjectId::from_bytes(bytes[cursor..cursor + 12].try_into().unwrap());
        cursor += 12;
        let collection = read_str(bytes, &mut cursor)?;
        let field_count = read_u32(bytes, &mut cursor)? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let name = read_str(bytes, &mut cursor)?;
            let value = DocValue::decode(bytes, &mut cursor)?;
            fields.push((name, value));
        }
        Ok(Self { id, collection, fields })
    }
}

pub(crate) fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

pub(crate) fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    if bytes.len() < *cursor + 4 {
        return Err(DbError::Serialization("buffer truncated reading u32".into()));
    }
    let v = u32::from_le_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap());
    *cursor += 4;
    Ok(v)
}

pub(crate) fn read_str(bytes: &[u8], cursor: &mut usize) -> Result<String> {
    let len = read_u32(bytes, cursor)? as usize;
    if bytes.len() < *cursor + len {
        return Err(DbError::Serialization("buffer truncated reading string".into()));
    }
    let s = std::str::from_utf8(&bytes[*cursor..*cursor + len])
        .map_err(|e| DbError::Serialization(e.to_string()))?
        .to_string();
    *cursor += len;
    Ok(s)
}

/// A compound ordered key used by secondary indexes.
///
/// `MinValue`/`MaxValue` are sentinels that compare strictly less/greater
/// than every real key, used as open range bounds.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    MinValue,
    Key(Vec<DocValue>),
    MaxValue,
}

impl IndexKey {
    pub fn single(value: DocValue) -> Self {
        IndexKey::Key(vec![value])
    }

    /// Encodes a real (non-sentinel) key for on-disk storage in a B+ tree
    /// node. `MinValue`/`MaxValue` only ever exist as in-memory range bounds.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            IndexKey::Key(values) => {
                out.extend_from_slice(&(values.len() as u32).to_le_bytes());
                for v in values {
                    v.encode(out);
                }
            }
            _ => unreachable!("sentinel index keys are never persisted"),
        }
    }

    pub fn decode(bytes: &[u8], cursor: &mut usize) -> Result<Self> {
        let count = read_u32(bytes, cursor)? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(DocValue::decode(bytes, cursor)?);
        }
        Ok(IndexKey::Key(values))
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::MinValue, IndexKey::MinValue) => Ordering::Equal,
            (IndexKey::MinValue, _) => Ordering::Less,
            (_, IndexKey::MinValue) => Ordering::Greater,
            (IndexKey::MaxValue, IndexKey::MaxValue) => Ordering::Equal,
            (IndexKey::MaxValue, _) => Ordering::Greater,
            (_, IndexKey::MaxValue) => Ordering::Less,
            (IndexKey::Key(a), IndexKey::Key(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_ordering_matches_spec() {
        assert!(DocValue::Null < DocValue::Boolean(false));
        assert!(DocValue::Boolean(true) < DocValue::Int64(0));
        assert!(DocValue::Int64(i64::MAX) < DocValue::Str("".into()));
        assert!(DocValue::Str("z".into()) < DocValue::DateTime(0));
        assert!(DocValue::DateTime(0) < DocValue::ObjectId(ObjectId::from_bytes([0; 12])));
        assert!(DocValue::ObjectId(ObjectId::from_bytes([0; 12])) < DocValue::Binary(vec![]));
        assert!(DocValue::Binary(vec![]) < DocValue::Document(vec![]));
        assert!(DocValue::Document(vec![]) < DocValue::Array(vec![]));
    }

    #[test]
    fn null_is_smallest_valid_key() {
        let a = IndexKey::single(DocValue::Null);
        let b = IndexKey::single(DocValue::Int64(-1));
        assert!(a < b);
        assert!(IndexKey::MinValue < a);
        assert!(a < IndexKey::MaxValue);
    }

    #[test]
    fn document_round_trip() {
        let doc = Document::new(ObjectId::new(), "users")
            .with_field("name", DocValue::Str("Alice".into()))
            .with_field("age", DocValue::Int64(30));
        let bytes = doc.to_bytes();
        let back = Document::from_bytes(&bytes).unwrap();
        assert_eq!(doc, back);
    }
}
