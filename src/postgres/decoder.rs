//! pgoutput logical message decoding.
//!
//! Decodes the inner payload of XLogData frames: Begin, Commit, Relation,
//! Insert, Update, and Delete records as produced by the `pgoutput` plugin
//! with `proto_version '1'`.
//!
//! The decoder owns the relation cache. Relation records may reappear with
//! altered column sets mid-stream; the cache overwrites by relation id,
//! never merges. It is cleared only on disconnect.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, trace};

use crate::event::{Operation, Row};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub type_oid: u32,
    pub is_key: bool,
}

/// A row-level change with its relation resolved through the cache.
#[derive(Debug)]
pub struct RowChange {
    pub op: Operation,
    pub schema: String,
    pub table: String,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

/// One decoded pgoutput record.
#[derive(Debug)]
pub enum PgOutputMessage {
    Begin { xid: u32 },
    Commit { commit_lsn: u64 },
    Relation { id: u32 },
    Row(RowChange),
    /// Record types the replicator does not consume (Truncate, Origin,
    /// Type, Message).
    Skipped,
}

pub struct PgOutputDecoder {
    relations: HashMap<u32, Relation>,
    current_xid: Option<u32>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self {
            relations: HashMap::new(),
            current_xid: None,
        }
    }

    /// Transaction id of the most recent Begin record.
    pub fn current_xid(&self) -> Option<u32> {
        self.current_xid
    }

    pub fn clear(&mut self) {
        self.relations.clear();
        self.current_xid = None;
    }

    /// Decodes one logical message (the payload inside an XLogData frame).
    pub fn decode(&mut self, data: &[u8]) -> Result<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let tag = cursor.u8()?;

        match tag {
            b'B' => self.decode_begin(&mut cursor),
            b'C' => self.decode_commit(&mut cursor),
            b'R' => self.decode_relation(&mut cursor),
            b'I' => self.decode_insert(&mut cursor),
            b'U' => self.decode_update(&mut cursor),
            b'D' => self.decode_delete(&mut cursor),
            b'T' | b'O' | b'Y' | b'M' => {
                debug!(tag = %(tag as char), "skipping pgoutput record");
                Ok(PgOutputMessage::Skipped)
            }
            other => Err(Error::InvalidMessage {
                message: format!("unknown pgoutput record type: {}", other as char),
            }),
        }
    }

    fn decode_begin(&mut self, cursor: &mut Cursor<'_>) -> Result<PgOutputMessage> {
        let _final_lsn = cursor.u64()?;
        let _timestamp = cursor.i64()?;
        let xid = cursor.u32()?;

        self.current_xid = Some(xid);
        trace!(xid, "BEGIN");
        Ok(PgOutputMessage::Begin { xid })
    }

    fn decode_commit(&mut self, cursor: &mut Cursor<'_>) -> Result<PgOutputMessage> {
        let _flags = cursor.u8()?;
        let commit_lsn = cursor.u64()?;
        let _end_lsn = cursor.u64()?;
        let _timestamp = cursor.i64()?;

        trace!(commit_lsn, "COMMIT");
        Ok(PgOutputMessage::Commit { commit_lsn })
    }

    fn decode_relation(&mut self, cursor: &mut Cursor<'_>) -> Result<PgOutputMessage> {
        let id = cursor.u32()?;
        let namespace = cursor.cstring()?;
        let name = cursor.cstring()?;
        let _replica_identity = cursor.u8()?;
        let column_count = cursor.u16()?;

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            let flags = cursor.u8()?;
            let name = cursor.cstring()?;
            let type_oid = cursor.u32()?;
            let _type_modifier = cursor.i32()?;
            columns.push(Column {
                name,
                type_oid,
                is_key: (flags & 1) != 0,
            });
        }

        let relation = Relation {
            id,
            namespace,
            name,
            columns,
        };
        debug!(
            relation_id = id,
            relation = %format!("{}.{}", relation.namespace, relation.name),
            "cached relation"
        );
        // Overwrite whole: the new column set replaces the old one.
        self.relations.insert(id, relation);

        Ok(PgOutputMessage::Relation { id })
    }

    fn decode_insert(&mut self, cursor: &mut Cursor<'_>) -> Result<PgOutputMessage> {
        let relation_id = cursor.u32()?;
        let relation = self.relation(relation_id)?;

        let tuple_kind = cursor.u8()?;
        if tuple_kind != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("unexpected tuple kind in INSERT: {}", tuple_kind as char),
            });
        }
        let after = decode_tuple(cursor, &relation.columns)?;

        Ok(PgOutputMessage::Row(RowChange {
            op: Operation::Create,
            schema: relation.namespace.clone(),
            table: relation.name.clone(),
            before: None,
            after: Some(after),
        }))
    }

    fn decode_update(&mut self, cursor: &mut Cursor<'_>) -> Result<PgOutputMessage> {
        let relation_id = cursor.u32()?;
        let relation = self.relation(relation_id)?;

        let mut before = None;
        let mut tuple_kind = cursor.u8()?;
        if tuple_kind == b'K' || tuple_kind == b'O' {
            before = Some(decode_tuple(cursor, &relation.columns)?);
            tuple_kind = cursor.u8()?;
        }
        if tuple_kind != b'N' {
            return Err(Error::InvalidMessage {
                message: format!("unexpected tuple kind in UPDATE: {}", tuple_kind as char),
            });
        }
        let after = decode_tuple(cursor, &relation.columns)?;

        Ok(PgOutputMessage::Row(RowChange {
            op: Operation::Update,
            schema: relation.namespace.clone(),
            table: relation.name.clone(),
            before,
            after: Some(after),
        }))
    }

    fn decode_delete(&mut self, cursor: &mut Cursor<'_>) -> Result<PgOutputMessage> {
        let relation_id = cursor.u32()?;
        let relation = self.relation(relation_id)?;

        let tuple_kind = cursor.u8()?;
        if tuple_kind != b'K' && tuple_kind != b'O' {
            return Err(Error::InvalidMessage {
                message: format!("unexpected tuple kind in DELETE: {}", tuple_kind as char),
            });
        }
        let before = decode_tuple(cursor, &relation.columns)?;

        Ok(PgOutputMessage::Row(RowChange {
            op: Operation::Delete,
            schema: relation.namespace.clone(),
            table: relation.name.clone(),
            before: Some(before),
            after: None,
        }))
    }

    fn relation(&self, id: u32) -> Result<&Relation> {
        self.relations.get(&id).ok_or_else(|| Error::InvalidMessage {
            message: format!("unknown relation id: {id}"),
        })
    }
}

impl Default for PgOutputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_tuple(cursor: &mut Cursor<'_>, columns: &[Column]) -> Result<Row> {
    let column_count = cursor.u16()? as usize;
    if column_count != columns.len() {
        return Err(Error::InvalidMessage {
            message: format!(
                "tuple column count mismatch: {} in message, {} in relation",
                column_count,
                columns.len()
            ),
        });
    }

    let mut row = Row::new();
    for column in columns {
        let kind = cursor.u8()?;
        match kind {
            b'n' => {
                row.insert(column.name.clone(), Value::Null);
            }
            // Unchanged TOAST value: no data follows, column omitted.
            b'u' => {}
            b't' => {
                let len = cursor.i32()?;
                let data = cursor.bytes(len as usize)?;
                let text = String::from_utf8_lossy(data);
                row.insert(column.name.clone(), parse_text_value(&text, column.type_oid));
            }
            b'b' => {
                let len = cursor.i32()?;
                let data = cursor.bytes(len as usize)?;
                row.insert(
                    column.name.clone(),
                    Value::String(base64_encode(data)),
                );
            }
            other => {
                return Err(Error::InvalidMessage {
                    message: format!("unknown tuple column kind: {}", other as char),
                });
            }
        }
    }

    Ok(row)
}

/// Converts a text-format column to a typed JSON value by pg_type oid.
/// Values that fail to parse stay strings.
fn parse_text_value(text: &str, type_oid: u32) -> Value {
    match type_oid {
        // bool
        16 => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        // int8, int2, int4
        20 | 21 | 23 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        // float4, float8
        700 | 701 => text
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}

/// Bounds-checked reader over a pgoutput payload.
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Error::InvalidMessage {
                message: format!("truncated pgoutput record: wanted {n} bytes, have {}", self.data.len()),
            });
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    /// Null-terminated string, as pgoutput encodes all names.
    fn cstring(&mut self) -> Result<String> {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::InvalidMessage {
                message: "unterminated string in pgoutput record".to_string(),
            })?;
        let s = String::from_utf8_lossy(&self.data[..end]).into_owned();
        self.data = &self.data[end + 1..];
        Ok(s)
    }
}
