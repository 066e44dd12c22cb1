//! Decoder for the logical replication stream.
//!
//! Frames arrive as copy-data payloads: an XLogData envelope (`w`) wrapping
//! one pgoutput message, or a primary keepalive (`k`). All integers are
//! big-endian. Tuple columns are `n` (NULL), `u` (unchanged TOAST, which has
//! no logical value and is omitted from the emitted map), `t` (text), or `b`
//! (binary); any other kind byte aborts the batch.

use std::collections::BTreeMap;

use bytes::{
    Buf,
    Bytes,
};
use chrono::{
    DateTime,
    Utc,
};
use common::{
    ChangeOp,
    ChangeRecord,
    Lsn,
};

/// Microseconds between the unix epoch and 2000-01-01, the epoch of
/// replication-protocol timestamps.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WalDecodeError {
    #[error("truncated WAL frame while reading {0}")]
    Truncated(&'static str),
    #[error("unknown tuple column kind {0:#x}")]
    UnknownTupleKind(u8),
    #[error("unrecognized copy-data frame tag {0:#x}")]
    UnknownFrame(u8),
    #[error("unexpected tuple marker {0:#x}")]
    BadTupleMarker(u8),
    #[error("tuple has {tuple} columns but relation {relation} declares {declared}")]
    ColumnCountMismatch {
        relation: u32,
        tuple: usize,
        declared: usize,
    },
    #[error("change record references unknown relation {0}")]
    UnknownRelation(u32),
    #[error("binary tuple data was not requested from the server")]
    UnexpectedBinary,
    #[error("non-UTF-8 string in WAL frame")]
    BadString,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationColumn {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl RelationColumn {
    /// Set when the column is part of the replica identity key.
    pub fn is_key(&self) -> bool {
        self.flags & 0x1 != 0
    }
}

/// A table-shape announcement. The server sends one before the first change
/// touching a relation and again whenever the shape drifts; decoders cache
/// it by OID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationMapping {
    pub id: u32,
    pub schema: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TupleEntry {
    Null,
    /// Unchanged TOAST datum; carries no value.
    Unchanged,
    Text(Bytes),
    Binary(Bytes),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TupleData {
    pub entries: Vec<TupleEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalMessage {
    Begin {
        final_lsn: Lsn,
        commit_time: Option<DateTime<Utc>>,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: Option<DateTime<Utc>>,
    },
    Relation(RelationMapping),
    Insert {
        relation_id: u32,
        new_tuple: TupleData,
    },
    Update {
        relation_id: u32,
        key_tuple: Option<TupleData>,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },
    Delete {
        relation_id: u32,
        key_tuple: Option<TupleData>,
        old_tuple: Option<TupleData>,
    },
    Truncate {
        relation_ids: Vec<u32>,
    },
    /// Origin, type, and logical-decoding messages carry nothing we apply.
    Ignored(u8),
    Unknown(u8),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationFrame {
    XLogData {
        start: Lsn,
        end: Lsn,
        message: WalMessage,
    },
    Keepalive {
        end: Lsn,
        reply_requested: bool,
    },
}

pub fn decode_frame(mut buf: Bytes) -> Result<ReplicationFrame, WalDecodeError> {
    let tag = get_u8(&mut buf, "frame tag")?;
    match tag {
        b'w' => {
            let start = Lsn(get_u64(&mut buf, "wal start")?);
            let end = Lsn(get_u64(&mut buf, "wal end")?);
            let _send_time = get_i64(&mut buf, "send time")?;
            let message = decode_message(&mut buf)?;
            Ok(ReplicationFrame::XLogData { start, end, message })
        },
        b'k' => {
            let end = Lsn(get_u64(&mut buf, "keepalive end")?);
            let _timestamp = get_i64(&mut buf, "keepalive time")?;
            let reply = get_u8(&mut buf, "keepalive reply")?;
            Ok(ReplicationFrame::Keepalive {
                end,
                reply_requested: reply != 0,
            })
        },
        other => Err(WalDecodeError::UnknownFrame(other)),
    }
}

fn decode_message(buf: &mut Bytes) -> Result<WalMessage, WalDecodeError> {
    let tag = get_u8(buf, "message tag")?;
    Ok(match tag {
        b'B' => {
            let final_lsn = Lsn(get_u64(buf, "begin final_lsn")?);
            let commit_time = pg_timestamp_to_utc(get_i64(buf, "begin timestamp")?);
            let _xid = get_u32(buf, "begin xid")?;
            WalMessage::Begin {
                final_lsn,
                commit_time,
            }
        },
        b'C' => {
            let _flags = get_u8(buf, "commit flags")?;
            let commit_lsn = Lsn(get_u64(buf, "commit lsn")?);
            let end_lsn = Lsn(get_u64(buf, "commit end_lsn")?);
            let commit_time = pg_timestamp_to_utc(get_i64(buf, "commit timestamp")?);
            WalMessage::Commit {
                commit_lsn,
                end_lsn,
                commit_time,
            }
        },
        b'R' => {
            let id = get_u32(buf, "relation id")?;
            let schema = get_cstr(buf)?;
            let name = get_cstr(buf)?;
            let replica_identity = get_u8(buf, "replica identity")?;
            let num_columns = get_u16(buf, "relation column count")?;
            let mut columns = Vec::with_capacity(num_columns as usize);
            for _ in 0..num_columns {
                columns.push(RelationColumn {
                    flags: get_u8(buf, "column flags")?,
                    name: get_cstr(buf)?,
                    type_oid: get_u32(buf, "column type oid")?,
                    type_modifier: get_i32(buf, "column type modifier")?,
                });
            }
            WalMessage::Relation(RelationMapping {
                id,
                schema,
                name,
                replica_identity,
                columns,
            })
        },
        b'I' => {
            let relation_id = get_u32(buf, "insert relation id")?;
            let marker = get_u8(buf, "insert tuple marker")?;
            if marker != b'N' {
                return Err(WalDecodeError::BadTupleMarker(marker));
            }
            WalMessage::Insert {
                relation_id,
                new_tuple: decode_tuple(buf)?,
            }
        },
        b'U' => {
            let relation_id = get_u32(buf, "update relation id")?;
            let mut key_tuple = None;
            let mut old_tuple = None;
            let mut marker = get_u8(buf, "update tuple marker")?;
            if marker == b'K' {
                key_tuple = Some(decode_tuple(buf)?);
                marker = get_u8(buf, "update tuple marker")?;
            } else if marker == b'O' {
                old_tuple = Some(decode_tuple(buf)?);
                marker = get_u8(buf, "update tuple marker")?;
            }
            if marker != b'N' {
                return Err(WalDecodeError::BadTupleMarker(marker));
            }
            WalMessage::Update {
                relation_id,
                key_tuple,
                old_tuple,
                new_tuple: decode_tuple(buf)?,
            }
        },
        b'D' => {
            let relation_id = get_u32(buf, "delete relation id")?;
            let marker = get_u8(buf, "delete tuple marker")?;
            let (key_tuple, old_tuple) = match marker {
                b'K' => (Some(decode_tuple(buf)?), None),
                b'O' => (None, Some(decode_tuple(buf)?)),
                other => return Err(WalDecodeError::BadTupleMarker(other)),
            };
            WalMessage::Delete {
                relation_id,
                key_tuple,
                old_tuple,
            }
        },
        b'T' => {
            let count = get_u32(buf, "truncate relation count")?;
            let _options = get_u8(buf, "truncate options")?;
            let mut relation_ids = Vec::with_capacity(count as usize);
            for _ in 0..count {
                relation_ids.push(get_u32(buf, "truncate relation id")?);
            }
            WalMessage::Truncate { relation_ids }
        },
        b'O' | b'Y' | b'M' => WalMessage::Ignored(tag),
        other => WalMessage::Unknown(other),
    })
}

fn decode_tuple(buf: &mut Bytes) -> Result<TupleData, WalDecodeError> {
    let num_columns = get_u16(buf, "tuple column count")?;
    let mut entries = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        let kind = get_u8(buf, "tuple column kind")?;
        entries.push(match kind {
            b'n' => TupleEntry::Null,
            b'u' => TupleEntry::Unchanged,
            b't' => TupleEntry::Text(get_len_prefixed(buf)?),
            b'b' => TupleEntry::Binary(get_len_prefixed(buf)?),
            other => return Err(WalDecodeError::UnknownTupleKind(other)),
        });
    }
    Ok(TupleData { entries })
}

/// Projects a decoded tuple through its relation mapping into a column →
/// value map. Unchanged-TOAST entries are omitted; callers must not
/// interpret a missing column as NULL.
pub fn tuple_to_map(
    mapping: &RelationMapping,
    tuple: &TupleData,
) -> Result<BTreeMap<String, Option<String>>, WalDecodeError> {
    if tuple.entries.len() != mapping.columns.len() {
        return Err(WalDecodeError::ColumnCountMismatch {
            relation: mapping.id,
            tuple: tuple.entries.len(),
            declared: mapping.columns.len(),
        });
    }
    let mut map = BTreeMap::new();
    for (entry, column) in tuple.entries.iter().zip(mapping.columns.iter()) {
        match entry {
            TupleEntry::Null => {
                map.insert(column.name.clone(), None);
            },
            TupleEntry::Unchanged => {},
            TupleEntry::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| WalDecodeError::BadString)?;
                map.insert(column.name.clone(), Some(text.to_owned()));
            },
            TupleEntry::Binary(_) => return Err(WalDecodeError::UnexpectedBinary),
        }
    }
    Ok(map)
}

/// Builds the change record emitted to the applier from one decoded DML
/// message.
pub fn build_record(
    mapping: &RelationMapping,
    op: ChangeOp,
    new_tuple: Option<&TupleData>,
    old_tuple: Option<&TupleData>,
    lsn: Lsn,
    commit_time: Option<DateTime<Utc>>,
) -> Result<ChangeRecord, WalDecodeError> {
    let new_values = match new_tuple {
        Some(tuple) => tuple_to_map(mapping, tuple)?,
        None => BTreeMap::new(),
    };
    let old_values = old_tuple.map(|t| tuple_to_map(mapping, t)).transpose()?;
    Ok(ChangeRecord {
        op,
        schema: mapping.schema.clone(),
        table: mapping.name.clone(),
        lsn,
        column_names: mapping.columns.iter().map(|c| c.name.clone()).collect(),
        new_values,
        old_values,
        commit_time,
    })
}

pub fn pg_timestamp_to_utc(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros.checked_add(PG_EPOCH_OFFSET_MICROS)?)
}

/// Current wall clock in replication-protocol form, for standby status
/// updates.
pub fn utc_to_pg_timestamp(now: DateTime<Utc>) -> i64 {
    now.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

fn get_u8(buf: &mut Bytes, what: &'static str) -> Result<u8, WalDecodeError> {
    if buf.remaining() < 1 {
        return Err(WalDecodeError::Truncated(what));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes, what: &'static str) -> Result<u16, WalDecodeError> {
    if buf.remaining() < 2 {
        return Err(WalDecodeError::Truncated(what));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes, what: &'static str) -> Result<u32, WalDecodeError> {
    if buf.remaining() < 4 {
        return Err(WalDecodeError::Truncated(what));
    }
    Ok(buf.get_u32())
}

fn get_i32(buf: &mut Bytes, what: &'static str) -> Result<i32, WalDecodeError> {
    if buf.remaining() < 4 {
        return Err(WalDecodeError::Truncated(what));
    }
    Ok(buf.get_i32())
}

fn get_u64(buf: &mut Bytes, what: &'static str) -> Result<u64, WalDecodeError> {
    if buf.remaining() < 8 {
        return Err(WalDecodeError::Truncated(what));
    }
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes, what: &'static str) -> Result<i64, WalDecodeError> {
    if buf.remaining() < 8 {
        return Err(WalDecodeError::Truncated(what));
    }
    Ok(buf.get_i64())
}

fn get_len_prefixed(buf: &mut Bytes) -> Result<Bytes, WalDecodeError> {
    let len = get_u32(buf, "tuple column length")? as usize;
    if buf.remaining() < len {
        return Err(WalDecodeError::Truncated("tuple column value"));
    }
    Ok(buf.split_to(len))
}

fn get_cstr(buf: &mut Bytes) -> Result<String, WalDecodeError> {
    let Some(end) = buf.iter().position(|&b| b == 0) else {
        return Err(WalDecodeError::Truncated("cstring"));
    };
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| WalDecodeError::BadString)
}

#[cfg(test)]
mod tests {
    use bytes::{
        BufMut,
        BytesMut,
    };

    use super::*;

    struct FrameBuilder {
        buf: BytesMut,
    }

    impl FrameBuilder {
        fn xlogdata(start: u64, end: u64) -> Self {
            let mut buf = BytesMut::new();
            buf.put_u8(b'w');
            buf.put_u64(start);
            buf.put_u64(end);
            buf.put_i64(0);
            FrameBuilder { buf }
        }

        fn tag(mut self, tag: u8) -> Self {
            self.buf.put_u8(tag);
            self
        }

        fn u8(mut self, v: u8) -> Self {
            self.buf.put_u8(v);
            self
        }

        fn u16(mut self, v: u16) -> Self {
            self.buf.put_u16(v);
            self
        }

        fn u32(mut self, v: u32) -> Self {
            self.buf.put_u32(v);
            self
        }

        fn u64(mut self, v: u64) -> Self {
            self.buf.put_u64(v);
            self
        }

        fn i64(mut self, v: i64) -> Self {
            self.buf.put_i64(v);
            self
        }

        fn cstr(mut self, s: &str) -> Self {
            self.buf.put_slice(s.as_bytes());
            self.buf.put_u8(0);
            self
        }

        fn text_col(mut self, s: &str) -> Self {
            self.buf.put_u8(b't');
            self.buf.put_u32(s.len() as u32);
            self.buf.put_slice(s.as_bytes());
            self
        }

        fn build(self) -> Bytes {
            self.buf.freeze()
        }
    }

    fn accounts_relation_frame() -> Bytes {
        FrameBuilder::xlogdata(100, 100)
            .tag(b'R')
            .u32(42)
            .cstr("public")
            .cstr("accounts")
            .u8(b'd')
            .u16(2)
            // id: key column
            .u8(1)
            .cstr("id")
            .u32(23)
            .u32(u32::MAX)
            // bal
            .u8(0)
            .cstr("bal")
            .u32(23)
            .u32(u32::MAX)
            .build()
    }

    fn accounts_mapping() -> RelationMapping {
        match decode_frame(accounts_relation_frame()).unwrap() {
            ReplicationFrame::XLogData {
                message: WalMessage::Relation(mapping),
                ..
            } => mapping,
            other => panic!("expected relation frame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0xDEAD);
        buf.put_i64(7);
        buf.put_u8(1);
        assert_eq!(
            decode_frame(buf.freeze()).unwrap(),
            ReplicationFrame::Keepalive {
                end: Lsn(0xDEAD),
                reply_requested: true,
            },
        );
    }

    #[test]
    fn decodes_relation_announcement() {
        let mapping = accounts_mapping();
        assert_eq!(mapping.id, 42);
        assert_eq!(mapping.schema, "public");
        assert_eq!(mapping.name, "accounts");
        assert_eq!(mapping.columns.len(), 2);
        assert!(mapping.columns[0].is_key());
        assert!(!mapping.columns[1].is_key());
        assert_eq!(mapping.columns[0].type_oid, 23);
    }

    #[test]
    fn decodes_insert_into_record() {
        let frame = FrameBuilder::xlogdata(200, 200)
            .tag(b'I')
            .u32(42)
            .u8(b'N')
            .u16(2)
            .text_col("1")
            .text_col("100")
            .build();
        let ReplicationFrame::XLogData {
            start,
            message: WalMessage::Insert {
                relation_id,
                new_tuple,
            },
            ..
        } = decode_frame(frame).unwrap()
        else {
            panic!("expected insert");
        };
        assert_eq!(relation_id, 42);
        let record = build_record(
            &accounts_mapping(),
            ChangeOp::Insert,
            Some(&new_tuple),
            None,
            start,
            None,
        )
        .unwrap();
        assert_eq!(record.schema, "public");
        assert_eq!(record.table, "accounts");
        assert_eq!(record.lsn, Lsn(200));
        assert_eq!(record.new_values["id"].as_deref(), Some("1"));
        assert_eq!(record.new_values["bal"].as_deref(), Some("100"));
        assert!(record.old_values.is_none());
    }

    #[test]
    fn update_with_key_tuple_yields_old_values() {
        let frame = FrameBuilder::xlogdata(300, 300)
            .tag(b'U')
            .u32(42)
            .u8(b'K')
            .u16(2)
            .text_col("1")
            .u8(b'n')
            .u8(b'N')
            .u16(2)
            .text_col("2")
            .text_col("150")
            .build();
        let ReplicationFrame::XLogData {
            message:
                WalMessage::Update {
                    key_tuple,
                    old_tuple,
                    new_tuple,
                    ..
                },
            ..
        } = decode_frame(frame).unwrap()
        else {
            panic!("expected update");
        };
        assert!(old_tuple.is_none());
        let record = build_record(
            &accounts_mapping(),
            ChangeOp::Update,
            Some(&new_tuple),
            key_tuple.as_ref(),
            Lsn(300),
            None,
        )
        .unwrap();
        let old = record.old_values.unwrap();
        assert_eq!(old["id"].as_deref(), Some("1"));
        assert_eq!(old["bal"], None);
        assert_eq!(record.new_values["id"].as_deref(), Some("2"));
    }

    #[test]
    fn unchanged_toast_columns_are_omitted_not_null() {
        let frame = FrameBuilder::xlogdata(400, 400)
            .tag(b'U')
            .u32(42)
            .u8(b'N')
            .u16(2)
            .text_col("1")
            .u8(b'u')
            .build();
        let ReplicationFrame::XLogData {
            message: WalMessage::Update { new_tuple, .. },
            ..
        } = decode_frame(frame).unwrap()
        else {
            panic!("expected update");
        };
        let map = tuple_to_map(&accounts_mapping(), &new_tuple).unwrap();
        assert_eq!(map.get("id").unwrap().as_deref(), Some("1"));
        // The unchanged column must be absent, not NULL.
        assert!(!map.contains_key("bal"));
    }

    #[test]
    fn delete_carries_old_values() {
        let frame = FrameBuilder::xlogdata(500, 500)
            .tag(b'D')
            .u32(42)
            .u8(b'O')
            .u16(2)
            .text_col("2")
            .text_col("200")
            .build();
        let ReplicationFrame::XLogData {
            message:
                WalMessage::Delete {
                    key_tuple,
                    old_tuple,
                    ..
                },
            ..
        } = decode_frame(frame).unwrap()
        else {
            panic!("expected delete");
        };
        assert!(key_tuple.is_none());
        let record = build_record(
            &accounts_mapping(),
            ChangeOp::Delete,
            None,
            old_tuple.as_ref(),
            Lsn(500),
            None,
        )
        .unwrap();
        assert_eq!(record.old_values.unwrap()["bal"].as_deref(), Some("200"));
        assert!(record.new_values.is_empty());
    }

    #[test]
    fn unknown_tuple_kind_is_a_decode_error() {
        let frame = FrameBuilder::xlogdata(600, 600)
            .tag(b'I')
            .u32(42)
            .u8(b'N')
            .u16(1)
            .u8(b'x')
            .build();
        assert_eq!(
            decode_frame(frame).unwrap_err(),
            WalDecodeError::UnknownTupleKind(b'x'),
        );
    }

    #[test]
    fn truncated_frame_is_a_decode_error() {
        let frame = FrameBuilder::xlogdata(700, 700)
            .tag(b'I')
            .u32(42)
            .u8(b'N')
            .u16(1)
            .u8(b't')
            .u32(10)
            .build();
        assert!(matches!(
            decode_frame(frame).unwrap_err(),
            WalDecodeError::Truncated(_),
        ));
    }

    #[test]
    fn begin_and_commit_carry_positions() {
        let frame = FrameBuilder::xlogdata(800, 800)
            .tag(b'B')
            .u64(0x1000)
            .i64(0)
            .u32(9)
            .build();
        let ReplicationFrame::XLogData {
            message: WalMessage::Begin { final_lsn, .. },
            ..
        } = decode_frame(frame).unwrap()
        else {
            panic!("expected begin");
        };
        assert_eq!(final_lsn, Lsn(0x1000));

        let frame = FrameBuilder::xlogdata(900, 900)
            .tag(b'C')
            .u8(0)
            .u64(0x1000)
            .u64(0x1001)
            .i64(0)
            .build();
        let ReplicationFrame::XLogData {
            message: WalMessage::Commit { commit_lsn, end_lsn, .. },
            ..
        } = decode_frame(frame).unwrap()
        else {
            panic!("expected commit");
        };
        assert_eq!(commit_lsn, Lsn(0x1000));
        assert_eq!(end_lsn, Lsn(0x1001));
    }

    #[test]
    fn column_count_mismatch_is_rejected() {
        let tuple = TupleData {
            entries: vec![TupleEntry::Null],
        };
        assert!(matches!(
            tuple_to_map(&accounts_mapping(), &tuple).unwrap_err(),
            WalDecodeError::ColumnCountMismatch { .. },
        ));
    }

    #[test]
    fn pg_timestamps_are_offset_from_2000() {
        let ts = pg_timestamp_to_utc(0).unwrap();
        assert_eq!(ts.to_rfc3339(), "2000-01-01T00:00:00+00:00");
        assert_eq!(utc_to_pg_timestamp(ts), 0);
    }
}
