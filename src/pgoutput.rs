//! pgoutput logical decoding message parser (spec §4.H).
//!
//! Sits on top of [`crate::wal_stream::WalStreamDecoder`], reading the
//! message-type byte out of each `XLogData` payload and parsing the typed
//! variants. Grounded on `src/parser.rs`'s per-message match arms and
//! cursor reads; the tuple-field tag switch mirrors that file's handling
//! of column value tags.
//!
//! Only `proto_version = 1` is implemented. Streaming and two-phase
//! variants (`proto_version >= 2`) are out of scope (see DESIGN.md).

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::wal_stream::{WalStreamDecoder, XLogData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    Full,
    Index,
}

impl ReplicaIdentity {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'd' => Ok(Self::Default),
            b'n' => Ok(Self::Nothing),
            b'f' => Ok(Self::Full),
            b'i' => Ok(Self::Index),
            other => Err(Error::protocol(format!("unknown replica identity byte {other:#x}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleField {
    Null,
    UnchangedToasted,
    Text(String),
}

pub type TupleData = Vec<TupleField>;

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub flags: u8,
    pub name: String,
    pub data_type_oid: u32,
    pub type_modifier: i32,
}

/// Bitmask from the `T` (Truncate) message: `CASCADE` and `RESTART_IDENTITY`
/// may both be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncateOptions(u8);

impl TruncateOptions {
    pub const CASCADE: u8 = 1;
    pub const RESTART_IDENTITY: u8 = 2;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn cascade(self) -> bool {
        self.0 & Self::CASCADE != 0
    }

    pub fn restart_identity(self) -> bool {
        self.0 & Self::RESTART_IDENTITY != 0
    }
}

#[derive(Debug, Clone)]
pub enum UpdateVariant {
    /// Default replica identity: only the new row is known.
    Default { new_row: TupleData },
    /// Indexed replica identity: old values of the key columns.
    Indexed { key_row: TupleData, new_row: TupleData },
    /// Full replica identity: the complete old row.
    Full { old_row: TupleData, new_row: TupleData },
}

#[derive(Debug, Clone)]
pub enum DeleteVariant {
    KeyDelete { key_row: TupleData },
    FullDelete { old_row: TupleData },
}

#[derive(Debug, Clone)]
pub struct MessageBase {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub server_clock_micros: i64,
}

#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    Begin {
        base: MessageBase,
        final_lsn: Lsn,
        commit_timestamp_micros: i64,
        xid: u32,
    },
    Commit {
        base: MessageBase,
        flags: u8,
        commit_lsn: Lsn,
        transaction_end_lsn: Lsn,
        commit_timestamp_micros: i64,
    },
    Origin {
        base: MessageBase,
        origin_commit_lsn: Lsn,
        origin_name: String,
    },
    Relation {
        base: MessageBase,
        relation_id: u32,
        namespace: String,
        relation_name: String,
        replica_identity: ReplicaIdentity,
        columns: Vec<ColumnInfo>,
    },
    Type {
        base: MessageBase,
        type_oid: u32,
        namespace: String,
        name: String,
    },
    Insert {
        base: MessageBase,
        relation_id: u32,
        new_row: TupleData,
    },
    Update {
        base: MessageBase,
        relation_id: u32,
        variant: UpdateVariant,
    },
    Delete {
        base: MessageBase,
        relation_id: u32,
        variant: DeleteVariant,
    },
    Truncate {
        base: MessageBase,
        options: TruncateOptions,
        relation_ids: Vec<u32>,
    },
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(|| Error::protocol("pgoutput message truncated"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::protocol("pgoutput message truncated"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn cstr(&mut self) -> Result<String> {
        let start = self.pos;
        let nul = self.buf[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::protocol("unterminated pgoutput string field"))?;
        let s = String::from_utf8_lossy(&self.buf[start..start + nul]).into_owned();
        self.pos = start + nul + 1;
        Ok(s)
    }

    fn tuple_field(&mut self) -> Result<TupleField> {
        match self.u8()? {
            b'n' => Ok(TupleField::Null),
            b'u' => Ok(TupleField::UnchangedToasted),
            b't' => {
                let len = self.i32()?;
                if len < 0 {
                    return Err(Error::protocol("negative tuple field length"));
                }
                let bytes = self.take(len as usize)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| Error::protocol("tuple field is not valid UTF-8"))?;
                Ok(TupleField::Text(text.to_string()))
            }
            other => Err(Error::protocol(format!("unknown tuple field tag {other:#x}"))),
        }
    }

    fn tuple_data(&mut self) -> Result<TupleData> {
        let ncols = self.u16()?;
        (0..ncols).map(|_| self.tuple_field()).collect()
    }
}

/// Decodes pgoutput messages from an underlying WAL stream. The caller must
/// have started logical replication with `proto_version '1'`.
pub struct PgOutputDecoder<'a> {
    inner: &'a mut WalStreamDecoder,
}

impl<'a> PgOutputDecoder<'a> {
    pub fn new(inner: &'a mut WalStreamDecoder) -> Self {
        Self { inner }
    }

    pub async fn next_message(&mut self) -> Result<Option<PgOutputMessage>> {
        let event = match self.inner.next_event().await? {
            Some(event) => event,
            None => return Ok(None),
        };
        decode(&event).map(Some)
    }
}

fn decode(event: &XLogData) -> Result<PgOutputMessage> {
    let base = MessageBase {
        wal_start: event.wal_start,
        wal_end: event.wal_end,
        server_clock_micros: event.server_clock_micros,
    };
    let payload: &Bytes = &event.payload;
    if payload.is_empty() {
        return Err(Error::protocol("empty pgoutput message"));
    }
    let mut cursor = Cursor::new(payload);
    let tag = cursor.u8()?;

    match tag {
        b'B' => Ok(PgOutputMessage::Begin {
            final_lsn: Lsn::new(cursor.u64()?),
            commit_timestamp_micros: cursor.i64()?,
            xid: cursor.u32()?,
            base,
        }),
        b'C' => Ok(PgOutputMessage::Commit {
            flags: cursor.u8()?,
            commit_lsn: Lsn::new(cursor.u64()?),
            transaction_end_lsn: Lsn::new(cursor.u64()?),
            commit_timestamp_micros: cursor.i64()?,
            base,
        }),
        b'O' => Ok(PgOutputMessage::Origin {
            origin_commit_lsn: Lsn::new(cursor.u64()?),
            origin_name: cursor.cstr()?,
            base,
        }),
        b'R' => {
            let relation_id = cursor.u32()?;
            let namespace = cursor.cstr()?;
            let relation_name = cursor.cstr()?;
            let replica_identity = ReplicaIdentity::from_byte(cursor.u8()?)?;
            let ncols = cursor.u16()?;
            let mut columns = Vec::with_capacity(ncols as usize);
            for _ in 0..ncols {
                columns.push(ColumnInfo {
                    flags: cursor.u8()?,
                    name: cursor.cstr()?,
                    data_type_oid: cursor.u32()?,
                    type_modifier: cursor.i32()?,
                });
            }
            Ok(PgOutputMessage::Relation {
                base,
                relation_id,
                namespace,
                relation_name,
                replica_identity,
                columns,
            })
        }
        b'Y' => Ok(PgOutputMessage::Type {
            type_oid: cursor.u32()?,
            namespace: cursor.cstr()?,
            name: cursor.cstr()?,
            base,
        }),
        b'I' => {
            let relation_id = cursor.u32()?;
            let tag = cursor.u8()?;
            if tag != b'N' {
                return Err(Error::protocol("Insert message missing 'N' tuple tag"));
            }
            let new_row = cursor.tuple_data()?;
            Ok(PgOutputMessage::Insert {
                base,
                relation_id,
                new_row,
            })
        }
        b'U' => {
            let relation_id = cursor.u32()?;
            let first_tag = cursor.u8()?;
            let variant = match first_tag {
                b'N' => {
                    let new_row = cursor.tuple_data()?;
                    UpdateVariant::Default { new_row }
                }
                b'K' => {
                    let key_row = cursor.tuple_data()?;
                    let tag = cursor.u8()?;
                    if tag != b'N' {
                        return Err(Error::protocol("Update message missing trailing 'N' tuple tag"));
                    }
                    let new_row = cursor.tuple_data()?;
                    UpdateVariant::Indexed { key_row, new_row }
                }
                b'O' => {
                    let old_row = cursor.tuple_data()?;
                    let tag = cursor.u8()?;
                    if tag != b'N' {
                        return Err(Error::protocol("Update message missing trailing 'N' tuple tag"));
                    }
                    let new_row = cursor.tuple_data()?;
                    UpdateVariant::Full { old_row, new_row }
                }
                other => {
                    return Err(Error::protocol(format!("unknown Update tuple tag {other:#x}")));
                }
            };
            Ok(PgOutputMessage::Update {
                base,
                relation_id,
                variant,
            })
        }
        b'D' => {
            let relation_id = cursor.u32()?;
            let tag = cursor.u8()?;
            let variant = match tag {
                b'K' => DeleteVariant::KeyDelete {
                    key_row: cursor.tuple_data()?,
                },
                b'O' => DeleteVariant::FullDelete {
                    old_row: cursor.tuple_data()?,
                },
                other => {
                    return Err(Error::protocol(format!("unknown Delete tuple tag {other:#x}")));
                }
            };
            Ok(PgOutputMessage::Delete {
                base,
                relation_id,
                variant,
            })
        }
        b'T' => {
            let nrels = cursor.u32()?;
            let options = TruncateOptions::from_bits(cursor.u8()?);
            let relation_ids = (0..nrels).map(|_| cursor.u32()).collect::<Result<Vec<_>>>()?;
            Ok(PgOutputMessage::Truncate {
                base,
                options,
                relation_ids,
            })
        }
        other => Err(Error::protocol(format!("unknown pgoutput message tag {other:#x}"))),
    }
}
