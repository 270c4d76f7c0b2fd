//! Base Backup Coordinator (spec §4.I).
//!
//! Sequences the multi-result-set `BASE_BACKUP` protocol: a start-position
//! row, tablespace-info rows, one CopyOut TAR stream per tablespace (via
//! [`crate::tar`]), an optional manifest stream, and an end-position row.
//! Grounded on `src/replication/server.rs`'s `BASE_BACKUP` handling for the
//! overall sequencing, reworked around the `Connector` facade rather than
//! driving libpq result sets directly.

use bytes::Bytes;
use futures_util::StreamExt;

use crate::connector::CopyStream;
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::tar::{self, TarEntry, BLOCK_SIZE};

#[derive(Debug, Clone)]
pub struct TablespaceInfo {
    pub oid: Option<String>,
    pub path: Option<String>,
    pub size_kb: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct StartMessage {
    pub start_position: Lsn,
    pub timeline_id: i32,
}

#[derive(Debug, Clone)]
pub struct EndMessage {
    pub end_position: Lsn,
    pub end_timeline_id: i32,
}

/// One tablespace's TAR archive, read header-by-header from the CopyOut
/// stream handed back by the server.
pub struct TablespaceDataMessage {
    stream: CopyStream,
    pending: Option<Bytes>,
    done: bool,
}

impl TablespaceDataMessage {
    fn new(stream: CopyStream) -> Self {
        Self {
            stream,
            pending: None,
            done: false,
        }
    }

    async fn next_raw_frame(&mut self) -> Result<Option<Bytes>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        match self.stream.next().await {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }

    /// Reads the next tar header and its content, fully draining content
    /// and padding before returning so the stream is always positioned at
    /// the next header (or `CopyDone`) afterward.
    pub async fn next_entry(&mut self) -> Result<Option<(TarEntry, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        let header_frame = match self.next_raw_frame().await? {
            Some(frame) => frame,
            None => {
                self.done = true;
                return Ok(None);
            }
        };
        if header_frame.len() != BLOCK_SIZE {
            return Err(Error::protocol("tar header frame was not exactly 512 bytes"));
        }
        let entry = tar::parse_header(&header_frame)?;
        let to_skip = entry.total_skip_len();
        if to_skip == 0 {
            return Ok(Some((entry, Vec::new())));
        }

        let has_content = entry.has_content();
        let mut content = Vec::with_capacity(if has_content { entry.size as usize } else { 0 });
        let mut remaining = to_skip;
        while remaining > 0 {
            let frame = self
                .next_raw_frame()
                .await?
                .ok_or_else(|| Error::protocol("tablespace stream ended mid-entry"))?;
            let take = (remaining as usize).min(frame.len());
            let (content_part, leftover) = frame.split_at(take);
            if has_content && (content.len() as u64) < entry.size {
                let want = (entry.size - content.len() as u64) as usize;
                content.extend_from_slice(&content_part[..content_part.len().min(want)]);
            }
            remaining -= take as u64;
            if !leftover.is_empty() {
                self.pending = Some(Bytes::copy_from_slice(leftover));
            }
        }
        Ok(Some((entry, content)))
    }

    /// Drains and discards any remaining entries, per spec §4.I: consumers
    /// must either fully read or explicitly dispose each tablespace stream.
    pub async fn dispose(mut self) -> Result<()> {
        while self.next_entry().await?.is_some() {}
        Ok(())
    }
}

pub enum BaseBackupEvent {
    Start(StartMessage),
    TablespaceInfo(Vec<TablespaceInfo>),
    TablespaceData(TablespaceDataMessage),
    Manifest(Vec<u8>),
    End(EndMessage),
}

fn parse_lsn_field(value: &str) -> Result<Lsn> {
    value.parse::<Lsn>()
}

/// Parses the first result-set row: `(start_position, timeline_id)`.
pub fn parse_start_message(start_position: &str, timeline_id: i64) -> Result<StartMessage> {
    Ok(StartMessage {
        start_position: parse_lsn_field(start_position)?,
        timeline_id: timeline_id as i32,
    })
}

/// Parses the final result-set row: `(end_position, end_timeline_id)`.
pub fn parse_end_message(end_position: &str, end_timeline_id: i64) -> Result<EndMessage> {
    Ok(EndMessage {
        end_position: parse_lsn_field(end_position)?,
        end_timeline_id: end_timeline_id as i32,
    })
}

/// Wraps a raw CopyOut stream for one tablespace's TAR data. The Connector
/// facade is responsible for recognizing the `CopyOutResponse` and handing
/// back the byte stream; this module only interprets its contents.
pub fn tablespace_data_message(stream: CopyStream) -> TablespaceDataMessage {
    TablespaceDataMessage::new(stream)
}

/// Reads an opaque manifest stream to completion (spec §4.I step 4).
pub async fn read_manifest(mut stream: CopyStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(frame) = stream.next().await {
        buf.extend_from_slice(&frame?);
    }
    Ok(buf)
}
