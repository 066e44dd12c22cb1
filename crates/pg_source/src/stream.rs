//! The live WAL tail: `START_REPLICATION` over a copy-both duplex, decoded
//! into change records, with standby status heartbeats.

use std::{
    collections::HashMap,
    pin::Pin,
    time::Duration,
};

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use chrono::{
    DateTime,
    Utc,
};
use common::{
    errors::{
        classify_pg_error,
        ErrorMetadata,
    },
    knobs::CDC_RECEIVE_TIMEOUT,
    ChangeOp,
    ChangeRecord,
    Lsn,
};
use futures::{
    SinkExt,
    StreamExt,
};
use tokio::time::Instant;
use tokio_postgres::CopyBothDuplex;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::ReplicationClient,
    wal::{
        self,
        build_record,
        decode_frame,
        RelationMapping,
        ReplicationFrame,
        WalMessage,
    },
};

/// One pulled batch. `last_lsn` is the position through which everything
/// returned (and everything skipped) has been observed; committing it as the
/// replication cursor is what makes progress durable.
#[derive(Debug)]
pub struct Batch {
    pub records: Vec<ChangeRecord>,
    pub last_lsn: Lsn,
}

pub struct WalStream {
    duplex: Pin<Box<CopyBothDuplex<Bytes>>>,
    relations: HashMap<u32, RelationMapping>,
    /// Highest position the server told us about (keepalives and commits).
    observed: Lsn,
    /// Position we report in standby status updates; advanced by the caller
    /// once a batch has been durably applied.
    committed: Lsn,
    last_status: Instant,
    status_interval: Duration,
    current_commit_time: Option<DateTime<Utc>>,
}

impl WalStream {
    /// Starts streaming from `start_lsn`. `messages 'true'` is only
    /// negotiated on servers that understand it (v14+).
    pub async fn start(
        repl: &ReplicationClient,
        slot: &str,
        publication: &str,
        start_lsn: Lsn,
        server_version: i32,
        status_interval: Duration,
    ) -> anyhow::Result<Self> {
        let mut options = format!(
            r#""proto_version" '1', "publication_names" '{}'"#,
            publication.replace('\'', "''"),
        );
        if server_version >= 140_000 {
            options.push_str(r#", "messages" 'true'"#);
        }
        let query = format!(
            r#"START_REPLICATION SLOT "{}" LOGICAL {} ({})"#,
            slot.replace('"', "\"\""),
            start_lsn,
            options,
        );
        tracing::info!(slot, publication, %start_lsn, "starting replication");
        let duplex = repl
            .client
            .copy_both_simple::<Bytes>(&query)
            .await
            .map_err(|e| classify_pg_error(e, "starting replication"))?;
        Ok(WalStream {
            duplex: Box::pin(duplex),
            relations: HashMap::new(),
            observed: start_lsn,
            committed: start_lsn,
            last_status: Instant::now(),
            status_interval,
            current_commit_time: None,
        })
    }

    /// Marks everything at or below `lsn` as durably applied; subsequent
    /// standby status updates report it as flushed.
    pub fn confirm(&mut self, lsn: Lsn) {
        if lsn > self.committed {
            self.committed = lsn;
        }
    }

    /// Pulls decoded change records until the batch is full, the idle
    /// timeout elapses, or the caller cancels. Timeouts and cancellation
    /// return the partial batch without error; decode failures surface the
    /// LSN at which decoding stopped.
    pub async fn pull_changes(
        &mut self,
        max_records: usize,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Batch> {
        let deadline = Instant::now() + idle_timeout;
        let mut records = Vec::new();
        loop {
            self.maybe_send_status().await;
            if records.len() >= max_records {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(*CDC_RECEIVE_TIMEOUT);
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = tokio::time::timeout(wait, self.duplex.next()) => frame,
            };
            let bytes = match frame {
                // Read-timeout slices let us re-check the deadline, the
                // status clock, and cancellation.
                Err(_elapsed) => continue,
                Ok(None) => {
                    anyhow::bail!(ErrorMetadata::transient(
                        "ReplicationStreamClosed",
                        "replication stream ended unexpectedly",
                    ));
                },
                Ok(Some(Err(e))) => return Err(classify_pg_error(e, "reading WAL stream")),
                Ok(Some(Ok(bytes))) => bytes,
            };
            match decode_frame(bytes) {
                Ok(ReplicationFrame::Keepalive {
                    end,
                    reply_requested,
                }) => {
                    if end > self.observed {
                        self.observed = end;
                    }
                    if reply_requested {
                        self.send_status().await;
                    }
                },
                Ok(ReplicationFrame::XLogData { start, end, message }) => {
                    if end > self.observed {
                        self.observed = end;
                    }
                    if let Err(e) = self.handle_message(start, message, &mut records) {
                        return Err(e.context(ErrorMetadata::decode(
                            "WalDecodeFailed",
                            format!("failed to decode change at {start}"),
                        )));
                    }
                },
                Err(e) => {
                    let failed_at = self.observed;
                    return Err(anyhow::Error::from(e).context(ErrorMetadata::decode(
                        "WalDecodeFailed",
                        format!("failed to decode WAL frame at {failed_at}"),
                    )));
                },
            }
        }
        let last_lsn = self.batch_position(&records);
        Ok(Batch { records, last_lsn })
    }

    fn handle_message(
        &mut self,
        start: Lsn,
        message: WalMessage,
        records: &mut Vec<ChangeRecord>,
    ) -> anyhow::Result<()> {
        match message {
            WalMessage::Begin { commit_time, .. } => {
                self.current_commit_time = commit_time;
            },
            WalMessage::Commit { end_lsn, .. } => {
                if end_lsn > self.observed {
                    self.observed = end_lsn;
                }
                self.current_commit_time = None;
            },
            WalMessage::Relation(mapping) => {
                tracing::debug!(
                    relation = mapping.id,
                    table = %format!("{}.{}", mapping.schema, mapping.name),
                    columns = mapping.columns.len(),
                    "caching relation mapping",
                );
                self.relations.insert(mapping.id, mapping);
            },
            WalMessage::Insert {
                relation_id,
                new_tuple,
            } => {
                let mapping = self.relation(relation_id)?;
                records.push(build_record(
                    mapping,
                    ChangeOp::Insert,
                    Some(&new_tuple),
                    None,
                    start,
                    self.current_commit_time,
                )?);
            },
            WalMessage::Update {
                relation_id,
                key_tuple,
                old_tuple,
                new_tuple,
            } => {
                let mapping = self.relation(relation_id)?;
                let old = old_tuple.as_ref().or(key_tuple.as_ref());
                records.push(build_record(
                    mapping,
                    ChangeOp::Update,
                    Some(&new_tuple),
                    old,
                    start,
                    self.current_commit_time,
                )?);
            },
            WalMessage::Delete {
                relation_id,
                key_tuple,
                old_tuple,
            } => {
                let mapping = self.relation(relation_id)?;
                let old = old_tuple.as_ref().or(key_tuple.as_ref());
                records.push(build_record(
                    mapping,
                    ChangeOp::Delete,
                    None,
                    old,
                    start,
                    self.current_commit_time,
                )?);
            },
            WalMessage::Truncate { relation_ids } => {
                tracing::debug!(?relation_ids, "ignoring TRUNCATE in the change stream");
            },
            WalMessage::Ignored(_) => {},
            WalMessage::Unknown(tag) => {
                tracing::warn!(tag, "skipping unknown pgoutput message");
            },
        }
        Ok(())
    }

    fn relation(&self, relation_id: u32) -> anyhow::Result<&RelationMapping> {
        self.relations.get(&relation_id).ok_or_else(|| {
            anyhow::Error::from(wal::WalDecodeError::UnknownRelation(relation_id)).context(
                ErrorMetadata::decode(
                    "UnknownRelation",
                    format!("change record for unannounced relation {relation_id}"),
                ),
            )
        })
    }

    fn batch_position(&self, records: &[ChangeRecord]) -> Lsn {
        // A batch cut mid-transaction must not claim WAL we haven't
        // returned; resume from the last record we did hand out.
        if self.current_commit_time.is_some() {
            records.last().map(|r| r.lsn).unwrap_or(self.committed)
        } else {
            self.observed
        }
    }

    async fn maybe_send_status(&mut self) {
        if self.last_status.elapsed() >= self.status_interval {
            self.send_status().await;
        }
    }

    /// Reports the committed position as written/flushed/applied. Failure to
    /// send is non-fatal; the next interval retries.
    pub async fn send_status(&mut self) {
        let frame = standby_status_frame(self.committed, Utc::now());
        match self.duplex.send(frame).await {
            Ok(()) => {
                self.last_status = Instant::now();
            },
            Err(e) => {
                tracing::warn!("failed to send standby status update: {e}");
            },
        }
    }
}

fn standby_status_frame(position: Lsn, now: DateTime<Utc>) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(position.0);
    buf.put_u64(position.0);
    buf.put_u64(position.0);
    buf.put_i64(wal::utc_to_pg_timestamp(now));
    buf.put_u8(0);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;

    #[test]
    fn standby_status_frame_layout() {
        let now = DateTime::from_timestamp(946_684_800 + 1, 0).unwrap();
        let mut frame = standby_status_frame(Lsn(0xABCD), now);
        assert_eq!(frame.len(), 34);
        assert_eq!(frame.get_u8(), b'r');
        assert_eq!(frame.get_u64(), 0xABCD);
        assert_eq!(frame.get_u64(), 0xABCD);
        assert_eq!(frame.get_u64(), 0xABCD);
        assert_eq!(frame.get_i64(), 1_000_000);
        assert_eq!(frame.get_u8(), 0);
    }
}
