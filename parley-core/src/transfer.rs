//! File transfer engine: offer/accept/reject/cancel lifecycle, chunked sending through
//! `pump`, index-ordered reassembly with size and digest checks, progress and speed.
//!
//! Sender: `pending --file_accept--> transferring --file_transfer_ack--> completed`.
//! Receiver: `pending --accept--> transferring --final chunk ok--> completed`.
//! `rejected` only from pending; `cancelled` from any non-terminal state; `failed` on
//! reconstruction errors or when the peer goes away.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::{debug, info, warn};

use crate::chunk::{self, ChunkAssembler, ReconstructionError};
use crate::identity::PeerId;
use crate::integrity;
use crate::protocol::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferStatus::Pending | TransferStatus::Transferring)
    }
}

/// What the receiver sees before deciding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub mime: String,
    /// Small base64 preview, if the sender made one.
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileTransfer {
    pub id: String,
    pub peer_id: PeerId,
    pub meta: FileMeta,
    pub direction: Direction,
    pub status: TransferStatus,
    pub transferred: u64,
    pub total: u64,
    /// Bytes per second at the last progress update.
    pub speed: f64,
    started_at: Option<Instant>,
}

impl FileTransfer {
    /// Fraction complete in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.transferred as f64 / self.total as f64
    }

    /// Bytes per second since the transfer was accepted.
    pub fn speed_at(&self, now: Instant) -> f64 {
        match self.started_at {
            Some(start) => {
                let secs = now.saturating_duration_since(start).as_secs_f64();
                if secs > 0.0 {
                    self.transferred as f64 / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    fn set_transferred(&mut self, bytes: u64, now: Instant) {
        self.transferred = bytes.min(self.total);
        self.speed = self.speed_at(now);
    }
}

/// Result of a received chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Stored; reply with `ack`.
    Stored { ack: Frame },
    /// Final chunk stored and the file rebuilt; reply with `ack` then `done`.
    Completed { ack: Frame, done: Frame, data: Vec<u8> },
}

/// Result of an inbound `file_offer`.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferOutcome {
    /// Waiting for the local user to accept or reject.
    Pending(FileTransfer),
    /// Refused without asking (too large or empty); send the frame.
    AutoRejected(Frame),
    /// Same transfer id offered again.
    Duplicate,
}

struct Outgoing {
    data: Vec<u8>,
    next_chunk: u32,
    total_chunks: u32,
    acked: HashSet<u32>,
}

struct Incoming {
    assembler: Option<ChunkAssembler>,
    sha256: Option<String>,
}

pub struct FileTransferEngine {
    chunk_size: usize,
    max_file_size: u64,
    chunks_per_pump: usize,
    transfers: HashMap<String, FileTransfer>,
    outgoing: HashMap<String, Outgoing>,
    incoming: HashMap<String, Incoming>,
}

impl FileTransferEngine {
    pub fn new(chunk_size: usize, max_file_size: u64, chunks_per_pump: usize) -> Self {
        Self {
            chunk_size: if chunk_size == 0 {
                chunk::DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            max_file_size,
            chunks_per_pump: chunks_per_pump.max(1),
            transfers: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    pub fn get(&self, transfer_id: &str) -> Option<&FileTransfer> {
        self.transfers.get(transfer_id)
    }

    pub fn transfers(&self) -> Vec<&FileTransfer> {
        let mut out: Vec<&FileTransfer> = self.transfers.values().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn check_size(&self, size: u64) -> Result<(), TransferError> {
        if size == 0 {
            return Err(TransferError::Empty);
        }
        if size > self.max_file_size {
            return Err(TransferError::TooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }

    /// Offer `data` to `peer_id`. Returns the transfer id and the `file_offer` frame; no
    /// bytes move until the peer accepts.
    pub fn offer(
        &mut self,
        peer_id: &PeerId,
        meta: FileMeta,
        data: Vec<u8>,
    ) -> Result<(String, Frame), TransferError> {
        let size = data.len() as u64;
        self.check_size(size)?;
        let id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::FileOffer {
            transfer_id: id.clone(),
            name: meta.name.clone(),
            size,
            file_type: meta.mime.clone(),
            thumbnail: meta.thumbnail.clone(),
        };
        self.outgoing.insert(
            id.clone(),
            Outgoing {
                total_chunks: chunk::chunk_count(size, self.chunk_size),
                data,
                next_chunk: 0,
                acked: HashSet::new(),
            },
        );
        self.transfers.insert(
            id.clone(),
            FileTransfer {
                id: id.clone(),
                peer_id: peer_id.clone(),
                meta,
                direction: Direction::Sending,
                status: TransferStatus::Pending,
                transferred: 0,
                total: size,
                speed: 0.0,
                started_at: None,
            },
        );
        info!("offered {} ({} bytes) to {}", id, size, peer_id);
        Ok((id, frame))
    }

    pub fn on_offer(
        &mut self,
        peer_id: &PeerId,
        transfer_id: &str,
        meta: FileMeta,
        size: u64,
    ) -> OfferOutcome {
        if self.transfers.contains_key(transfer_id) {
            return OfferOutcome::Duplicate;
        }
        if let Err(e) = self.check_size(size) {
            warn!("auto-rejecting {} from {}: {}", transfer_id, peer_id, e);
            return OfferOutcome::AutoRejected(Frame::FileReject {
                transfer_id: transfer_id.to_string(),
            });
        }
        let transfer = FileTransfer {
            id: transfer_id.to_string(),
            peer_id: peer_id.clone(),
            meta,
            direction: Direction::Receiving,
            status: TransferStatus::Pending,
            transferred: 0,
            total: size,
            speed: 0.0,
            started_at: None,
        };
        self.transfers
            .insert(transfer_id.to_string(), transfer.clone());
        OfferOutcome::Pending(transfer)
    }

    fn lookup(
        &mut self,
        transfer_id: &str,
        direction: Direction,
        status: TransferStatus,
    ) -> Result<&mut FileTransfer, TransferError> {
        let t = self
            .transfers
            .get_mut(transfer_id)
            .filter(|t| t.direction == direction)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if t.status != status {
            return Err(TransferError::InvalidState {
                id: transfer_id.to_string(),
                status: t.status,
            });
        }
        Ok(t)
    }

    /// Like `lookup`, but the transfer must also belong to `peer_id`.
    fn lookup_from(
        &mut self,
        peer_id: &PeerId,
        transfer_id: &str,
        direction: Direction,
        status: TransferStatus,
    ) -> Result<&mut FileTransfer, TransferError> {
        let owned = self
            .transfers
            .get(transfer_id)
            .is_some_and(|t| t.peer_id == *peer_id);
        if !owned {
            return Err(TransferError::UnknownTransfer(transfer_id.to_string()));
        }
        self.lookup(transfer_id, direction, status)
    }

    /// Receiver accepts a pending offer. Returns the peer and the `file_accept` frame.
    pub fn accept(
        &mut self,
        transfer_id: &str,
        now: Instant,
    ) -> Result<(PeerId, Frame), TransferError> {
        let t = self.lookup(transfer_id, Direction::Receiving, TransferStatus::Pending)?;
        t.status = TransferStatus::Transferring;
        t.started_at = Some(now);
        let peer_id = t.peer_id.clone();
        self.incoming.insert(
            transfer_id.to_string(),
            Incoming {
                assembler: None,
                sha256: None,
            },
        );
        Ok((
            peer_id,
            Frame::FileAccept {
                transfer_id: transfer_id.to_string(),
            },
        ))
    }

    /// Receiver declines a pending offer.
    pub fn reject(&mut self, transfer_id: &str) -> Result<(PeerId, Frame), TransferError> {
        let t = self.lookup(transfer_id, Direction::Receiving, TransferStatus::Pending)?;
        t.status = TransferStatus::Rejected;
        Ok((
            t.peer_id.clone(),
            Frame::FileReject {
                transfer_id: transfer_id.to_string(),
            },
        ))
    }

    /// Either side stops a transfer that has not finished. Takes effect at the next pump.
    pub fn cancel(&mut self, transfer_id: &str) -> Result<(PeerId, Frame), TransferError> {
        let t = self
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if t.status.is_terminal() {
            return Err(TransferError::InvalidState {
                id: transfer_id.to_string(),
                status: t.status,
            });
        }
        t.status = TransferStatus::Cancelled;
        let peer_id = t.peer_id.clone();
        self.drop_buffers(transfer_id);
        info!("cancelled transfer {}", transfer_id);
        Ok((
            peer_id,
            Frame::FileCancel {
                transfer_id: transfer_id.to_string(),
            },
        ))
    }

    /// Sender side: the peer accepted. Returns the `file_metadata` frame; chunks follow
    /// from `pump`.
    pub fn on_accept(
        &mut self,
        peer_id: &PeerId,
        transfer_id: &str,
        now: Instant,
    ) -> Result<Frame, TransferError> {
        let chunk_size = self.chunk_size;
        let t = self.lookup_from(
            peer_id,
            transfer_id,
            Direction::Sending,
            TransferStatus::Pending,
        )?;
        t.status = TransferStatus::Transferring;
        t.started_at = Some(now);
        let out = self
            .outgoing
            .get(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        Ok(Frame::FileMetadata {
            transfer_id: transfer_id.to_string(),
            total_chunks: out.total_chunks,
            chunk_size: chunk_size as u32,
            sha256: integrity::sha256_hex(&out.data),
        })
    }

    /// Sender side: the peer declined. Pending bytes are dropped.
    pub fn on_reject(&mut self, peer_id: &PeerId, transfer_id: &str) -> Result<(), TransferError> {
        let t = self.lookup_from(
            peer_id,
            transfer_id,
            Direction::Sending,
            TransferStatus::Pending,
        )?;
        t.status = TransferStatus::Rejected;
        self.drop_buffers(transfer_id);
        Ok(())
    }

    pub fn on_cancel(&mut self, peer_id: &PeerId, transfer_id: &str) -> Result<(), TransferError> {
        let t = match self.transfers.get_mut(transfer_id) {
            Some(t) if t.peer_id == *peer_id => t,
            _ => return Err(TransferError::UnknownTransfer(transfer_id.to_string())),
        };
        if t.status.is_terminal() {
            return Err(TransferError::InvalidState {
                id: transfer_id.to_string(),
                status: t.status,
            });
        }
        t.status = TransferStatus::Cancelled;
        self.drop_buffers(transfer_id);
        info!("{} cancelled transfer {}", peer_id, transfer_id);
        Ok(())
    }

    /// Receiver side: `file_metadata`. A chunk count that does not fit the accepted
    /// size fails the transfer.
    pub fn on_metadata(
        &mut self,
        peer_id: &PeerId,
        transfer_id: &str,
        total_chunks: u32,
        chunk_size: u32,
        sha256: &str,
    ) -> Result<(), TransferError> {
        let total = self
            .lookup_from(
                peer_id,
                transfer_id,
                Direction::Receiving,
                TransferStatus::Transferring,
            )?
            .total;
        let incoming = self
            .incoming
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if incoming.assembler.is_none() {
            match ChunkAssembler::for_file(total, chunk_size as usize, total_chunks) {
                Ok(a) => incoming.assembler = Some(a),
                Err(e) => return Err(self.fail(transfer_id, e)),
            }
        }
        incoming.sha256 = Some(sha256.to_string());
        Ok(())
    }

    /// Emit up to `chunks_per_pump` chunks for every sending transfer in progress.
    pub fn pump(&mut self) -> Vec<(PeerId, Frame)> {
        let mut ids: Vec<&String> = self.outgoing.keys().collect();
        ids.sort();
        let ids: Vec<String> = ids.into_iter().cloned().collect();
        let mut frames = Vec::new();
        for id in ids {
            let Some(t) = self.transfers.get(&id) else {
                continue;
            };
            if t.status != TransferStatus::Transferring {
                continue;
            }
            let peer_id = t.peer_id.clone();
            let Some(out) = self.outgoing.get_mut(&id) else {
                continue;
            };
            for _ in 0..self.chunks_per_pump {
                if out.next_chunk >= out.total_chunks {
                    break;
                }
                let index = out.next_chunk;
                let Some(bytes) = chunk::chunk_at(&out.data, index, self.chunk_size) else {
                    break;
                };
                frames.push((
                    peer_id.clone(),
                    Frame::FileChunk {
                        transfer_id: id.clone(),
                        chunk_index: index,
                        total_chunks: out.total_chunks,
                        data: chunk::encode_chunk(bytes),
                        is_final: index + 1 == out.total_chunks,
                    },
                ));
                out.next_chunk += 1;
            }
        }
        frames
    }

    /// Receiver side: one `file_chunk`. A reconstruction failure fails the transfer.
    #[allow(clippy::too_many_arguments)]
    pub fn on_chunk(
        &mut self,
        peer_id: &PeerId,
        transfer_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        data: &str,
        is_final: bool,
        now: Instant,
    ) -> Result<ChunkOutcome, TransferError> {
        let total = self
            .lookup_from(
                peer_id,
                transfer_id,
                Direction::Receiving,
                TransferStatus::Transferring,
            )?
            .total;
        let incoming = self
            .incoming
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        let stored = match incoming.assembler.as_mut() {
            Some(a) if a.total_chunks() != total_chunks => {
                Err(ReconstructionError::ChunkCountMismatch {
                    announced: total_chunks,
                    expected: a.total_chunks(),
                })
            }
            Some(a) => a.insert(chunk_index, data).map(|_| a.bytes_received()),
            None => ChunkAssembler::for_file(total, self.chunk_size, total_chunks).and_then(|a| {
                let a = incoming.assembler.insert(a);
                a.insert(chunk_index, data).map(|_| a.bytes_received())
            }),
        };
        let received = match stored {
            Ok(n) => n,
            Err(e) => return Err(self.fail(transfer_id, e)),
        };
        if let Some(t) = self.transfers.get_mut(transfer_id) {
            t.set_transferred(received, now);
        }
        let ack = Frame::ChunkAck {
            transfer_id: transfer_id.to_string(),
            chunk_index,
        };
        if !is_final {
            return Ok(ChunkOutcome::Stored { ack });
        }

        let Some(Incoming { assembler, sha256 }) = self.incoming.remove(transfer_id) else {
            return Err(TransferError::UnknownTransfer(transfer_id.to_string()));
        };
        let rebuilt = assembler
            .ok_or(ReconstructionError::MissingChunks {
                received: 0,
                expected: total_chunks,
            })
            .and_then(|a| a.assemble(sha256.as_deref()));
        match rebuilt {
            Ok(bytes) => {
                if let Some(t) = self.transfers.get_mut(transfer_id) {
                    t.status = TransferStatus::Completed;
                    t.set_transferred(bytes.len() as u64, now);
                }
                info!("received {} ({} bytes)", transfer_id, bytes.len());
                Ok(ChunkOutcome::Completed {
                    ack,
                    done: Frame::FileTransferAck {
                        transfer_id: transfer_id.to_string(),
                    },
                    data: bytes,
                })
            }
            Err(e) => Err(self.fail(transfer_id, e)),
        }
    }

    fn fail(&mut self, transfer_id: &str, source: ReconstructionError) -> TransferError {
        warn!("transfer {} failed: {}", transfer_id, source);
        if let Some(t) = self.transfers.get_mut(transfer_id) {
            t.status = TransferStatus::Failed;
        }
        self.drop_buffers(transfer_id);
        TransferError::Reconstruction {
            id: transfer_id.to_string(),
            source,
        }
    }

    /// Sender side: progress from `chunk_ack`. Returns whether the count moved.
    pub fn on_chunk_ack(
        &mut self,
        peer_id: &PeerId,
        transfer_id: &str,
        chunk_index: u32,
        now: Instant,
    ) -> bool {
        let chunk_size = self.chunk_size;
        let Ok(t) = self.lookup_from(
            peer_id,
            transfer_id,
            Direction::Sending,
            TransferStatus::Transferring,
        ) else {
            return false;
        };
        let total = t.total;
        let Some(out) = self.outgoing.get_mut(transfer_id) else {
            return false;
        };
        if chunk_index >= out.total_chunks || !out.acked.insert(chunk_index) {
            return false;
        }
        let acked_bytes: u64 = out
            .acked
            .iter()
            .map(|&i| {
                let start = i as u64 * chunk_size as u64;
                (start + chunk_size as u64).min(total) - start
            })
            .sum();
        if let Some(t) = self.transfers.get_mut(transfer_id) {
            t.set_transferred(acked_bytes, now);
        }
        debug!("{} acked chunk {} of {}", peer_id, chunk_index, transfer_id);
        true
    }

    /// Sender side: the receiver rebuilt the file.
    pub fn on_transfer_ack(
        &mut self,
        peer_id: &PeerId,
        transfer_id: &str,
        now: Instant,
    ) -> Result<(), TransferError> {
        let t = self.lookup_from(
            peer_id,
            transfer_id,
            Direction::Sending,
            TransferStatus::Transferring,
        )?;
        t.status = TransferStatus::Completed;
        let total = t.total;
        t.set_transferred(total, now);
        self.drop_buffers(transfer_id);
        info!("transfer {} delivered to {}", transfer_id, peer_id);
        Ok(())
    }

    /// Fail every unfinished transfer with `peer_id`. Returns their ids.
    /// Fail one transfer that has not finished yet. Returns whether it moved.
    pub fn mark_failed(&mut self, transfer_id: &str) -> bool {
        let Some(t) = self
            .transfers
            .get_mut(transfer_id)
            .filter(|t| !t.status.is_terminal())
        else {
            return false;
        };
        t.status = TransferStatus::Failed;
        self.drop_buffers(transfer_id);
        true
    }

    pub fn fail_peer(&mut self, peer_id: &PeerId) -> Vec<String> {
        let mut failed: Vec<String> = self
            .transfers
            .values_mut()
            .filter(|t| t.peer_id == *peer_id && !t.status.is_terminal())
            .map(|t| {
                t.status = TransferStatus::Failed;
                t.id.clone()
            })
            .collect();
        failed.sort();
        for id in &failed {
            self.drop_buffers(id);
        }
        failed
    }

    fn drop_buffers(&mut self, transfer_id: &str) {
        self.outgoing.remove(transfer_id);
        self.incoming.remove(transfer_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),
    #[error("transfer {id} is {status:?}")]
    InvalidState { id: String, status: TransferStatus },
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
    #[error("empty file")]
    Empty,
    #[error("transfer {id} could not be rebuilt: {source}")]
    Reconstruction {
        id: String,
        #[source]
        source: ReconstructionError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn meta() -> FileMeta {
        FileMeta {
            name: "notes.txt".into(),
            mime: "text/plain".into(),
            thumbnail: None,
        }
    }

    fn engines() -> (FileTransferEngine, FileTransferEngine) {
        (
            FileTransferEngine::new(16, 1024, 2),
            FileTransferEngine::new(16, 1024, 2),
        )
    }

    /// Run a transfer of `data` between two engines up to (not including) the chunks.
    fn negotiate(
        tx: &mut FileTransferEngine,
        rx: &mut FileTransferEngine,
        data: Vec<u8>,
        now: Instant,
    ) -> String {
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");
        let size = data.len() as u64;
        let (id, offer) = tx.offer(&bob, meta(), data).unwrap();
        assert!(matches!(offer, Frame::FileOffer { .. }));
        assert!(matches!(
            rx.on_offer(&alice, &id, meta(), size),
            OfferOutcome::Pending(_)
        ));
        rx.accept(&id, now).unwrap();
        let metadata = tx.on_accept(&bob, &id, now).unwrap();
        if let Frame::FileMetadata {
            total_chunks,
            chunk_size,
            sha256,
            ..
        } = metadata
        {
            rx.on_metadata(&alice, &id, total_chunks, chunk_size, &sha256).unwrap();
        }
        id
    }

    #[test]
    fn full_transfer_round_trip() {
        let (mut tx, mut rx) = engines();
        let now = Instant::now();
        let data: Vec<u8> = (0..50u8).collect();
        let id = negotiate(&mut tx, &mut rx, data.clone(), now);
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");

        let mut rebuilt = None;
        let mut pumps = 0;
        while rebuilt.is_none() {
            let frames = tx.pump();
            assert!(frames.len() <= 2);
            pumps += 1;
            for (_, f) in frames {
                let Frame::FileChunk {
                    chunk_index,
                    total_chunks,
                    data,
                    is_final,
                    ..
                } = f
                else {
                    panic!("expected chunk");
                };
                match rx
                    .on_chunk(&alice, &id, chunk_index, total_chunks, &data, is_final, now)
                    .unwrap()
                {
                    ChunkOutcome::Stored { .. } => {
                        assert!(tx.on_chunk_ack(&bob, &id, chunk_index, now));
                    }
                    ChunkOutcome::Completed { data, done, .. } => {
                        assert_eq!(done, Frame::FileTransferAck { transfer_id: id.clone() });
                        rebuilt = Some(data);
                    }
                }
            }
        }
        assert_eq!(pumps, 2);
        assert_eq!(rebuilt.unwrap(), data);
        assert_eq!(rx.get(&id).unwrap().status, TransferStatus::Completed);
        assert_eq!(tx.get(&id).unwrap().status, TransferStatus::Transferring);
        assert_eq!(tx.get(&id).unwrap().transferred, 48);
        tx.on_transfer_ack(&bob, &id, now).unwrap();
        assert_eq!(tx.get(&id).unwrap().status, TransferStatus::Completed);
        assert_eq!(tx.get(&id).unwrap().progress(), 1.0);
        assert!(tx.pump().is_empty());
    }

    #[test]
    fn nothing_moves_before_accept() {
        let (mut tx, _) = engines();
        let bob = PeerId::from("bob");
        let (id, _) = tx.offer(&bob, meta(), vec![1; 40]).unwrap();
        assert!(tx.pump().is_empty());
        assert_eq!(tx.get(&id).unwrap().status, TransferStatus::Pending);
    }

    #[test]
    fn size_limits() {
        let (mut tx, mut rx) = engines();
        let bob = PeerId::from("bob");
        assert_eq!(tx.offer(&bob, meta(), vec![]), Err(TransferError::Empty));
        assert!(matches!(
            tx.offer(&bob, meta(), vec![0; 2048]),
            Err(TransferError::TooLarge { .. })
        ));
        assert_eq!(
            rx.on_offer(&bob, "big", meta(), 4096),
            OfferOutcome::AutoRejected(Frame::FileReject {
                transfer_id: "big".into()
            })
        );
        assert!(rx.get("big").is_none());
    }

    #[test]
    fn reject_drops_pending_bytes() {
        let (mut tx, mut rx) = engines();
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");
        let (id, _) = tx.offer(&bob, meta(), vec![1; 40]).unwrap();
        rx.on_offer(&alice, &id, meta(), 40);
        let (to, frame) = rx.reject(&id).unwrap();
        assert_eq!(to, alice);
        assert!(matches!(frame, Frame::FileReject { .. }));
        tx.on_reject(&bob, &id).unwrap();
        assert_eq!(tx.get(&id).unwrap().status, TransferStatus::Rejected);
        assert!(tx.on_accept(&bob, &id, Instant::now()).is_err());
        assert!(rx.accept(&id, Instant::now()).is_err());
    }

    #[test]
    fn cancel_stops_at_next_pump() {
        let (mut tx, mut rx) = engines();
        let now = Instant::now();
        let id = negotiate(&mut tx, &mut rx, vec![9; 100], now);
        assert_eq!(tx.pump().len(), 2);
        let (_, frame) = tx.cancel(&id).unwrap();
        assert!(matches!(frame, Frame::FileCancel { .. }));
        assert!(tx.pump().is_empty());
        rx.on_cancel(&PeerId::from("alice"), &id).unwrap();
        assert_eq!(rx.get(&id).unwrap().status, TransferStatus::Cancelled);
        assert!(matches!(
            tx.cancel(&id),
            Err(TransferError::InvalidState { .. })
        ));
    }

    #[test]
    fn final_chunk_with_gap_fails() {
        let (mut tx, mut rx) = engines();
        let now = Instant::now();
        let alice = PeerId::from("alice");
        let id = negotiate(&mut tx, &mut rx, vec![3; 40], now);
        let frames = {
            let mut all = tx.pump();
            all.extend(tx.pump());
            all
        };
        // Skip the middle chunk.
        for (i, (_, f)) in frames.into_iter().enumerate() {
            if i == 1 {
                continue;
            }
            if let Frame::FileChunk {
                chunk_index,
                total_chunks,
                data,
                is_final,
                ..
            } = f
            {
                let r = rx.on_chunk(&alice, &id, chunk_index, total_chunks, &data, is_final, now);
                if is_final {
                    assert!(matches!(
                        r,
                        Err(TransferError::Reconstruction {
                            source: ReconstructionError::MissingChunks {
                                received: 2,
                                expected: 3
                            },
                            ..
                        })
                    ));
                }
            }
        }
        assert_eq!(rx.get(&id).unwrap().status, TransferStatus::Failed);
    }

    #[test]
    fn frames_from_other_peers_are_ignored() {
        let (mut tx, _) = engines();
        let bob = PeerId::from("bob");
        let (id, _) = tx.offer(&bob, meta(), vec![1; 10]).unwrap();
        assert_eq!(
            tx.on_accept(&PeerId::from("mallory"), &id, Instant::now()),
            Err(TransferError::UnknownTransfer(id.clone()))
        );
    }

    #[test]
    fn speed_is_bytes_over_elapsed() {
        let (mut tx, mut rx) = engines();
        let start = Instant::now();
        let alice = PeerId::from("alice");
        let id = negotiate(&mut tx, &mut rx, vec![5; 32], start);
        let (_, first) = tx.pump().remove(0);
        if let Frame::FileChunk {
            chunk_index,
            total_chunks,
            data,
            is_final,
            ..
        } = first
        {
            rx.on_chunk(
                &alice,
                &id,
                chunk_index,
                total_chunks,
                &data,
                is_final,
                start + Duration::from_secs(2),
            )
            .unwrap();
        }
        let t = rx.get(&id).unwrap();
        assert_eq!(t.transferred, 16);
        assert!((t.speed - 8.0).abs() < 1e-9);
        assert!((t.progress() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn peer_loss_fails_open_transfers() {
        let (mut tx, _) = engines();
        let bob = PeerId::from("bob");
        let (id, _) = tx.offer(&bob, meta(), vec![1; 10]).unwrap();
        assert_eq!(tx.fail_peer(&bob), vec![id.clone()]);
        assert_eq!(tx.get(&id).unwrap().status, TransferStatus::Failed);
        assert!(tx.fail_peer(&bob).is_empty());
    }

    #[test]
    fn receiver_never_buffers_past_the_accepted_size() {
        let (_, mut rx) = engines();
        let now = Instant::now();
        let alice = PeerId::from("alice");

        rx.on_offer(&alice, "t1", meta(), 10);
        rx.accept("t1", now).unwrap();
        assert!(matches!(
            rx.on_metadata(&alice, "t1", 1000, 16, "00"),
            Err(TransferError::Reconstruction {
                source: ReconstructionError::ChunkCountMismatch { .. },
                ..
            })
        ));
        assert_eq!(rx.get("t1").unwrap().status, TransferStatus::Failed);

        rx.on_offer(&alice, "t2", meta(), 10);
        rx.accept("t2", now).unwrap();
        let big = chunk::encode_chunk(&[9u8; 100]);
        assert!(matches!(
            rx.on_chunk(&alice, "t2", 0, 1, &big, false, now),
            Err(TransferError::Reconstruction {
                source: ReconstructionError::SizeMismatch { .. },
                ..
            })
        ));
        assert_eq!(rx.get("t2").unwrap().status, TransferStatus::Failed);
        assert_eq!(rx.get("t2").unwrap().transferred, 0);

        rx.on_offer(&alice, "t3", meta(), 10);
        rx.accept("t3", now).unwrap();
        let small = chunk::encode_chunk(&[1u8; 5]);
        assert!(rx.on_chunk(&alice, "t3", 0, 50, &small, false, now).is_err());
        assert_eq!(rx.get("t3").unwrap().status, TransferStatus::Failed);
    }
}
