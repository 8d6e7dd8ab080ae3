//! The piece store: the single source of truth for piece state and the
//! persisted bytes of the download.
//!
//! Sessions deposit downloaded blocks here and read verified blocks back
//! for upload. A piece lives in an in-memory assembly buffer until all its
//! blocks have arrived, is then hashed against its expected digest, and
//! only written to the backing file on a match. Completions are fanned out
//! on a broadcast channel so every session can advertise the new piece.
//!
//! All operations take `&self`; a single mutex guards the piece-state
//! vector and the assembly buffers. Hashing and file IO happen outside the
//! lock on snapshots.

use std::{
    collections::{BTreeMap, HashMap},
    fs::OpenOptions,
    os::unix::fs::FileExt,
    path::Path,
    sync::Mutex,
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};
use tokio::sync::broadcast;

use crate::{
    block_count, block_len,
    error::{Error, Result},
    metainfo::Metainfo,
    Bitfield, BlockInfo, PieceIndex, SessionId, Sha1Hash,
};

/// Notifications the store fans out to all subscribed sessions and to the
/// supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// The piece was verified and is now available for upload.
    PieceCompleted(PieceIndex),
    /// The piece failed verification and was dropped; its blocks need to be
    /// downloaded again.
    PieceCorrupt(PieceIndex),
}

/// The result of a block deposit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deposit {
    /// The block was buffered; the piece is still missing blocks.
    Accepted,
    /// The block completed its piece and the piece's digest matched.
    PieceCompleted,
    /// The block completed its piece but the digest did not match; the
    /// whole piece was dropped.
    PieceCorrupt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PieceState {
    Absent,
    InFlight,
    Complete,
}

struct Reservation {
    session: SessionId,
    at: Instant,
}

/// The assembly buffer of a piece being downloaded: blocks keyed by their
/// offset so completion is a count and hashing iterates in order.
#[derive(Default)]
struct PartialPiece {
    blocks: BTreeMap<u32, Vec<u8>>,
    reservations: HashMap<u32, Reservation>,
}

struct State {
    pieces: Vec<PieceState>,
    partial: HashMap<PieceIndex, PartialPiece>,
    complete_count: usize,
}

/// Owns the backing file and the piece-state vector. Shared by all
/// sessions through an `Arc`.
pub struct PieceStore {
    piece_count: usize,
    piece_len: u32,
    last_piece_len: u32,
    download_len: u64,
    piece_hashes: Vec<Sha1Hash>,
    request_timeout: Duration,
    file: std::fs::File,
    state: Mutex<State>,
    events: broadcast::Sender<StoreEvent>,
}

impl PieceStore {
    /// Creates or opens the backing file `data_dir/<name>` at its exact
    /// final size.
    ///
    /// If a file of that name already existed with the right size, every
    /// piece is rehashed and matching pieces start out complete; this is
    /// what makes interrupted downloads resumable without sidecar state.
    pub fn open(
        metainfo: &Metainfo,
        data_dir: &Path,
        request_timeout: Duration,
    ) -> Result<Self> {
        let path = data_dir.join(&metainfo.name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(Error::Disk)?;
        let resumable =
            file.metadata().map_err(Error::Disk)?.len()
                == metainfo.download_len;
        if !resumable {
            file.set_len(metainfo.download_len).map_err(Error::Disk)?;
        }

        let piece_count = metainfo.piece_count();
        let (events, _) = broadcast::channel(piece_count.max(64));
        let store = Self {
            piece_count,
            piece_len: metainfo.piece_len,
            last_piece_len: metainfo
                .piece_len(piece_count - 1)
                .expect("metainfo has at least one piece"),
            download_len: metainfo.download_len,
            piece_hashes: metainfo.piece_hashes.clone(),
            request_timeout,
            file,
            state: Mutex::new(State {
                pieces: vec![PieceState::Absent; piece_count],
                partial: HashMap::new(),
                complete_count: 0,
            }),
            events,
        };

        if resumable {
            store.rehash()?;
        }
        Ok(store)
    }

    /// Hashes every piece of the backing file and marks the matching ones
    /// complete. Runs before any session can observe the store, so the
    /// state lock is uncontended.
    fn rehash(&self) -> Result<()> {
        let mut buf = vec![0; self.piece_len as usize];
        let mut complete = 0;
        let mut state = self.state.lock().expect("store lock poisoned");
        for index in 0..self.piece_count {
            let len = self.len_of(index) as usize;
            self.file
                .read_exact_at(&mut buf[..len], self.piece_offset(index))
                .map_err(Error::Disk)?;
            if Sha1Hash::from(Sha1::digest(&buf[..len]))
                == self.piece_hashes[index]
            {
                state.pieces[index] = PieceState::Complete;
                complete += 1;
            }
        }
        state.complete_count = complete;
        if complete > 0 {
            log::info!(
                "Resuming with {}/{} pieces already on disk",
                complete,
                self.piece_count
            );
        }
        Ok(())
    }

    /// Subscribes to piece completion/corruption events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Returns true iff the piece is complete (verified and on disk).
    pub fn have(&self, index: PieceIndex) -> bool {
        let state = self.state.lock().expect("store lock poisoned");
        index < self.piece_count
            && state.pieces[index] == PieceState::Complete
    }

    /// Returns a snapshot of local piece availability.
    pub fn bitfield(&self) -> Bitfield {
        let state = self.state.lock().expect("store lock poisoned");
        let mut bitfield = Bitfield::repeat(false, self.piece_count);
        for (index, piece) in state.pieces.iter().enumerate() {
            if *piece == PieceState::Complete {
                bitfield.set(index, true);
            }
        }
        bitfield
    }

    /// Returns true iff every piece is complete.
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock().expect("store lock poisoned");
        state.complete_count == self.piece_count
    }

    /// The number of bytes still to download, as reported to the tracker.
    pub fn left(&self) -> u64 {
        let state = self.state.lock().expect("store lock poisoned");
        state
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, piece)| **piece != PieceState::Complete)
            .map(|(index, _)| self.len_of(index) as u64)
            .sum()
    }

    /// Reads a verified block for upload.
    pub fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>> {
        self.check_range(block)?;
        {
            let state = self.state.lock().expect("store lock poisoned");
            if state.pieces[block.piece_index] != PieceState::Complete {
                return Err(Error::PieceNotAvailable(block.piece_index));
            }
        }
        // positioned read outside the lock; the piece cannot regress from
        // complete so the bytes are stable
        let mut buf = vec![0; block.len as usize];
        self.file
            .read_exact_at(
                &mut buf,
                self.piece_offset(block.piece_index) + block.offset as u64,
            )
            .map_err(Error::Disk)?;
        Ok(buf)
    }

    /// Records an in-flight request for the block on behalf of a session.
    ///
    /// Re-reserving a block the same session already holds refreshes the
    /// reservation. A block held by another live session, or whose data
    /// has already arrived, fails with `AlreadyReserved`.
    pub fn reserve_block(
        &self,
        block: BlockInfo,
        session: SessionId,
    ) -> Result<()> {
        self.check_block(block)?;
        let mut state = self.state.lock().expect("store lock poisoned");
        if state.pieces[block.piece_index] == PieceState::Complete {
            return Err(Error::AlreadyReserved);
        }
        state.pieces[block.piece_index] = PieceState::InFlight;
        let partial = state.partial.entry(block.piece_index).or_default();
        if partial.blocks.contains_key(&block.offset) {
            return Err(Error::AlreadyReserved);
        }
        match partial.reservations.get(&block.offset) {
            Some(r)
                if r.session != session
                    && r.at.elapsed() <= self.request_timeout =>
            {
                Err(Error::AlreadyReserved)
            }
            _ => {
                partial.reservations.insert(
                    block.offset,
                    Reservation {
                        session,
                        at: Instant::now(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Deposits a downloaded block into its piece's assembly buffer and
    /// releases the matching reservation.
    ///
    /// When the deposit supplies the piece's last missing block the whole
    /// piece is hashed; a match flushes it to disk and announces
    /// completion, a mismatch drops the buffer so the piece is downloaded
    /// again. Duplicate deposits are dropped.
    pub fn deposit_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
        _session: SessionId,
    ) -> Result<Deposit> {
        let block = BlockInfo {
            piece_index,
            offset,
            len: data.len() as u32,
        };
        self.check_block(block)?;

        let full = {
            let mut state = self.state.lock().expect("store lock poisoned");
            if state.pieces[piece_index] == PieceState::Complete {
                log::debug!("Dropping block for complete piece {}", piece_index);
                return Ok(Deposit::Accepted);
            }
            state.pieces[piece_index] = PieceState::InFlight;
            let partial = state.partial.entry(piece_index).or_default();
            partial.reservations.remove(&offset);
            if partial.blocks.contains_key(&offset) {
                log::debug!(
                    "Dropping duplicate block {}:{}",
                    piece_index,
                    offset
                );
                return Ok(Deposit::Accepted);
            }
            partial.blocks.insert(offset, data.to_vec());
            if partial.blocks.len()
                == block_count(self.len_of(piece_index))
            {
                // take the buffer out so no other deposit can complete the
                // piece concurrently; hashing happens outside the lock
                state
                    .partial
                    .remove(&piece_index)
                    .expect("assembly buffer just inserted into")
            } else {
                return Ok(Deposit::Accepted);
            }
        };

        let mut bytes =
            Vec::with_capacity(self.len_of(piece_index) as usize);
        for block in full.blocks.values() {
            bytes.extend_from_slice(block);
        }

        if Sha1Hash::from(Sha1::digest(&bytes))
            == self.piece_hashes[piece_index]
        {
            self.file
                .write_all_at(&bytes, self.piece_offset(piece_index))
                .map_err(Error::Disk)?;
            let mut state = self.state.lock().expect("store lock poisoned");
            state.pieces[piece_index] = PieceState::Complete;
            state.complete_count += 1;
            // a racing session may have started a fresh buffer meanwhile;
            // buffers only exist for in-flight pieces
            state.partial.remove(&piece_index);
            drop(state);
            log::info!("Piece {} complete", piece_index);
            let _ = self.events.send(StoreEvent::PieceCompleted(piece_index));
            Ok(Deposit::PieceCompleted)
        } else {
            log::warn!("Piece {} failed verification, dropping", piece_index);
            let mut state = self.state.lock().expect("store lock poisoned");
            if !state.partial.contains_key(&piece_index) {
                state.pieces[piece_index] = PieceState::Absent;
            }
            drop(state);
            let _ = self.events.send(StoreEvent::PieceCorrupt(piece_index));
            Ok(Deposit::PieceCorrupt)
        }
    }

    /// Chooses the next block to request from a peer with the given piece
    /// availability, and reserves it for the session.
    ///
    /// Pieces already in flight are finished before new ones are started;
    /// within a piece the lowest unreserved offset wins, and ties across
    /// pieces break strictly by ascending index. Reservations older than
    /// the request timeout count as free and are taken over. Returns
    /// `None` when the peer has nothing we can use, or the session already
    /// holds `max_in_flight` reservations.
    pub fn next_request(
        &self,
        remote_pieces: &Bitfield,
        session: SessionId,
        max_in_flight: usize,
    ) -> Option<BlockInfo> {
        let mut state = self.state.lock().expect("store lock poisoned");

        let held: usize = state
            .partial
            .values()
            .flat_map(|p| p.reservations.values())
            .filter(|r| r.session == session)
            .count();
        if held >= max_in_flight {
            return None;
        }

        // finish in-flight pieces before starting new ones
        let mut in_flight: Vec<PieceIndex> =
            state.partial.keys().copied().collect();
        in_flight.sort_unstable();
        for index in in_flight {
            if !remote_pieces.get(index).is_some_and(|b| *b) {
                continue;
            }
            let piece_len = self.len_of(index);
            let partial = state
                .partial
                .get_mut(&index)
                .expect("in-flight piece has a buffer");
            for block_index in 0..block_count(piece_len) {
                let offset = block_index as u32 * crate::BLOCK_LEN;
                if partial.blocks.contains_key(&offset) {
                    continue;
                }
                if let Some(r) = partial.reservations.get(&offset) {
                    if r.at.elapsed() <= self.request_timeout {
                        continue;
                    }
                }
                partial.reservations.insert(
                    offset,
                    Reservation {
                        session,
                        at: Instant::now(),
                    },
                );
                return Some(BlockInfo {
                    piece_index: index,
                    offset,
                    len: block_len(piece_len, block_index),
                });
            }
        }

        // start the lowest absent piece the peer has
        let absent = (0..self.piece_count).find(|index| {
            state.pieces[*index] == PieceState::Absent
                && remote_pieces.get(*index).is_some_and(|b| *b)
        })?;
        state.pieces[absent] = PieceState::InFlight;
        let partial = state.partial.entry(absent).or_default();
        partial.reservations.insert(
            0,
            Reservation {
                session,
                at: Instant::now(),
            },
        );
        Some(BlockInfo {
            piece_index: absent,
            offset: 0,
            len: block_len(self.len_of(absent), 0),
        })
    }

    /// Drops every reservation a session holds. Called by the supervisor
    /// when the session terminates for any reason; already-deposited blocks
    /// stay buffered for other sessions to finish.
    pub fn release_session(&self, session: SessionId) {
        let mut state = self.state.lock().expect("store lock poisoned");
        let mut emptied = Vec::new();
        for (index, partial) in state.partial.iter_mut() {
            partial.reservations.retain(|_, r| r.session != session);
            if partial.reservations.is_empty() && partial.blocks.is_empty() {
                emptied.push(*index);
            }
        }
        for index in emptied {
            state.partial.remove(&index);
            state.pieces[index] = PieceState::Absent;
        }
    }

    /// Resolves once every piece is complete. Usable at any point; returns
    /// immediately if the torrent is already done.
    pub async fn wait_complete(&self) {
        let mut events = self.subscribe();
        while !self.is_complete() {
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Flushes the backing file to disk.
    pub fn flush(&self) -> Result<()> {
        self.file.sync_all().map_err(Error::Disk)?;
        Ok(())
    }

    fn len_of(&self, index: PieceIndex) -> u32 {
        if index + 1 == self.piece_count {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Validates that the block region stays within its piece.
    fn check_range(&self, block: BlockInfo) -> Result<()> {
        if block.piece_index >= self.piece_count {
            return Err(Error::OutOfRange);
        }
        let piece_len = self.len_of(block.piece_index);
        let in_range = block.len > 0
            && block
                .offset
                .checked_add(block.len)
                .is_some_and(|end| end <= piece_len);
        if !in_range {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }

    /// Validates that the block sits on the 16 KiB download grid; deposits
    /// and reservations must match the blocks the scheduler hands out or
    /// the completion count would lie.
    fn check_block(&self, block: BlockInfo) -> Result<()> {
        self.check_range(block)?;
        let expected = block_len(
            self.len_of(block.piece_index),
            (block.offset / crate::BLOCK_LEN) as usize,
        );
        if block.offset % crate::BLOCK_LEN != 0 || block.len != expected {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_LEN;
    use pretty_assertions::assert_eq;

    const PIECE_LEN: u32 = 2 * BLOCK_LEN;

    /// A payload of 2.5 pieces: two full ones and a one-block tail.
    fn payload() -> Vec<u8> {
        (0..2 * PIECE_LEN + BLOCK_LEN)
            .map(|i| (i % 251) as u8)
            .collect()
    }

    fn open_store(dir: &Path) -> (PieceStore, Vec<u8>) {
        let payload = payload();
        let metainfo = Metainfo::for_payload(
            "http://tracker.invalid/announce",
            "payload.bin",
            PIECE_LEN,
            &payload,
        )
        .unwrap();
        let store =
            PieceStore::open(&metainfo, dir, Duration::from_secs(60))
                .unwrap();
        (store, payload)
    }

    fn blocks_of(payload: &[u8], piece: usize) -> Vec<&[u8]> {
        let start = piece * PIECE_LEN as usize;
        let end = payload.len().min(start + PIECE_LEN as usize);
        payload[start..end].chunks(BLOCK_LEN as usize).collect()
    }

    #[test]
    fn test_deposit_completes_and_persists_piece() {
        let dir = tempfile::tempdir().unwrap();
        let (store, payload) = open_store(dir.path());
        let mut events = store.subscribe();

        let blocks = blocks_of(&payload, 0);
        assert_eq!(
            store.deposit_block(0, 0, blocks[0], 1).unwrap(),
            Deposit::Accepted
        );
        assert!(!store.have(0));
        assert_eq!(
            store.deposit_block(0, BLOCK_LEN, blocks[1], 1).unwrap(),
            Deposit::PieceCompleted
        );
        assert!(store.have(0));
        assert_eq!(events.try_recv().unwrap(), StoreEvent::PieceCompleted(0));

        // the bytes on disk are the verified ones
        let read = store
            .read_block(BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            })
            .unwrap();
        assert_eq!(&read[..], blocks[0]);
    }

    #[test]
    fn test_corrupt_piece_is_dropped_and_redownloadable() {
        let dir = tempfile::tempdir().unwrap();
        let (store, payload) = open_store(dir.path());
        let mut events = store.subscribe();

        let blocks = blocks_of(&payload, 0);
        let mut flipped = blocks[0].to_vec();
        flipped[0] ^= 1;
        store.deposit_block(0, 0, &flipped, 1).unwrap();
        assert_eq!(
            store.deposit_block(0, BLOCK_LEN, blocks[1], 1).unwrap(),
            Deposit::PieceCorrupt
        );
        assert_eq!(events.try_recv().unwrap(), StoreEvent::PieceCorrupt(0));
        assert!(!store.have(0));

        // the piece can be downloaded again, and completes this time
        store.deposit_block(0, 0, blocks[0], 2).unwrap();
        assert_eq!(
            store.deposit_block(0, BLOCK_LEN, blocks[1], 2).unwrap(),
            Deposit::PieceCompleted
        );
    }

    #[test]
    fn test_read_block_guards() {
        let dir = tempfile::tempdir().unwrap();
        let (store, payload) = open_store(dir.path());

        let block = BlockInfo {
            piece_index: 1,
            offset: 0,
            len: BLOCK_LEN,
        };
        assert!(matches!(
            store.read_block(block),
            Err(Error::PieceNotAvailable(1))
        ));

        for b in blocks_of(&payload, 1).iter().enumerate() {
            store
                .deposit_block(1, b.0 as u32 * BLOCK_LEN, b.1, 1)
                .unwrap();
        }
        assert!(store.read_block(block).is_ok());

        // a region escaping the piece is rejected even when complete
        assert!(matches!(
            store.read_block(BlockInfo {
                piece_index: 1,
                offset: PIECE_LEN - 1,
                len: 2,
            }),
            Err(Error::OutOfRange)
        ));
    }

    #[test]
    fn test_reservations_are_per_session_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        store.reserve_block(block, 1).unwrap();
        // same session may re-reserve, another session may not
        store.reserve_block(block, 1).unwrap();
        assert!(matches!(
            store.reserve_block(block, 2),
            Err(Error::AlreadyReserved)
        ));

        // releasing session 1 frees the block
        store.release_session(1);
        store.reserve_block(block, 2).unwrap();
    }

    #[test]
    fn test_next_request_prefers_in_flight_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        let all = Bitfield::repeat(true, store.piece_count());

        // session 1 starts piece 0
        let first = store.next_request(&all, 1, 8).unwrap();
        assert_eq!((first.piece_index, first.offset), (0, 0));

        // session 2 joins piece 0 rather than opening piece 1
        let second = store.next_request(&all, 2, 8).unwrap();
        assert_eq!((second.piece_index, second.offset), (0, BLOCK_LEN));

        // nothing left in piece 0, so the next block opens piece 1
        let third = store.next_request(&all, 2, 8).unwrap();
        assert_eq!((third.piece_index, third.offset), (1, 0));
    }

    #[test]
    fn test_next_request_respects_availability_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());

        let mut only_last = Bitfield::repeat(false, store.piece_count());
        only_last.set(2, true);
        let block = store.next_request(&only_last, 1, 8).unwrap();
        assert_eq!(block.piece_index, 2);
        // the tail piece is a single, short block
        assert_eq!(block.len, BLOCK_LEN);

        // the cap counts reservations already held
        assert_eq!(store.next_request(&only_last, 1, 1), None);

        let none = Bitfield::repeat(false, store.piece_count());
        assert_eq!(store.next_request(&none, 3, 8), None);
    }

    #[test]
    fn test_resume_rehashes_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let payload = payload();

        {
            let (store, _) = open_store(dir.path());
            for b in blocks_of(&payload, 1).iter().enumerate() {
                store
                    .deposit_block(1, b.0 as u32 * BLOCK_LEN, b.1, 1)
                    .unwrap();
            }
            store.flush().unwrap();
        }

        // a new store over the same directory finds piece 1 on disk
        let (store, _) = open_store(dir.path());
        assert!(!store.have(0));
        assert!(store.have(1));
        assert!(!store.have(2));
        assert_eq!(
            store.left(),
            PIECE_LEN as u64 + BLOCK_LEN as u64
        );
        let bitfield = store.bitfield();
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield[1]);
    }

    #[test]
    fn test_left_reaches_zero_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (store, payload) = open_store(dir.path());
        assert_eq!(store.left(), payload.len() as u64);

        for piece in 0..store.piece_count() {
            for b in blocks_of(&payload, piece).iter().enumerate() {
                store
                    .deposit_block(piece, b.0 as u32 * BLOCK_LEN, b.1, 1)
                    .unwrap();
            }
        }
        assert!(store.is_complete());
        assert_eq!(store.left(), 0);
    }

    #[test]
    fn test_misaligned_deposit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = open_store(dir.path());
        let data = vec![0; BLOCK_LEN as usize];
        assert!(matches!(
            store.deposit_block(0, 1, &data, 1),
            Err(Error::OutOfRange)
        ));
        assert!(matches!(
            store.deposit_block(0, 0, &data[..7], 1),
            Err(Error::OutOfRange)
        ));
    }
}
