//! Append-only flat files holding full blocks and their undo data.
//!
//! Records are framed as `[magic: 4][len: u32 LE][payload]`. Undo payloads
//! are followed by `sha256d(block_hash || payload)` so a torn or misplaced
//! record is detected on read.
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bitcoin::{
    consensus,
    hashes::{sha256d, Hash},
    Block, BlockHash,
};
use tracing::{debug, info};

use crate::coins::BlockUndo;
use crate::error::StoreError;

/// Largest size a block file grows to before a new one is started.
pub const MAX_BLOCKFILE_SIZE: u64 = 128 * 1024 * 1024;

const FRAME_HEADER: u64 = 8;
const CHECKSUM_LEN: usize = 32;

/// Location of a payload inside the numbered flat files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlatFilePos {
    /// File number, `blk{file:05}.dat` / `rev{file:05}.dat`.
    pub file: u32,
    /// Byte offset of the payload (just past the frame header).
    pub pos: u32,
}

impl FlatFilePos {
    /// Position `pos` in file `file`.
    pub const fn new(file: u32, pos: u32) -> Self {
        Self { file, pos }
    }
}

#[derive(Debug)]
struct AppendState {
    current_file: u32,
}

/// Block and undo files under one directory.
#[derive(Debug)]
pub struct BlockStore {
    dir: PathBuf,
    magic: [u8; 4],
    append: Mutex<AppendState>,
}

impl BlockStore {
    /// Open (creating if needed) the block directory. Appends continue in
    /// the highest numbered existing block file.
    pub fn open(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let current_file = list_numbered(&dir, "blk")?
            .last()
            .map(|(n, _)| *n)
            .unwrap_or(0);
        debug!(target: "blockstorage", dir = %dir.display(), current_file, "opened block store");
        Ok(Self {
            dir,
            magic,
            append: Mutex::new(AppendState { current_file }),
        })
    }

    /// Directory holding the flat files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Network magic framing each record.
    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    fn block_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("blk{file:05}.dat"))
    }

    fn undo_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("rev{file:05}.dat"))
    }

    /// Append `block` and fsync. The returned position may be linked to the
    /// index entry once this returns.
    pub fn write_block(&self, block: &Block) -> Result<FlatFilePos, StoreError> {
        let payload = consensus::serialize(block);
        let mut state = self
            .append
            .lock()
            .map_err(|_| StoreError::CorruptData("append lock poisoned".into()))?;

        let len = file_len(&self.block_path(state.current_file))?;
        if len > 0 && len + FRAME_HEADER + payload.len() as u64 > MAX_BLOCKFILE_SIZE {
            state.current_file += 1;
            info!(target: "blockstorage", file = state.current_file, "starting new block file");
        }
        let file = state.current_file;
        let pos = append_record(&self.block_path(file), self.magic, &payload)?;
        debug!(target: "blockstorage", hash = %block.block_hash(), file, pos, "wrote block");
        Ok(FlatFilePos::new(file, pos))
    }

    /// Read and decode the block at `pos`.
    pub fn read_block(&self, pos: FlatFilePos) -> Result<Block, StoreError> {
        let payload = read_record(&self.block_path(pos.file), self.magic, pos.pos)?;
        consensus::deserialize(&payload)
            .map_err(|e| StoreError::CorruptData(format!("block at {pos:?}: {e}")))
    }

    /// Append undo data for the block stored at `block_pos` to the matching
    /// rev file.
    pub fn write_undo(
        &self,
        block_pos: FlatFilePos,
        block_hash: &BlockHash,
        undo: &BlockUndo,
    ) -> Result<FlatFilePos, StoreError> {
        let mut payload = undo.encode();
        let checksum = undo_checksum(block_hash, &payload);
        payload.extend_from_slice(&checksum);

        let _guard = self
            .append
            .lock()
            .map_err(|_| StoreError::CorruptData("append lock poisoned".into()))?;
        let pos = append_record(&self.undo_path(block_pos.file), self.magic, &payload)?;
        debug!(target: "blockstorage", hash = %block_hash, file = block_pos.file, pos, "wrote undo");
        Ok(FlatFilePos::new(block_pos.file, pos))
    }

    /// Read the undo data at `pos` and verify it belongs to `block_hash`.
    pub fn read_undo(&self, pos: FlatFilePos, block_hash: &BlockHash) -> Result<BlockUndo, StoreError> {
        let payload = read_record(&self.undo_path(pos.file), self.magic, pos.pos)?;
        if payload.len() < CHECKSUM_LEN {
            return Err(StoreError::CorruptData(format!("undo at {pos:?} too short")));
        }
        let (body, checksum) = payload.split_at(payload.len() - CHECKSUM_LEN);
        if undo_checksum(block_hash, body).as_slice() != checksum {
            return Err(StoreError::CorruptData(format!(
                "undo checksum mismatch at {pos:?} for {block_hash}"
            )));
        }
        BlockUndo::decode(body)
    }

    /// Existing block files in ascending file-number order.
    pub fn scan_block_files(&self) -> Result<Vec<(u32, PathBuf)>, StoreError> {
        list_numbered(&self.dir, "blk")
    }
}

fn undo_checksum(block_hash: &BlockHash, body: &[u8]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(32 + body.len());
    buf.extend_from_slice(block_hash.as_byte_array());
    buf.extend_from_slice(body);
    sha256d::Hash::hash(&buf).to_byte_array()
}

fn file_len(path: &Path) -> Result<u64, StoreError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn append_record(path: &Path, magic: [u8; 4], payload: &[u8]) -> Result<u32, StoreError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let start = file.metadata()?.len();
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::CorruptData(format!("record of {} bytes", payload.len())))?;
    let pos = u32::try_from(start + FRAME_HEADER)
        .map_err(|_| StoreError::CorruptData(format!("{} is full", path.display())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER as usize + payload.len());
    frame.extend_from_slice(&magic);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    file.write_all(&frame)?;
    file.sync_all()?;
    Ok(pos)
}

fn read_record(path: &Path, magic: [u8; 4], pos: u32) -> Result<Vec<u8>, StoreError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let start = u64::from(pos)
        .checked_sub(FRAME_HEADER)
        .ok_or_else(|| StoreError::CorruptData(format!("position {pos} inside frame header")))?;
    file.seek(SeekFrom::Start(start))?;

    let mut header = [0u8; FRAME_HEADER as usize];
    file.read_exact(&mut header)
        .map_err(|e| StoreError::CorruptData(format!("{} at {pos}: {e}", path.display())))?;
    if header[..4] != magic {
        return Err(StoreError::CorruptData(format!(
            "bad magic in {} at {pos}",
            path.display()
        )));
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let remaining = file.metadata()?.len().saturating_sub(u64::from(pos));
    if u64::from(len) > remaining {
        return Err(StoreError::CorruptData(format!(
            "record of {len} bytes at {pos} overruns {} ({remaining} bytes left)",
            path.display()
        )));
    }
    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)
        .map_err(|e| StoreError::CorruptData(format!("{} at {pos}: {e}", path.display())))?;
    Ok(payload)
}

fn list_numbered(dir: &Path, prefix: &str) -> Result<Vec<(u32, PathBuf)>, StoreError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let number = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(".dat"))
            .and_then(|digits| digits.parse::<u32>().ok());
        if let Some(n) = number {
            out.push((n, path));
        }
    }
    out.sort_by_key(|(n, _)| *n);
    Ok(out)
}

/// Locate framed records in a raw block file.
///
/// Returns `(payload_offset, payload)` pairs. Bytes that do not start with
/// `magic` are skipped one at a time, so zero padding or garbage between
/// records is tolerated; a truncated final record is dropped.
pub fn scan_records(bytes: &[u8], magic: [u8; 4]) -> Vec<(u32, &[u8])> {
    let mut out = Vec::new();
    let mut at = 0usize;
    while at + FRAME_HEADER as usize <= bytes.len() {
        if bytes[at..at + 4] != magic {
            at += 1;
            continue;
        }
        let len = u32::from_le_bytes([bytes[at + 4], bytes[at + 5], bytes[at + 6], bytes[at + 7]])
            as usize;
        let start = at + FRAME_HEADER as usize;
        let Some(end) = start.checked_add(len).filter(|end| *end <= bytes.len()) else {
            break;
        };
        out.push((start as u32, &bytes[start..end]));
        at = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainparams::{ChainParams, ChainType};
    use crate::coins::{Coin, TxUndo};
    use bitcoin::{Amount, ScriptBuf, TxOut};

    fn store() -> (tempfile::TempDir, BlockStore) {
        let dir = tempfile::tempdir().unwrap();
        let params = ChainParams::new(ChainType::Regtest);
        let store = BlockStore::open(dir.path().join("blocks"), params.magic()).unwrap();
        (dir, store)
    }

    #[test]
    fn block_roundtrip_and_scan() {
        let (_dir, store) = store();
        let genesis = ChainParams::new(ChainType::Regtest).genesis_block().clone();
        let first = store.write_block(&genesis).unwrap();
        let second = store.write_block(&genesis).unwrap();
        assert_eq!(first, FlatFilePos::new(0, 8));
        assert!(second.pos > first.pos);
        assert_eq!(store.read_block(second).unwrap(), genesis);

        let files = store.scan_block_files().unwrap();
        assert_eq!(files.len(), 1);
        let bytes = fs::read(&files[0].1).unwrap();
        let records = scan_records(&bytes, store.magic());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].0, second.pos);
    }

    #[test]
    fn undo_checksum_binds_block_hash() {
        let (_dir, store) = store();
        let genesis = ChainParams::new(ChainType::Regtest).genesis_block().clone();
        let block_pos = store.write_block(&genesis).unwrap();
        let undo = BlockUndo {
            txs: vec![TxUndo {
                spent: vec![Coin {
                    output: TxOut {
                        value: Amount::from_sat(5_000),
                        script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
                    },
                    height: 7,
                    is_coinbase: true,
                }],
            }],
        };
        let hash = genesis.block_hash();
        let pos = store.write_undo(block_pos, &hash, &undo).unwrap();
        assert_eq!(store.read_undo(pos, &hash).unwrap(), undo);

        let other = BlockHash::all_zeros();
        assert!(matches!(
            store.read_undo(pos, &other),
            Err(StoreError::CorruptData(_))
        ));
    }

    #[test]
    fn oversized_length_is_corrupt_data() {
        let (_dir, store) = store();
        let genesis = ChainParams::new(ChainType::Regtest).genesis_block().clone();
        let pos = store.write_block(&genesis).unwrap();

        let mut file = OpenOptions::new().write(true).open(store.block_path(pos.file)).unwrap();
        file.seek(SeekFrom::Start(u64::from(pos.pos) - 4)).unwrap();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        drop(file);

        let err = store.read_block(pos).unwrap_err();
        assert!(matches!(err, StoreError::CorruptData(ref msg) if msg.contains("overruns")), "{err}");
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.read_block(FlatFilePos::new(3, 8)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn scan_skips_garbage_and_truncation() {
        let magic = [1, 2, 3, 4];
        let mut bytes = vec![0u8; 5];
        bytes.extend_from_slice(&magic);
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        bytes.extend_from_slice(&magic);
        bytes.extend_from_slice(&50u32.to_le_bytes());
        bytes.extend_from_slice(b"short");
        let records = scan_records(&bytes, magic);
        assert_eq!(records, vec![(13, &b"abc"[..])]);
    }
}
