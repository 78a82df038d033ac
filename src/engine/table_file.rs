//! On-disk image of a memory store: `MAGIC || msgpack(entries) || crc32c(payload)`.

use crate::engine::EngineError;
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

pub const TABLE_FILE: &str = "table.kvh";
const MAGIC: &[u8; 8] = b"KVHTBL01";
const CRC_LEN: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
struct TableData {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

pub fn table_exists(dir: &Path) -> bool {
    dir.join(TABLE_FILE).is_file()
}

/// Replaces the table file atomically via a temp file in the same directory.
pub fn write_table(dir: &Path, entries: &OrdMap<Vec<u8>, Vec<u8>>) -> Result<(), EngineError> {
    let data = TableData {
        entries: entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    let payload = rmp_serde::to_vec(&data).map_err(|e| EngineError::Encode(e.to_string()))?;
    let crc = crc32c::crc32c(&payload);

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(MAGIC)?;
    tmp.write_all(&payload)?;
    tmp.write_all(&crc.to_le_bytes())?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(TABLE_FILE))
        .map_err(|e| EngineError::Io(e.error))?;
    Ok(())
}

pub fn read_table(dir: &Path) -> Result<OrdMap<Vec<u8>, Vec<u8>>, EngineError> {
    let path = dir.join(TABLE_FILE);
    let bytes = fs::read(&path)?;
    let corruption = |detail: &str| EngineError::Corruption {
        path: path.display().to_string(),
        detail: detail.to_string(),
    };
    if bytes.len() < MAGIC.len() + CRC_LEN {
        return Err(corruption("table file too small"));
    }
    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(corruption("bad magic"));
    }
    let (payload, trailer) = bytes[MAGIC.len()..].split_at(bytes.len() - MAGIC.len() - CRC_LEN);
    let mut crc_bytes = [0u8; CRC_LEN];
    crc_bytes.copy_from_slice(trailer);
    if crc32c::crc32c(payload) != u32::from_le_bytes(crc_bytes) {
        return Err(corruption("checksum mismatch"));
    }
    let data: TableData =
        rmp_serde::from_slice(payload).map_err(|e| EngineError::Decode(e.to_string()))?;
    Ok(data.entries.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::{TABLE_FILE, read_table, table_exists, write_table};
    use crate::engine::EngineError;
    use im::OrdMap;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn table_survives_rewrite() {
        let dir = tempdir().expect("temp");
        assert!(!table_exists(dir.path()));
        let mut entries = OrdMap::new();
        entries.insert(b"a".to_vec(), b"1".to_vec());
        entries.insert(b"b".to_vec(), vec![0xff; 40]);
        write_table(dir.path(), &entries).expect("write");
        entries.insert(b"c".to_vec(), b"3".to_vec());
        write_table(dir.path(), &entries).expect("rewrite");
        assert!(table_exists(dir.path()));
        let loaded = read_table(dir.path()).expect("read");
        assert_eq!(loaded, entries);
    }

    #[test]
    fn flipped_byte_is_reported_as_corruption() {
        let dir = tempdir().expect("temp");
        let mut entries = OrdMap::new();
        entries.insert(b"key".to_vec(), b"value".to_vec());
        write_table(dir.path(), &entries).expect("write");
        let path = dir.path().join(TABLE_FILE);
        let mut bytes = fs::read(&path).expect("read bytes");
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x5a;
        fs::write(&path, bytes).expect("write corrupt");
        let err = read_table(dir.path()).expect_err("corrupt table");
        assert!(matches!(err, EngineError::Corruption { .. }));
    }

    #[test]
    fn truncated_file_is_reported_as_corruption() {
        let dir = tempdir().expect("temp");
        fs::write(dir.path().join(TABLE_FILE), b"KVH").expect("write");
        let err = read_table(dir.path()).expect_err("short table");
        assert!(matches!(err, EngineError::Corruption { .. }));
    }
}
