use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::index::CacheIndex;

/// On-disk state for one cached resource: a data file holding raw bytes at
/// their true offsets, and a JSON index file describing which ranges are
/// present.
///
/// Exclusively owned by one cache engine; there is no cross-process locking.
#[derive(Debug)]
pub struct CacheStorage {
    data_path: PathBuf,
    index_path: PathBuf,
    index: CacheIndex,
}

/// Percent-encoding roughly triples most URL bytes; stems longer than this
/// would overflow the common 255-byte filename limit once the `.data` and
/// `.index` suffixes are added.
const MAX_STEM_LEN: usize = 120;

/// Derive a filename-safe, deterministic stem from the origin URL so that
/// re-requesting the same URL finds the same cache files.
///
/// Short URLs stay readable (and reversible); long ones keep a readable
/// prefix and are disambiguated by a digest of the full URL.
fn file_stem_for_url(url: &str) -> String {
    let encoded = utf8_percent_encode(url, NON_ALPHANUMERIC).to_string();
    if encoded.len() <= MAX_STEM_LEN {
        return encoded;
    }
    let digest = Sha256::digest(url.as_bytes());
    format!("{}-{:x}", &encoded[..MAX_STEM_LEN], digest)
}

impl CacheStorage {
    /// Open (or initialize) storage for `origin_url` under `cache_dir`.
    ///
    /// Creating the cache directory is the one unconditionally fatal
    /// operation here. A corrupt index file is self-healing: both files are
    /// discarded and the cache starts empty.
    pub fn open(cache_dir: &Path, origin_url: &str) -> Result<Self> {
        fs::create_dir_all(cache_dir).map_err(|e| {
            CacheError::Configuration(format!(
                "Failed to create cache directory {:?}: {}",
                cache_dir, e
            ))
        })?;

        let stem = file_stem_for_url(origin_url);
        let data_path = cache_dir.join(format!("{}.data", stem));
        let index_path = cache_dir.join(format!("{}.index", stem));

        let index = Self::load_index(&index_path).unwrap_or_else(|e| {
            warn!(
                "Failed to load cache index {:?}: {}, discarding stale cache files",
                index_path, e
            );
            let _ = fs::remove_file(&index_path);
            let _ = fs::remove_file(&data_path);
            CacheIndex::new()
        });

        info!(
            "Cache storage opened at {:?} ({} ranges, {} bytes cached)",
            data_path,
            index.ranges.len(),
            index.ranges.total_cached_bytes()
        );

        Ok(Self {
            data_path,
            index_path,
            index,
        })
    }

    fn load_index(index_path: &Path) -> Result<CacheIndex> {
        if !index_path.exists() {
            return Ok(CacheIndex::new());
        }
        let contents = fs::read_to_string(index_path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Serialize the current index and overwrite the index file.
    ///
    /// Callers treat failures as non-fatal; the in-memory index stays
    /// authoritative for the current run.
    pub fn save_index(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.index)?;
        fs::write(&self.index_path, contents)?;
        Ok(())
    }

    /// Write `data` into the data file at the absolute `offset`, creating
    /// the file if it does not exist. The file may be sparse; holes are
    /// never read because reads are gated by the range index.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.data_path)?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;

        debug!(
            "Wrote {} bytes at offset {} to {:?}",
            data.len(),
            offset,
            self.data_path
        );
        Ok(())
    }

    /// Read exactly `length` bytes at `offset` from the data file.
    ///
    /// Callers must have validated coverage against the range index first.
    pub fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = File::open(&self.data_path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut CacheIndex {
        &mut self.index
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}
