//! v3 database-key extraction: direct process-memory scan validated by a
//! known-plaintext oracle.
//!
//! The legacy client keeps the raw 32-byte key in writable memory behind a
//! pointer. The scanner walks candidate regions, treats every aligned
//! machine word as a potential pointer into another region, reads 32 bytes
//! at the target, and accepts the first candidate whose derived schedule
//! authenticates page 1 of a known database file.

use std::path::Path;

use tracing::{debug, info};

use crate::account::Platform;
use crate::cancel::CancelToken;
use crate::decrypt::{PageDecryptor, KEY_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::platform::{MemoryRegion, ProcessMemory};

const SCAN_CHUNK: usize = 4 * 1024 * 1024;
const MAX_REGION: usize = 100 * 1024 * 1024;
const POINTER_ALIGN: usize = std::mem::size_of::<usize>();
const MAX_ZERO_BYTES: usize = 5;

/// A raw key is 32 high-entropy bytes; long zero runs rule a candidate out
/// before the expensive KDF check.
pub(crate) fn plausible_key(bytes: &[u8]) -> bool {
    bytes.len() == KEY_SIZE && bytes.iter().filter(|&&b| b == 0).count() < MAX_ZERO_BYTES
}

fn region_containing(regions: &[MemoryRegion], addr: usize) -> bool {
    regions
        .iter()
        .any(|r| addr >= r.base && addr + KEY_SIZE <= r.base + r.size)
}

/// Recover the v3 data key from process `pid`, using the first page of
/// `known_db` as the verification oracle. Returns the key as hex.
pub fn extract_v3_data_key(pid: u32, known_db: &Path, cancel: &CancelToken) -> Result<String> {
    let mut first_page = vec![0u8; PAGE_SIZE];
    {
        use std::io::Read;
        let mut file = std::fs::File::open(known_db)?;
        let n = file.read(&mut first_page)?;
        if n < PAGE_SIZE {
            return Err(Error::Malformed(format!(
                "oracle database shorter than one page: {n} bytes"
            )));
        }
    }
    if first_page.starts_with(crate::decrypt::SQLITE_MAGIC) {
        return Err(Error::AlreadyDecrypted);
    }

    let oracle = PageDecryptor::new(Platform::Windows, 3)?;
    let mem = ProcessMemory::open(pid)?;
    let regions = mem.regions();
    info!(regions = regions.len(), "scanning process memory for the v3 key");

    for region in &regions {
        if region.size > MAX_REGION {
            continue;
        }
        let mut offset = 0usize;
        while offset < region.size {
            if cancel.is_canceled() {
                return Err(Error::Canceled);
            }
            let chunk_size = (region.size - offset).min(SCAN_CHUNK);
            let chunk = match mem.read_chunk(region.base + offset, chunk_size) {
                Ok(c) if c.len() >= POINTER_ALIGN => c,
                _ => {
                    offset += chunk_size;
                    continue;
                }
            };

            for window in chunk.chunks_exact(POINTER_ALIGN) {
                let addr = usize::from_le_bytes(match window.try_into() {
                    Ok(arr) => arr,
                    Err(_) => continue,
                });
                if addr == 0 || !region_containing(&regions, addr) {
                    continue;
                }
                let Ok(candidate) = mem.read_chunk(addr, KEY_SIZE) else {
                    continue;
                };
                if !plausible_key(&candidate) {
                    continue;
                }
                if oracle.verify_key(&first_page, &candidate) {
                    debug!(addr = format!("0x{addr:x}"), "v3 key located");
                    return Ok(hex::encode(candidate));
                }
            }
            offset += chunk_size;
        }
    }

    Err(Error::NoValidKey)
}
