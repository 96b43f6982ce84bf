//! Image AES-key recovery for v4 accounts.
//!
//! The procedure is independent of the database key: collect `*_t.dat`
//! thumbnail templates from the account cache, recover the XOR stream key
//! from their trailing JPEG bytes, pull one AES-ECB ciphertext block out of
//! a type-2 template as a known-plaintext oracle, then scan the live
//! process's memory for a 32-character candidate that decrypts the oracle to
//! a JPEG header.

use std::path::{Path, PathBuf};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;
use regex::Regex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::platform::ProcessMemory;

const MAX_TEMPLATES: usize = 32;
const KEEP_TEMPLATES: usize = 16;
const JPEG_TAIL: [u8; 2] = [0xFF, 0xD9];
const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// Type-2 template header whose bytes `0x0F..0x1F` are one AES block.
const ORACLE_HEADER: [u8; 6] = [0x07, 0x08, 0x56, 0x32, 0x08, 0x07];
const ORACLE_START: usize = 0x0F;
const ORACLE_END: usize = 0x1F;

const SCAN_CHUNK: usize = 4 * 1024 * 1024;
const SCAN_OVERLAP: usize = 65;
const MAX_REGION: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ImageKeyResult {
    pub xor_key: u8,
    /// 16-character AES-128 secret.
    pub aes_key: String,
}

/// Locate candidate account cache directories under the user profile.
/// Directories carrying `db_storage` or `FileStorage/Image` rank first.
pub fn find_cache_dirs() -> Result<Vec<PathBuf>> {
    let profile = std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .ok_or(Error::NoCache)?;
    let root = PathBuf::from(profile).join("Documents").join("xwechat_files");
    if !root.is_dir() {
        return Err(Error::NoCache);
    }

    let mut high = Vec::new();
    let mut low = Vec::new();
    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let lower = name.to_ascii_lowercase();
        if ["all", "applet", "backup", "wmpf"]
            .iter()
            .any(|p| lower.starts_with(p))
        {
            continue;
        }
        if !name.starts_with("wxid_") && name.len() <= 5 {
            continue;
        }
        let dir = entry.path();
        if dir.join("db_storage").is_dir() || dir.join("FileStorage").join("Image").is_dir() {
            high.push(dir);
        } else {
            low.push(dir);
        }
    }

    let mut out = if high.is_empty() { low } else { high };
    out.sort();
    if out.is_empty() {
        Err(Error::NoCache)
    } else {
        Ok(out)
    }
}

/// Collect up to 32 `*_t.dat` templates, newest month first, keep 16.
pub fn find_template_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with("_t.dat") {
            files.push(entry.into_path());
            if files.len() >= MAX_TEMPLATES {
                break;
            }
        }
    }
    if files.is_empty() {
        return Err(Error::NoTemplates);
    }

    let date = Regex::new(r"(\d{4}-\d{2})")?;
    let month = |p: &Path| -> String {
        date.find(&p.to_string_lossy())
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    };
    files.sort_by(|a, b| month(b).cmp(&month(a)));
    files.truncate(KEEP_TEMPLATES);
    Ok(files)
}

/// Recover the XOR key from template trailers: the most common trailing byte
/// pair must satisfy `x ^ 0xFF == y ^ 0xD9` (the fixed JPEG tail).
pub fn xor_key_from_templates(files: &[PathBuf]) -> Result<u8> {
    let mut tally: std::collections::HashMap<(u8, u8), usize> = std::collections::HashMap::new();
    for path in files {
        let Ok(data) = std::fs::read(path) else {
            continue;
        };
        if data.len() >= 2 {
            let pair = (data[data.len() - 2], data[data.len() - 1]);
            *tally.entry(pair).or_insert(0) += 1;
        }
    }

    let (x, y) = tally
        .into_iter()
        .max_by_key(|&(_, count)| count)
        .map(|(pair, _)| pair)
        .ok_or(Error::NoTemplates)?;

    let key = x ^ JPEG_TAIL[0];
    if key != y ^ JPEG_TAIL[1] {
        return Err(Error::XorKeyMismatch);
    }
    Ok(key)
}

/// Find a type-2 template and take its oracle ciphertext block.
pub fn oracle_from_templates(files: &[PathBuf]) -> Result<[u8; 16]> {
    for path in files {
        let Ok(data) = std::fs::read(path) else {
            continue;
        };
        if data.len() >= ORACLE_END && data[..6] == ORACLE_HEADER {
            let mut block = [0u8; 16];
            block.copy_from_slice(&data[ORACLE_START..ORACLE_END]);
            return Ok(block);
        }
    }
    Err(Error::NoOracle)
}

fn is_alnum(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

/// Decrypt the oracle block with the candidate's first 16 bytes and look for
/// the JPEG magic.
pub(crate) fn verify_candidate(oracle: &[u8; 16], candidate: &[u8]) -> bool {
    if candidate.len() < 16 {
        return false;
    }
    let cipher = Aes128::new(GenericArray::from_slice(&candidate[..16]));
    let mut block = *oracle;
    cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
    block[..3] == JPEG_MAGIC
}

/// 32 ASCII-alphanumeric bytes bounded by non-alphanumeric neighbours.
pub(crate) fn search_ascii_key(data: &[u8], oracle: &[u8; 16]) -> Option<Vec<u8>> {
    if data.len() < 34 {
        return None;
    }
    for i in 0..data.len() - 34 {
        if is_alnum(data[i]) {
            continue;
        }
        if !data[i + 1..i + 33].iter().all(|&b| is_alnum(b)) {
            continue;
        }
        if i + 33 < data.len() && is_alnum(data[i + 33]) {
            continue;
        }
        let candidate = &data[i + 1..i + 33];
        if verify_candidate(oracle, candidate) {
            return Some(candidate.to_vec());
        }
    }
    None
}

/// The same key stored as UTF-16LE: alternating ASCII-alphanumeric and zero
/// bytes over 64 positions.
pub(crate) fn search_utf16_key(data: &[u8], oracle: &[u8; 16]) -> Option<Vec<u8>> {
    if data.len() < 65 {
        return None;
    }
    'outer: for i in 0..data.len() - 65 {
        for j in 0..32 {
            let ch = data[i + j * 2];
            let hi = data[i + j * 2 + 1];
            if hi != 0 || !is_alnum(ch) {
                continue 'outer;
            }
        }
        let candidate: Vec<u8> = (0..32).map(|j| data[i + j * 2]).collect();
        if verify_candidate(oracle, &candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Walk the process's memory in overlapping chunks looking for a verified
/// key candidate.
fn scan_process_memory(pid: u32, oracle: &[u8; 16], cancel: &CancelToken) -> Result<Vec<u8>> {
    let mem = ProcessMemory::open(pid)?;
    let regions = mem.regions();
    debug!(count = regions.len(), "scanning candidate memory regions");

    for region in regions {
        if region.size > MAX_REGION {
            continue;
        }
        let mut offset = 0usize;
        let mut trailing: Vec<u8> = Vec::new();

        while offset < region.size {
            if cancel.is_canceled() {
                return Err(Error::Canceled);
            }
            let chunk_size = (region.size - offset).min(SCAN_CHUNK);
            let chunk = match mem.read_chunk(region.base + offset, chunk_size) {
                Ok(c) if !c.is_empty() => c,
                _ => {
                    offset += chunk_size;
                    trailing.clear();
                    continue;
                }
            };

            let mut data = std::mem::take(&mut trailing);
            data.extend_from_slice(&chunk);

            if let Some(key) = search_ascii_key(&data, oracle) {
                return Ok(key);
            }
            if let Some(key) = search_utf16_key(&data, oracle) {
                return Ok(key);
            }

            if data.len() > SCAN_OVERLAP {
                trailing = data[data.len() - SCAN_OVERLAP..].to_vec();
            }
            offset += chunk_size;
        }
    }
    Err(Error::NoMatchInMemory)
}

/// Full image-key recovery for one account (see the module docs for the
/// procedure). `cache_dir` falls back to auto-detection when not supplied.
pub fn extract_image_key(
    pid: u32,
    cache_dir: Option<&Path>,
    cancel: &CancelToken,
) -> Result<ImageKeyResult> {
    let cache = match cache_dir {
        Some(dir) => dir.to_path_buf(),
        None => find_cache_dirs()?
            .into_iter()
            .next()
            .ok_or(Error::NoCache)?,
    };
    info!(cache = %cache.display(), "collecting image templates");

    let templates = find_template_files(&cache)?;
    let xor_key = xor_key_from_templates(&templates)?;
    debug!(key = format!("0x{xor_key:02x}"), "xor key recovered");

    let oracle = oracle_from_templates(&templates)?;

    let key_bytes = scan_process_memory(pid, &oracle, cancel)?;
    let mut aes_key = String::from_utf8_lossy(&key_bytes).into_owned();
    aes_key.truncate(16);
    info!("image aes key recovered");

    Ok(ImageKeyResult { xor_key, aes_key })
}
