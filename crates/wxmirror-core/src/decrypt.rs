//! Per-page decryption of the messenger's SQLCipher-style database files.
//!
//! The vendor container differs from plain SQLite in two ways: page 1 opens
//! with a random 16-byte salt instead of the `SQLite format 3\0` magic, and
//! every page ends with a reserved trailer holding the CBC IV and an HMAC
//! over the page body. Each page decrypts and verifies independently.

use std::io::{Read, Write};
use std::path::Path;

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use sha1::Sha1;
use sha2::Sha512;
use tracing::{debug, warn};

use crate::account::Platform;
use crate::error::{Error, Result};

pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
pub const PAGE_SIZE: usize = 4096;
pub const SALT_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

const IV_SIZE: usize = 16;
const AES_BLOCK: usize = 16;
const MAC_SALT_XOR: u8 = 0x3A;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KdfHash {
    Sha1,
    Sha512,
}

/// Version-specific constants. The selection key is `(platform, major)`;
/// both host platforms share one profile per generation.
#[derive(Debug, Clone, Copy)]
pub struct CipherProfile {
    kdf: KdfHash,
    iterations: u32,
    hmac_len: usize,
}

impl CipherProfile {
    const V3: Self = Self {
        kdf: KdfHash::Sha1,
        iterations: 64_000,
        hmac_len: 20,
    };

    const V4: Self = Self {
        kdf: KdfHash::Sha512,
        iterations: 256_000,
        hmac_len: 64,
    };

    pub fn new(platform: Platform, version: u8) -> Result<Self> {
        match version {
            3 => Ok(Self::V3),
            4 => Ok(Self::V4),
            _ => Err(Error::PlatformUnsupported { platform, version }),
        }
    }

    /// Trailer bytes reserved at the end of every page: IV plus HMAC,
    /// rounded up to the AES block size (48 for v3, 80 for v4).
    fn reserve(&self) -> usize {
        let raw = IV_SIZE + self.hmac_len;
        raw.div_ceil(AES_BLOCK) * AES_BLOCK
    }
}

/// Derived per-file keys, cached for the whole file once the salt is known.
pub struct KeySchedule {
    enc_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

pub struct PageDecryptor {
    profile: CipherProfile,
}

impl PageDecryptor {
    pub fn new(platform: Platform, version: u8) -> Result<Self> {
        Ok(Self {
            profile: CipherProfile::new(platform, version)?,
        })
    }

    /// PBKDF2 schedule: `enc_key` from the raw key and the page-1 salt,
    /// `mac_key` from `enc_key` and the salt XORed with 0x3A (2 rounds).
    pub fn derive(&self, key: &[u8], salt: &[u8; SALT_SIZE]) -> KeySchedule {
        let mut mac_salt = [0u8; SALT_SIZE];
        for (out, &b) in mac_salt.iter_mut().zip(salt.iter()) {
            *out = b ^ MAC_SALT_XOR;
        }
        match self.profile.kdf {
            KdfHash::Sha1 => {
                let enc_key =
                    pbkdf2_hmac_array::<Sha1, KEY_SIZE>(key, salt, self.profile.iterations);
                let mac_key = pbkdf2_hmac_array::<Sha1, KEY_SIZE>(&enc_key, &mac_salt, 2);
                KeySchedule { enc_key, mac_key }
            }
            KdfHash::Sha512 => {
                let enc_key =
                    pbkdf2_hmac_array::<Sha512, KEY_SIZE>(key, salt, self.profile.iterations);
                let mac_key = pbkdf2_hmac_array::<Sha512, KEY_SIZE>(&enc_key, &mac_salt, 2);
                KeySchedule { enc_key, mac_key }
            }
        }
    }

    /// HMAC over `data` (ciphertext body plus IV) and the big-endian 1-based
    /// page index.
    fn page_hmac(&self, sched: &KeySchedule, data: &[u8], page_no: u32) -> Result<Vec<u8>> {
        let tag = match self.profile.kdf {
            KdfHash::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(&sched.mac_key)
                    .map_err(|e| Error::Malformed(e.to_string()))?;
                mac.update(data);
                mac.update(&page_no.to_be_bytes());
                mac.finalize().into_bytes().to_vec()
            }
            KdfHash::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(&sched.mac_key)
                    .map_err(|e| Error::Malformed(e.to_string()))?;
                mac.update(data);
                mac.update(&page_no.to_be_bytes());
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(tag)
    }

    /// Check a candidate raw key against the first page of a file. This is
    /// the known-plaintext oracle used by the memory scanners.
    pub fn verify_key(&self, first_page: &[u8], key: &[u8]) -> bool {
        if first_page.len() < PAGE_SIZE || key.len() != KEY_SIZE {
            return false;
        }
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&first_page[..SALT_SIZE]);
        let sched = self.derive(key, &salt);

        let reserve = self.profile.reserve();
        let body_end = PAGE_SIZE - reserve;
        let Ok(mac) = self.page_hmac(&sched, &first_page[SALT_SIZE..body_end + IV_SIZE], 1) else {
            return false;
        };
        mac.as_slice() == &first_page[body_end + IV_SIZE..body_end + IV_SIZE + self.profile.hmac_len]
    }

    /// Decrypt an entire container from `input` into `output`.
    ///
    /// Empty input produces empty output. Input that already starts with the
    /// SQLite magic fails with [`Error::AlreadyDecrypted`] so the caller can
    /// copy the bytes as-is. A page-1 HMAC mismatch aborts the file with
    /// [`Error::InvalidKey`]; mismatches on later pages are logged and the
    /// page is still emitted, because partially synced files do occur.
    pub fn decrypt<R: Read, W: Write>(&self, mut input: R, key: &[u8], output: &mut W) -> Result<()> {
        let mut page = vec![0u8; PAGE_SIZE];
        let n = read_full(&mut input, &mut page)?;
        if n == 0 {
            return Ok(());
        }
        if page[..n].starts_with(SQLITE_MAGIC) {
            return Err(Error::AlreadyDecrypted);
        }
        if n < PAGE_SIZE {
            return Err(Error::Malformed(format!("truncated first page: {n} bytes")));
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&page[..SALT_SIZE]);
        let sched = self.derive(key, &salt);

        self.decrypt_page(&sched, &mut page, 1, output, true)?;

        let mut page_no: u32 = 1;
        loop {
            let n = read_full(&mut input, &mut page)?;
            if n == 0 {
                break;
            }
            page_no += 1;
            if n < PAGE_SIZE {
                warn!(page_no, bytes = n, "trailing partial page copied verbatim");
                output.write_all(&page[..n])?;
                break;
            }
            // Some files carry fully zeroed preallocated pages; pass them
            // through untouched.
            if page.iter().all(|&b| b == 0) {
                output.write_all(&page)?;
                continue;
            }
            self.decrypt_page(&sched, &mut page, page_no, output, false)?;
        }
        output.flush()?;
        debug!(pages = page_no, "container decrypted");
        Ok(())
    }

    /// Convenience wrapper over [`Self::decrypt`] for a file path.
    pub fn decrypt_file<W: Write>(&self, src: &Path, key: &[u8], output: &mut W) -> Result<()> {
        let file = std::fs::File::open(src)?;
        self.decrypt(std::io::BufReader::new(file), key, output)
    }

    fn decrypt_page<W: Write>(
        &self,
        sched: &KeySchedule,
        page: &mut [u8],
        page_no: u32,
        output: &mut W,
        strict: bool,
    ) -> Result<()> {
        let reserve = self.profile.reserve();
        let offset = if page_no == 1 { SALT_SIZE } else { 0 };
        let body_end = PAGE_SIZE - reserve;

        let mac = self.page_hmac(sched, &page[offset..body_end + IV_SIZE], page_no)?;
        let stored = &page[body_end + IV_SIZE..body_end + IV_SIZE + self.profile.hmac_len];
        if mac.as_slice() != stored {
            if strict {
                return Err(Error::InvalidKey);
            }
            warn!(page_no, "page hmac mismatch, emitting best-effort plaintext");
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&page[body_end..body_end + IV_SIZE]);

        let body = &mut page[offset..body_end];
        Aes256CbcDec::new(&sched.enc_key.into(), &iv.into())
            .decrypt_padded_mut::<NoPadding>(body)
            .map_err(|_| Error::Malformed("page body is not block aligned".into()))?;

        if page_no == 1 {
            output.write_all(SQLITE_MAGIC)?;
        }
        output.write_all(&page[offset..body_end])?;
        // Keep the trailer so page boundaries (and the reserved-space byte in
        // the database header) stay consistent.
        output.write_all(&page[body_end..])?;
        Ok(())
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
