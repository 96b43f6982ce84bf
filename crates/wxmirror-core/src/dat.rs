//! Decoder for the messenger's layered image cache containers.
//!
//! Two families exist on disk: the v3 single-byte XOR stream, and the v4
//! container with a 15-byte header followed by an AES-ECB encrypted prefix,
//! a raw middle, and an XOR-encrypted tail. Both decode to a standard image
//! format (or the vendor animated `wxgf`, which an external transcoder
//! handles).

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;
use parking_lot::RwLock;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct ImageFormat {
    pub header: &'static [u8],
    pub ext: &'static str,
}

pub const JPG: ImageFormat = ImageFormat { header: &[0xFF, 0xD8, 0xFF], ext: "jpg" };
pub const PNG: ImageFormat = ImageFormat { header: &[0x89, 0x50, 0x4E, 0x47], ext: "png" };
pub const GIF: ImageFormat = ImageFormat { header: &[0x47, 0x49, 0x46, 0x38], ext: "gif" };
pub const TIFF: ImageFormat = ImageFormat { header: &[0x49, 0x49, 0x2A, 0x00], ext: "tiff" };
pub const BMP: ImageFormat = ImageFormat { header: &[0x42, 0x4D], ext: "bmp" };
/// Vendor animated format; decoded bytes are handed to an external transcoder.
pub const WXGF: ImageFormat = ImageFormat { header: &[0x77, 0x78, 0x67, 0x66], ext: "wxgf" };

pub const FORMATS: &[ImageFormat] = &[JPG, PNG, GIF, TIFF, BMP, WXGF];

/// v4 container signatures. Type 1 ships with a fixed key; type 2 uses the
/// per-account key recovered from process memory.
const V4_HEADER_1: &[u8; 6] = &[0x07, 0x08, 0x56, 0x31, 0x08, 0x07];
const V4_HEADER_2: &[u8; 6] = &[0x07, 0x08, 0x56, 0x32, 0x08, 0x07];
const V4_HEADER_LEN: usize = 15;
const AES_BLOCK: usize = 16;

const JPEG_TAIL: [u8; 2] = [0xFF, 0xD9];

/// Built-in key for v4 type-1 containers.
const DEFAULT_AES_KEY: [u8; 16] = *b"cfcd208495d565ef";

// Process-wide key cells: written a handful of times during startup and key
// acquisition, read concurrently by every decode call.
static XOR_KEY: AtomicU8 = AtomicU8::new(0x37);
static AES_KEY: RwLock<[u8; 16]> = RwLock::new(DEFAULT_AES_KEY);

pub fn xor_key() -> u8 {
    XOR_KEY.load(Ordering::Relaxed)
}

pub fn set_xor_key(key: u8) {
    XOR_KEY.store(key, Ordering::Relaxed);
}

/// Publish the v4 AES key: either 16 raw characters or 32 hex characters.
pub fn set_aes_key(key: &str) -> Result<()> {
    let bytes: [u8; 16] = if key.len() == 16 {
        let mut k = [0u8; 16];
        k.copy_from_slice(key.as_bytes());
        k
    } else {
        let decoded = hex::decode(key)?;
        decoded
            .try_into()
            .map_err(|_| Error::Malformed("aes key must be 16 bytes".into()))?
    };
    *AES_KEY.write() = bytes;
    debug!("v4 image aes key updated");
    Ok(())
}

pub fn aes_key() -> [u8; 16] {
    *AES_KEY.read()
}

fn is_v4_container(data: &[u8]) -> bool {
    if data.len() >= 6 && (&data[..6] == V4_HEADER_1 || &data[..6] == V4_HEADER_2) {
        return true;
    }
    // Damaged trailing header bytes still identify the container by its
    // 4-byte prefix.
    data.len() >= 4 && (&data[..4] == &V4_HEADER_1[..4] || &data[..4] == &V4_HEADER_2[..4])
}

/// Convert a cache container to standard image bytes plus extension.
pub fn dat_to_image(data: &[u8]) -> Result<(Vec<u8>, &'static str)> {
    if data.len() < 4 {
        return Err(Error::Malformed(format!("dat too short: {}", data.len())));
    }

    if is_v4_container(data) {
        return decode_v4(data);
    }

    // v3: the whole buffer is XORed with one byte recovered from the first
    // signature byte; the rest of the signature must agree.
    for format in FORMATS {
        if data.len() < format.header.len() {
            continue;
        }
        let xor = data[0] ^ format.header[0];
        if format
            .header
            .iter()
            .enumerate()
            .all(|(i, &h)| data[i] ^ h == xor)
        {
            let out = data.iter().map(|&b| b ^ xor).collect();
            return Ok((out, format.ext));
        }
    }

    Err(Error::Malformed(format!(
        "unknown image type: {:02x} {:02x}",
        data[0], data[1]
    )))
}

fn decode_v4(data: &[u8]) -> Result<(Vec<u8>, &'static str)> {
    if data.len() < V4_HEADER_LEN {
        return Err(Error::Malformed("v4 container shorter than header".into()));
    }

    let aes_size = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
    let xor_size = u32::from_le_bytes([data[10], data[11], data[12], data[13]]) as usize;
    let body = &data[V4_HEADER_LEN..];

    // The encrypted prefix is PKCS7 padded, so an aligned length still gains
    // a full block.
    let aes_aligned = aes_size + (AES_BLOCK - aes_size % AES_BLOCK);
    if body.len() < aes_aligned {
        return Err(Error::Malformed("v4 body shorter than aes region".into()));
    }

    let (aes_part, remaining) = body.split_at(aes_aligned);
    if remaining.len() < xor_size {
        return Err(Error::Malformed("v4 body shorter than xor region".into()));
    }
    let (raw_middle, xor_tail) = remaining.split_at(remaining.len() - xor_size);

    let key = aes_key();
    let unpadded = decrypt_aes_ecb_strict(aes_part, &key)?;

    let xor = xor_key();
    let mut out = Vec::with_capacity(unpadded.len() + raw_middle.len() + xor_tail.len());
    out.extend_from_slice(&unpadded);
    out.extend_from_slice(raw_middle);
    out.extend(xor_tail.iter().map(|&b| b ^ xor));

    for format in FORMATS {
        if out.len() >= format.header.len() && &out[..format.header.len()] == format.header {
            return Ok((out, format.ext));
        }
    }

    if out.len() > 2 {
        warn!(head = ?&out[..out.len().min(8)], "v4 decode matched no image signature");
        return Err(Error::Malformed(format!(
            "unknown image type after decryption: {:02x} {:02x}",
            out[0], out[1]
        )));
    }
    Err(Error::Malformed("unknown image type".into()))
}

/// AES-128-ECB decrypt with strict PKCS7 unpadding.
fn decrypt_aes_ecb_strict(data: &[u8], key: &[u8; 16]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() % AES_BLOCK != 0 {
        return Err(Error::Malformed(format!(
            "aes region length {} is not block aligned",
            data.len()
        )));
    }

    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(AES_BLOCK) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    let pad = out[out.len() - 1] as usize;
    if pad == 0 || pad > AES_BLOCK || pad > out.len() {
        return Err(Error::Malformed(format!("invalid pkcs7 pad length: {pad}")));
    }
    if !out[out.len() - pad..].iter().all(|&b| b as usize == pad) {
        return Err(Error::Malformed("inconsistent pkcs7 padding".into()));
    }
    out.truncate(out.len() - pad);
    Ok(out)
}

/// Recompute the v4 XOR key from the first matching `*_t.dat` template under
/// `dir` (its XOR tail against the fixed JPEG trailer) and publish it.
pub fn scan_xor_key(dir: &Path) -> Result<u8> {
    for entry in WalkDir::new(dir).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with("_t.dat") {
            continue;
        }
        let Ok(data) = std::fs::read(entry.path()) else {
            continue;
        };
        if data.len() < V4_HEADER_LEN || !is_v4_container(&data) {
            continue;
        }

        let xor_size = u32::from_le_bytes([data[10], data[11], data[12], data[13]]) as usize;
        let body = &data[V4_HEADER_LEN..];
        if xor_size == 0 || xor_size > body.len() || xor_size < 2 {
            continue;
        }
        let tail = &body[body.len() - xor_size..];
        let last_two = &tail[tail.len() - 2..];
        let a = last_two[0] ^ JPEG_TAIL[0];
        let b = last_two[1] ^ JPEG_TAIL[1];
        if a == b {
            set_xor_key(a);
            debug!(key = format!("0x{a:02x}"), "v4 xor key published");
            return Ok(a);
        }
    }
    Err(Error::XorKeyMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;

    fn ecb_encrypt_padded(plain: &[u8], key: &[u8; 16]) -> Vec<u8> {
        let pad = AES_BLOCK - plain.len() % AES_BLOCK;
        let mut buf = plain.to_vec();
        buf.extend(std::iter::repeat(pad as u8).take(pad));
        let cipher = Aes128::new(GenericArray::from_slice(key));
        for block in buf.chunks_exact_mut(AES_BLOCK) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        buf
    }

    /// Assemble a v4 container: header, AES prefix, raw middle, XOR tail.
    fn encode_v4(plain: &[u8], aes_len: usize, xor_len: usize, key: &[u8; 16], xor: u8) -> Vec<u8> {
        assert!(aes_len + xor_len <= plain.len());
        let aes_part = ecb_encrypt_padded(&plain[..aes_len], key);
        let raw = &plain[aes_len..plain.len() - xor_len];
        let tail = &plain[plain.len() - xor_len..];

        let mut out = Vec::new();
        out.extend_from_slice(V4_HEADER_2);
        out.extend_from_slice(&(aes_len as u32).to_le_bytes());
        out.extend_from_slice(&(xor_len as u32).to_le_bytes());
        out.push(0x01);
        out.extend_from_slice(&aes_part);
        out.extend_from_slice(raw);
        out.extend(tail.iter().map(|&b| b ^ xor));
        out
    }

    #[test]
    fn v3_xor_recovers_jpeg() {
        let k = 0x42u8;
        let plain = [0xFFu8, 0xD8, 0xFF, 0xE0, 0x10, 0x20, 0x30];
        let enc: Vec<u8> = plain.iter().map(|&b| b ^ k).collect();

        let (out, ext) = dat_to_image(&enc).unwrap();
        assert_eq!(ext, "jpg");
        assert_eq!(out, plain);
    }

    #[test]
    fn v4_aes_only_container() {
        // Header + 3-byte AES region, no raw middle, no XOR tail.
        let key = DEFAULT_AES_KEY;
        let plain = [0xFFu8, 0xD8, 0xFF];
        let enc = encode_v4(&plain, 3, 0, &key, 0);

        set_aes_key("cfcd208495d565ef").unwrap();
        let (out, ext) = dat_to_image(&enc).unwrap();
        assert_eq!(ext, "jpg");
        assert_eq!(out, plain);
    }

    // Tests that write the process-wide XOR key serialize on this lock so
    // they cannot clobber each other mid-decode.
    static XOR_TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    #[test]
    fn v4_roundtrip_all_signatures() {
        let _guard = XOR_TEST_LOCK.lock();
        let key = DEFAULT_AES_KEY;
        set_aes_key("cfcd208495d565ef").unwrap();
        set_xor_key(0x5A);

        for format in [JPG, PNG, GIF, TIFF, BMP] {
            let mut plain = format.header.to_vec();
            plain.extend((0u8..64).map(|i| i.wrapping_mul(3)));
            plain.extend_from_slice(&JPEG_TAIL);

            let enc = encode_v4(&plain, format.header.len() + 4, 8, &key, 0x5A);
            let (out, ext) = dat_to_image(&enc).unwrap();
            assert_eq!(ext, format.ext, "format {}", format.ext);
            assert_eq!(out, plain, "format {}", format.ext);
        }
    }

    #[test]
    fn v4_aligned_aes_size_gains_full_pad_block() {
        let key = DEFAULT_AES_KEY;
        set_aes_key("cfcd208495d565ef").unwrap();

        // 16-byte AES region: the ciphertext must be 32 bytes.
        let mut plain = JPG.header.to_vec();
        plain.extend(std::iter::repeat(0xAB).take(13));
        assert_eq!(plain.len(), 16);
        let enc = encode_v4(&plain, 16, 0, &key, 0);
        assert_eq!(enc.len(), V4_HEADER_LEN + 32);

        let (out, ext) = dat_to_image(&enc).unwrap();
        assert_eq!(ext, "jpg");
        assert_eq!(out, plain);
    }

    #[test]
    fn v4_bad_padding_is_rejected() {
        let key = DEFAULT_AES_KEY;
        set_aes_key("cfcd208495d565ef").unwrap();

        let mut enc = encode_v4(&[0xFF, 0xD8, 0xFF], 3, 0, &key, 0);
        // Corrupt the ciphertext; padding verification must fail.
        let last = enc.len() - 1;
        enc[last] ^= 0xFF;
        assert!(dat_to_image(&enc).is_err());
    }

    #[test]
    fn wxgf_passes_through_for_external_transcoder() {
        let key = DEFAULT_AES_KEY;
        set_aes_key("cfcd208495d565ef").unwrap();

        let mut plain = WXGF.header.to_vec();
        plain.extend_from_slice(&[1, 2, 3, 4, 5]);
        let enc = encode_v4(&plain, 4, 0, &key, 0);
        let (out, ext) = dat_to_image(&enc).unwrap();
        assert_eq!(ext, "wxgf");
        assert_eq!(out, plain);
    }

    #[test]
    fn unknown_signature_is_an_error() {
        let data = [0x00u8, 0x11, 0x22, 0x33, 0x44];
        assert!(dat_to_image(&data).is_err());
    }

    #[test]
    fn scan_xor_key_reads_template_tail() {
        let _guard = XOR_TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let key = DEFAULT_AES_KEY;

        // Template whose XOR tail ends in the JPEG trailer, encrypted with
        // 0x37: trailing bytes become C8 EE.
        let mut plain = vec![0xFFu8, 0xD8, 0xFF];
        plain.extend(std::iter::repeat(0u8).take(16));
        plain.extend_from_slice(&JPEG_TAIL);
        let enc = encode_v4(&plain, 3, 4, &key, 0x37);
        std::fs::write(dir.path().join("cache_t.dat"), &enc).unwrap();

        let found = scan_xor_key(dir.path()).unwrap();
        assert_eq!(found, 0x37);
    }
}
