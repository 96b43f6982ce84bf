//! Bindings to the auxiliary native hook module (`wx_key.dll`).
//!
//! The module exposes five ordinary C functions looked up by exported
//! symbol. [`KeyHook`] is the seam the polling protocol runs against, so
//! tests can drive it with a mock instead of a live DLL.

use std::path::Path;

use libloading::Library;

use crate::error::{Error, Result};

const KEY_BUF_LEN: usize = 65;
const STATUS_BUF_LEN: usize = 256;

type InitializeHookFn = unsafe extern "C" fn(pid: u32) -> i32;
type PollKeyDataFn = unsafe extern "C" fn(buf: *mut u8, len: usize) -> i32;
type GetStatusMessageFn = unsafe extern "C" fn(buf: *mut u8, len: usize, out_level: *mut i32) -> i32;
type CleanupHookFn = unsafe extern "C" fn() -> i32;
type GetLastErrorMsgFn = unsafe extern "C" fn() -> *const u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Ok,
    Warn,
}

impl StatusLevel {
    fn from_raw(level: i32) -> Self {
        match level {
            1 => StatusLevel::Ok,
            2 => StatusLevel::Warn,
            _ => StatusLevel::Info,
        }
    }

    /// Console prefix used when relaying module progress.
    pub fn prefix(self) -> &'static str {
        match self {
            StatusLevel::Info => "[*]",
            StatusLevel::Ok => "[+]",
            StatusLevel::Warn => "[!]",
        }
    }
}

/// The behavior the extraction protocol needs from the hook module.
pub trait KeyHook {
    /// Attach into the target process. Non-zero return maps to `true`.
    fn initialize(&mut self, pid: u32) -> bool;

    /// Non-blocking; `Some` once a key has been captured.
    fn poll_key(&mut self) -> Option<String>;

    /// Drain one queued progress message, if any.
    fn status_message(&mut self) -> Option<(String, StatusLevel)>;

    /// Detach and free resources in the target.
    fn cleanup(&mut self) -> bool;

    fn last_error(&mut self) -> String;
}

/// The real module, loaded at runtime and resolved by exported symbol.
pub struct HookLibrary {
    lib: Library,
    initialized: bool,
}

impl HookLibrary {
    /// Load the module and verify that every required export resolves.
    pub fn load(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| Error::Malformed(format!("cannot load hook module: {e}")))?;
        {
            // Fail fast on a module with missing exports.
            let check = |name: &[u8]| -> Result<()> {
                unsafe {
                    lib.get::<InitializeHookFn>(name)
                        .map(|_| ())
                        .map_err(|e| Error::Malformed(format!("missing export: {e}")))
                }
            };
            check(b"InitializeHook\0")?;
            check(b"PollKeyData\0")?;
            check(b"GetStatusMessage\0")?;
            check(b"CleanupHook\0")?;
            check(b"GetLastErrorMsg\0")?;
        }
        Ok(Self {
            lib,
            initialized: false,
        })
    }
}

fn c_str_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

impl KeyHook for HookLibrary {
    fn initialize(&mut self, pid: u32) -> bool {
        let ret = unsafe {
            match self.lib.get::<InitializeHookFn>(b"InitializeHook\0") {
                Ok(f) => f(pid),
                Err(_) => 0,
            }
        };
        self.initialized = ret != 0;
        self.initialized
    }

    fn poll_key(&mut self) -> Option<String> {
        let mut buf = [0u8; KEY_BUF_LEN];
        let ret = unsafe {
            match self.lib.get::<PollKeyDataFn>(b"PollKeyData\0") {
                Ok(f) => f(buf.as_mut_ptr(), buf.len()),
                Err(_) => 0,
            }
        };
        if ret == 0 {
            return None;
        }
        let key = c_str_to_string(&buf);
        (!key.is_empty()).then_some(key)
    }

    fn status_message(&mut self) -> Option<(String, StatusLevel)> {
        let mut buf = [0u8; STATUS_BUF_LEN];
        let mut level: i32 = 0;
        let ret = unsafe {
            match self.lib.get::<GetStatusMessageFn>(b"GetStatusMessage\0") {
                Ok(f) => f(buf.as_mut_ptr(), buf.len(), &mut level),
                Err(_) => 0,
            }
        };
        if ret == 0 {
            return None;
        }
        Some((c_str_to_string(&buf), StatusLevel::from_raw(level)))
    }

    fn cleanup(&mut self) -> bool {
        if !self.initialized {
            return true;
        }
        let ret = unsafe {
            match self.lib.get::<CleanupHookFn>(b"CleanupHook\0") {
                Ok(f) => f(),
                Err(_) => 0,
            }
        };
        self.initialized = false;
        ret != 0
    }

    fn last_error(&mut self) -> String {
        unsafe {
            let Ok(f) = self.lib.get::<GetLastErrorMsgFn>(b"GetLastErrorMsg\0") else {
                return String::new();
            };
            let ptr = f();
            if ptr.is_null() {
                return String::new();
            }
            // Static NUL-terminated string; walk at most 512 bytes.
            let mut out = Vec::new();
            for i in 0..512 {
                let b = *ptr.add(i);
                if b == 0 {
                    break;
                }
                out.push(b);
            }
            String::from_utf8_lossy(&out).into_owned()
        }
    }
}

impl Drop for HookLibrary {
    fn drop(&mut self) {
        self.cleanup();
    }
}
