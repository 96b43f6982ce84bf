//! Windows process/memory/registry primitives over the `windows` crate.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::debug;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::Memory::{
    VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_IMAGE, MEM_MAPPED, MEM_PRIVATE,
    PAGE_GUARD, PAGE_NOACCESS,
};
use windows::Win32::System::ProcessStatus::{
    EnumProcesses, GetModuleBaseNameW, GetModuleFileNameExW,
};
use windows::Win32::System::Registry::{
    RegCloseKey, RegOpenKeyExW, RegQueryValueExW, HKEY, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE,
    KEY_QUERY_VALUE, REG_VALUE_TYPE,
};
use windows::Win32::System::Threading::{
    OpenProcess, TerminateProcess, PROCESS_QUERY_INFORMATION, PROCESS_TERMINATE, PROCESS_VM_READ,
};

use crate::error::{Error, Result};

use super::{MemoryRegion, ProcessInfo};

// 64-bit user address space upper bound.
const ADDRESS_CEILING: usize = 0x7FFF_FFFF_FFFF;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn utf16_to_string(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}

struct ProcessHandle(HANDLE);

impl ProcessHandle {
    fn open(pid: u32, access: windows::Win32::System::Threading::PROCESS_ACCESS_RIGHTS) -> Result<Self> {
        let handle = unsafe { OpenProcess(access, false, pid) }
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        Ok(Self(handle))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Enumerate all processes with name and executable path.
pub fn list_processes() -> Result<Vec<ProcessInfo>> {
    let mut pids = vec![0u32; 4096];
    let mut needed = 0u32;
    unsafe {
        EnumProcesses(
            pids.as_mut_ptr(),
            (pids.len() * std::mem::size_of::<u32>()) as u32,
            &mut needed,
        )
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    }
    let count = needed as usize / std::mem::size_of::<u32>();

    let mut out = Vec::new();
    for &pid in &pids[..count] {
        if pid == 0 {
            continue;
        }
        let Ok(handle) = ProcessHandle::open(pid, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ)
        else {
            continue;
        };
        let mut name_buf = [0u16; 260];
        let name_len = unsafe { GetModuleBaseNameW(handle.0, None, &mut name_buf) };
        if name_len == 0 {
            continue;
        }
        let mut path_buf = [0u16; 1024];
        let path_len = unsafe { GetModuleFileNameExW(handle.0, None, &mut path_buf) };
        out.push(ProcessInfo {
            pid,
            name: utf16_to_string(&name_buf[..name_len as usize]),
            exe_path: PathBuf::from(utf16_to_string(&path_buf[..path_len as usize])),
        });
    }
    Ok(out)
}

pub fn find_pids_by_name(name: &str) -> Result<Vec<u32>> {
    let mut pids: Vec<u32> = list_processes()?
        .into_iter()
        .filter(|p| p.name.eq_ignore_ascii_case(name))
        .map(|p| p.pid)
        .collect();
    pids.sort_unstable();
    Ok(pids)
}

pub fn is_process_running(name: &str) -> bool {
    find_pids_by_name(name).map(|p| !p.is_empty()).unwrap_or(false)
}

/// Terminate every process matching one of `names`. Failures to open or kill
/// individual pids are ignored; the caller re-checks liveness afterwards.
pub fn kill_processes(names: &[&str]) {
    for name in names {
        let Ok(pids) = find_pids_by_name(name) else {
            continue;
        };
        for pid in pids {
            if let Ok(handle) = ProcessHandle::open(pid, PROCESS_TERMINATE) {
                unsafe {
                    let _ = TerminateProcess(handle.0, 0);
                }
                debug!(pid, name, "terminated messenger process");
            }
        }
    }
}

pub fn launch_detached(path: &Path) -> Result<()> {
    let mut cmd = Command::new(path);
    if let Some(dir) = path.parent() {
        cmd.current_dir(dir);
    }
    cmd.spawn()?;
    Ok(())
}

/// Poll for a process with one of `names` to appear, checking every 500 ms.
pub fn wait_for_process(names: &[&str], timeout: Duration) -> Option<u32> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for name in names {
            if let Ok(pids) = find_pids_by_name(name) {
                if let Some(&pid) = pids.first() {
                    return Some(pid);
                }
            }
        }
        std::thread::sleep(Duration::from_millis(500));
    }
    None
}

const REGISTRY_KEYS: &[(bool, &str)] = &[
    (false, r"Software\Tencent\WeChat"),
    (false, r"Software\Tencent\Weixin"),
    (true, r"SOFTWARE\Tencent\WeChat"),
    (true, r"SOFTWARE\WOW6432Node\Tencent\WeChat"),
];

const REGISTRY_VALUES: &[&str] = &["InstallPath", "Install", "Path"];

fn registry_string(root: HKEY, subkey: &str, value: &str) -> Option<String> {
    let mut key = HKEY::default();
    let subkey_w = wide(subkey);
    let status = unsafe {
        RegOpenKeyExW(
            root,
            PCWSTR::from_raw(subkey_w.as_ptr()),
            0,
            KEY_QUERY_VALUE,
            &mut key,
        )
    };
    if status.is_err() {
        return None;
    }

    let value_w = wide(value);
    let mut len = 0u32;
    let mut kind = REG_VALUE_TYPE::default();
    let result = unsafe {
        RegQueryValueExW(
            key,
            PCWSTR::from_raw(value_w.as_ptr()),
            None,
            Some(&mut kind),
            None,
            Some(&mut len),
        )
    };
    let data = if result.is_ok() && len > 0 {
        let mut buf = vec![0u8; len as usize];
        let read = unsafe {
            RegQueryValueExW(
                key,
                PCWSTR::from_raw(value_w.as_ptr()),
                None,
                Some(&mut kind),
                Some(buf.as_mut_ptr()),
                Some(&mut len),
            )
        };
        if read.is_ok() {
            let words: Vec<u16> = buf
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            let s = utf16_to_string(&words);
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        } else {
            None
        }
    } else {
        None
    };

    unsafe {
        let _ = RegCloseKey(key);
    }
    data
}

/// Find the messenger executable through the registry, falling back to the
/// usual install locations on common drives.
pub fn messenger_install_path() -> Option<PathBuf> {
    for &(machine, subkey) in REGISTRY_KEYS {
        let root = if machine {
            HKEY_LOCAL_MACHINE
        } else {
            HKEY_CURRENT_USER
        };
        for value in REGISTRY_VALUES {
            let Some(raw) = registry_string(root, subkey, value) else {
                continue;
            };
            let path = PathBuf::from(&raw);
            if raw.to_ascii_lowercase().ends_with(".exe") && path.exists() {
                return Some(path);
            }
            for exe in crate::account::MESSENGER_EXES {
                let candidate = path.join(exe);
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }
    }

    for drive in ["C", "D", "E", "F"] {
        for tail in [
            r"\Program Files\Tencent\Weixin\Weixin.exe",
            r"\Program Files (x86)\Tencent\Weixin\Weixin.exe",
            r"\Program Files\Tencent\WeChat\WeChat.exe",
            r"\Program Files (x86)\Tencent\WeChat\WeChat.exe",
        ] {
            let candidate = PathBuf::from(format!("{drive}:{tail}"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Read access to another process's committed memory.
pub struct ProcessMemory {
    handle: ProcessHandle,
}

impl ProcessMemory {
    pub fn open(pid: u32) -> Result<Self> {
        let handle = ProcessHandle::open(pid, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ)
            .map_err(|_| Error::ProcessNotRunning(format!("pid {pid}")))?;
        Ok(Self { handle })
    }

    /// Walk the address space and collect committed, readable, non-guarded
    /// regions of type private/mapped/image.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        let mut regions = Vec::new();
        let mut address = 0usize;
        let mut mbi = MEMORY_BASIC_INFORMATION::default();

        loop {
            if address >= ADDRESS_CEILING {
                break;
            }
            let written = unsafe {
                VirtualQueryEx(
                    self.handle.0,
                    Some(address as *const _),
                    &mut mbi,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 {
                break;
            }

            let readable = mbi.Protect != PAGE_NOACCESS && (mbi.Protect & PAGE_GUARD).0 == 0;
            let candidate_type =
                mbi.Type == MEM_PRIVATE || mbi.Type == MEM_MAPPED || mbi.Type == MEM_IMAGE;
            if mbi.State == MEM_COMMIT && readable && candidate_type {
                regions.push(MemoryRegion {
                    base: mbi.BaseAddress as usize,
                    size: mbi.RegionSize,
                });
            }

            let next = address.saturating_add(mbi.RegionSize);
            if next <= address {
                break;
            }
            address = next;
        }
        regions
    }

    /// Read up to `size` bytes at `base`. Short reads return the bytes that
    /// were actually copied.
    pub fn read_chunk(&self, base: usize, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let mut read = 0usize;
        unsafe {
            ReadProcessMemory(
                self.handle.0,
                base as *const _,
                buf.as_mut_ptr() as *mut _,
                size,
                Some(&mut read),
            )
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        }
        buf.truncate(read);
        Ok(buf)
    }
}
