//! Filesystem capacity queries.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// Capacity of the filesystem holding a path, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub total: u64,
    pub used: u64,
    /// Space available to unprivileged writers.
    pub free: u64,
}

pub trait SpaceProbe: Send + Sync {
    fn stats(&self, path: &Path) -> io::Result<FsStats>;
}

/// Reads capacity with `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Statvfs;

impl SpaceProbe for Statvfs {
    #[cfg(unix)]
    fn stats(&self, path: &Path) -> io::Result<FsStats> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        let r = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
        if r != 0 {
            return Err(io::Error::last_os_error());
        }
        let frsize = st.f_frsize as u64;
        let total = st.f_blocks as u64 * frsize;
        let free_all = st.f_bfree as u64 * frsize;
        Ok(FsStats {
            total,
            used: total.saturating_sub(free_all),
            free: st.f_bavail as u64 * frsize,
        })
    }

    #[cfg(not(unix))]
    fn stats(&self, _path: &Path) -> io::Result<FsStats> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "filesystem statistics need statvfs",
        ))
    }
}

/// Reports a constant capacity. Used to pin the storage budget (and in tests).
#[derive(Debug, Clone, Copy)]
pub struct FixedSpace(pub FsStats);

impl FixedSpace {
    pub fn with_free(free: u64) -> Self {
        FixedSpace(FsStats {
            total: free,
            used: 0,
            free,
        })
    }
}

impl SpaceProbe for FixedSpace {
    fn stats(&self, _path: &Path) -> io::Result<FsStats> {
        Ok(self.0)
    }
}
