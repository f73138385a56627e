//! Dedicated verdict channel backed by an anonymous memory file
//!
//! The child inherits the memfd as [`VERDICT_FD`] and writes its record
//! there; the parent reads it back after the child exits. Nothing the
//! script prints on stdout can be mistaken for the verdict.
//!
//! The memfd counts against the child's `RLIMIT_FSIZE`, so the record keeps
//! the script's output out and the guard falls back to its stdout marker
//! when the write is refused.

use crate::guard::VERDICT_FD;
use crate::{Result, StockadeError};
use memfd::{Memfd, MemfdOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::{AsRawFd, RawFd};

#[derive(Debug)]
pub struct VerdictSink {
    memfd: Memfd,
}

impl VerdictSink {
    pub fn create(execution_id: &str) -> Result<Self> {
        let memfd = MemfdOptions::default()
            .close_on_exec(true)
            .create(format!("stockade-verdict-{execution_id}"))
            .map_err(|e| StockadeError::Channel(format!("failed to create memfd: {e}")))?;
        Ok(Self { memfd })
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.memfd.as_raw_fd()
    }

    /// Make the memfd visible to the child as [`VERDICT_FD`].
    ///
    /// Runs between fork and exec: no allocation, no logging.
    #[allow(unsafe_code)]
    pub fn install(raw: RawFd) -> std::io::Result<()> {
        // SAFETY: plain fd syscalls on descriptors owned by this process.
        unsafe {
            if raw == VERDICT_FD {
                let flags = libc::fcntl(raw, libc::F_GETFD);
                if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(raw, VERDICT_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Everything the child wrote, or `None` if it wrote nothing
    pub fn read_record(&self) -> Result<Option<String>> {
        let mut file = self.memfd.as_file();
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}
