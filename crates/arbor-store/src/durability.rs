//! Platform-specific durable sync
//!
//! A successful `KvDB::set` promises the record survives power loss, so
//! every append goes through the strongest sync primitive the platform
//! offers. Plain `fsync` is not that primitive everywhere: macOS flushes
//! only to the drive's volatile cache unless F_FULLFSYNC is requested.

use std::fs::File;
use std::io;
use std::path::Path;

/// Flush a file's data to persistent storage before returning.
///
/// - Linux: `fdatasync()` — data without metadata, cheaper than fsync
/// - macOS/iOS: `fcntl(F_FULLFSYNC)` — past the drive write cache
/// - Windows: `FlushFileBuffers()`
/// - elsewhere: `File::sync_data()`
///
/// May block for milliseconds under heavy I/O; callers must not hold
/// locks the sync could deadlock against.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fdatasync on a descriptor obtained from an open File.
        if unsafe { libc::fdatasync(fd) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fcntl(F_FULLFSYNC) on a descriptor obtained from an
        // open File.
        if unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: FlushFileBuffers on a handle obtained from an open File.
        if unsafe { FlushFileBuffers(handle as *mut _) } != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    {
        file.sync_data()
    }
}

/// Sync a directory so a rename inside it is durable.
///
/// POSIX renames become durable only once the parent directory's entry is
/// flushed. On Windows directories cannot be opened for sync; the rename
/// itself is journaled, so this is a no-op there.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
