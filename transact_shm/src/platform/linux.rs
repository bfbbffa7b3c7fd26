//! Linux-specific shared memory, futex and process operations

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::unistd::getpid;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::time::Duration;
use transact::consts::SHM_FILE_PREFIX;

/// Result of a single futex wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken up, or the word no longer held the expected value
    Woken,
    /// The timeout elapsed
    TimedOut,
    /// A signal handler ran while waiting
    Interrupted,
}

/// Resolve a session or arena name to a file path.
///
/// Names containing a `/` are used verbatim; bare names are placed in `dir`
/// as `transact_<name>.<kind>`.
pub fn shm_path(dir: &Path, name: &str, kind: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        dir.join(format!("{SHM_FILE_PREFIX}{name}.{kind}"))
    }
}

/// Create (or truncate to `size`) the backing file of a region and map it
pub fn create_region_mmap(path: &Path, size: usize) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)?;

    // Drop stale contents from an earlier run before sizing.
    file.set_len(0)?;
    file.set_len(size as u64)?;

    let mmap = unsafe { MmapOptions::new().len(size).populate().map_mut(&file)? };
    Ok(mmap)
}

/// Attach to an existing region, requiring at least `min_len` bytes
pub fn attach_region_mmap(path: &Path, min_len: usize) -> ShmResult<MmapMut> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ShmError::NotFound {
                name: path.display().to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata()?.len() as usize;
    if len < min_len {
        return Err(ShmError::InvalidSize { size: len });
    }

    let mmap = unsafe { MmapOptions::new().len(min_len).map_mut(&file)? };
    Ok(mmap)
}

/// Open or create a fixed-size session file and map it.
///
/// A freshly created file is zero-filled, which is the valid "empty" state of
/// a session block, so concurrent creators need no further coordination.
pub fn open_session_mmap(path: &Path, size: usize) -> ShmResult<(File, MmapMut)> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o600)
        .open(path)?;

    if (file.metadata()?.len() as usize) < size {
        file.set_len(size as u64)?;
    }

    let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
    Ok((file, mmap))
}

/// Whether `path` still names the inode behind `file`
pub fn is_same_file(file: &File, path: &Path) -> ShmResult<bool> {
    let ours = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(theirs) => Ok(ours.dev() == theirs.dev() && ours.ino() == theirs.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Block while `word` holds `expected`, for at most `timeout`.
///
/// Uses a shared (non-private) futex so waiters in other processes mapping
/// the same file are woken too.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == 0 {
        return WaitOutcome::Woken;
    }

    match Errno::last() {
        Errno::ETIMEDOUT => WaitOutcome::TimedOut,
        Errno::EINTR => WaitOutcome::Interrupted,
        // EAGAIN: the value changed before we slept.
        _ => WaitOutcome::Woken,
    }
}

/// Wake every waiter blocked on `word`
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Polling fallback for non-Linux systems
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    use std::sync::atomic::Ordering;

    let slice = timeout.map_or(Duration::from_millis(1), |t| t.min(Duration::from_millis(1)));
    std::thread::sleep(slice);
    if word.load(Ordering::Acquire) != expected {
        WaitOutcome::Woken
    } else if timeout.is_some_and(|t| t <= slice) {
        WaitOutcome::TimedOut
    } else {
        WaitOutcome::Woken
    }
}

/// No-op on non-Linux systems; waiters poll
#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32) {}

/// Check if process is alive using kill(pid, 0).
///
/// An exited child its parent has not reaped yet still answers the null
/// signal, so zombies are filtered out through `/proc/<pid>/stat`.
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // A null signal tests for existence without delivering anything.
    let exists = match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(Errno::ESRCH) => false, // No such process
        Err(Errno::EPERM) => true,  // Process exists but no permission to signal
        Err(_) => false,
    };
    exists && !is_zombie(pid)
}

/// Whether `pid` has exited and only waits to be reaped
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => matches!(process_state(&stat), Some('Z' | 'X')),
        // Reaped between the signal probe and the read.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        // Unreadable /proc (hidepid and the like): trust the signal probe.
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// State letter of a `/proc/<pid>/stat` line.
///
/// The command name may itself contain spaces and parentheses, so the state
/// is the first field after the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn process_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().next()?.chars().next()
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}
