//! Platform layer: file-backed mappings, futex wait/wake and process probes

pub mod linux;

pub use linux::{
    WaitOutcome, attach_region_mmap, create_region_mmap, futex_wait, futex_wake,
    get_current_pid, is_process_alive, is_same_file, open_session_mmap, shm_path,
};
