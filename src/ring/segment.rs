//! Thin wrapper over the System V shared-memory syscalls.
//!
//! Everything `unsafe` about talking to the kernel lives here; callers
//! get plain `io::Result` values with the errno captured.

use std::io;
use std::mem::MaybeUninit;
use std::ptr;

/// `shm_perm.mode` bit the kernel sets once a segment is marked for
/// destruction (`IPC_RMID` with attachments still live). Defined here
/// because some libc targets do not export it.
const SHM_DEST: u32 = 0o1000;

const PERMISSIONS: libc::c_int = 0o666;

/// Looks up an existing segment by key. Does not create.
pub(crate) fn find(key: u32, size: usize) -> io::Result<i32> {
    // SAFETY: shmget has no memory-safety preconditions.
    let id = unsafe { libc::shmget(key as libc::key_t, size, PERMISSIONS) };
    if id == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(id)
    }
}

/// Creates (or opens, if it already exists) a segment of `size` bytes.
pub(crate) fn create(key: u32, size: usize) -> io::Result<i32> {
    // SAFETY: shmget has no memory-safety preconditions.
    let id = unsafe { libc::shmget(key as libc::key_t, size, libc::IPC_CREAT | PERMISSIONS) };
    if id == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(id)
    }
}

/// Maps the segment into this process. The mapping stays valid until
/// [`detach`].
pub(crate) fn attach(id: i32) -> io::Result<*mut u8> {
    // SAFETY: a null address lets the kernel pick the mapping location;
    // the returned pointer is only used while the segment stays mapped.
    let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
    if addr as isize == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(addr.cast())
    }
}

/// Unmaps a segment previously mapped with [`attach`].
pub(crate) fn detach(addr: *mut u8) -> io::Result<()> {
    // SAFETY: `addr` came from shmat and has not been detached yet;
    // the caller hands over the mapping and never dereferences it again.
    let sts = unsafe { libc::shmdt(addr.cast()) };
    if sts == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Marks the segment for destruction once the last process detaches.
pub(crate) fn mark_for_removal(id: i32) -> io::Result<()> {
    // SAFETY: IPC_RMID with a null buf is the documented removal call.
    let sts = unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
    if sts == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn stat(id: i32) -> io::Result<libc::shmid_ds> {
    let mut info = MaybeUninit::<libc::shmid_ds>::zeroed();
    // SAFETY: IPC_STAT writes a full shmid_ds into the provided buffer.
    let sts = unsafe { libc::shmctl(id, libc::IPC_STAT, info.as_mut_ptr()) };
    if sts == -1 {
        Err(io::Error::last_os_error())
    } else {
        // SAFETY: the kernel initialized the struct on success.
        Ok(unsafe { info.assume_init() })
    }
}

/// Number of processes currently attached to the segment.
pub(crate) fn attach_count(id: i32) -> io::Result<u64> {
    Ok(stat(id)?.shm_nattch as u64)
}

/// Whether the segment has been marked for destruction by any process.
pub(crate) fn marked_for_destruction(id: i32) -> io::Result<bool> {
    Ok(stat(id)?.shm_perm.mode as u32 & SHM_DEST != 0)
}
