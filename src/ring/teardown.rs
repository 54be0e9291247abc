//! Process-wide signal teardown for live ring handles.
//!
//! Fatal signals must not strand ring buffers in `Writing` or
//! `Reading` state, or peer processes would wait on them until the
//! stale timeout. A fixed-size registry tracks every live handle;
//! when one of the covered signals fires, the handler detaches each
//! registered handle (returning its buffers to a safe state without
//! destroying the segment), then restores the previous disposition and
//! re-raises the signal to itself.
//!
//! The handler runs with only async-signal-safe operations: atomic
//! loads over the registry table, the allocation-free detach path, and
//! raw signal syscalls. The registry is a table of non-owning
//! pointers; the handle's `Drop` removes its entry before the pointee
//! is freed.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::ring::handle::RingState;
use crate::trace::warn;

const MAX_HANDLES: usize = 64;
const MAX_SIGNAL: usize = 64;

/// Signals that trigger teardown. `SIGQUIT` is deliberately absent; it
/// is commonly reserved for debugging core dumps.
const TEARDOWN_SIGNALS: [libc::c_int; 10] = [
    libc::SIGINT,
    libc::SIGILL,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGSEGV,
    libc::SIGPIPE,
    libc::SIGALRM,
    libc::SIGTERM,
    libc::SIGUSR2,
    libc::SIGHUP,
];

static HANDLES: [AtomicPtr<RingState>; MAX_HANDLES] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_HANDLES];

struct OldActions(UnsafeCell<[MaybeUninit<libc::sigaction>; MAX_SIGNAL]>);

// SAFETY: each entry is written once, under the install lock, before
// its bit in SAVED is published; afterwards it is only read.
unsafe impl Sync for OldActions {}

static OLD_ACTIONS: OldActions = OldActions(UnsafeCell::new([MaybeUninit::uninit(); MAX_SIGNAL]));

/// Bitmask of signal numbers whose previous action is stored.
static SAVED: AtomicU64 = AtomicU64::new(0);

static INSTALLED: Mutex<bool> = Mutex::new(false);

/// Adds a handle to the registry, installing the signal handlers on
/// first use.
pub(crate) fn register(state: &RingState) {
    install_handlers();
    let ptr = state as *const RingState as *mut RingState;
    for slot in &HANDLES {
        if slot
            .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
    warn!("signal-teardown registry is full; this handle will only detach via Drop");
}

/// Removes a handle from the registry. Must run before the handle's
/// state is freed.
pub(crate) fn deregister(state: &RingState) {
    let ptr = state as *const RingState as *mut RingState;
    for slot in &HANDLES {
        if slot
            .compare_exchange(ptr, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

fn save_old_action(signum: libc::c_int, action: libc::sigaction) {
    let idx = signum as usize;
    if idx >= MAX_SIGNAL {
        return;
    }
    // SAFETY: called only under the install lock, before the bit in
    // SAVED is published; no reader looks at the entry until then.
    unsafe {
        (*OLD_ACTIONS.0.get())[idx] = MaybeUninit::new(action);
    }
    SAVED.fetch_or(1 << idx, Ordering::Release);
}

fn saved_action(signum: libc::c_int) -> Option<libc::sigaction> {
    let idx = signum as usize;
    if idx >= MAX_SIGNAL || SAVED.load(Ordering::Acquire) & (1 << idx) == 0 {
        return None;
    }
    // SAFETY: the SAVED bit guards initialization of the entry.
    Some(unsafe { (*OLD_ACTIONS.0.get())[idx].assume_init() })
}

/// Installs the teardown handler for every covered signal, once per
/// process. Signals whose disposition is "ignore" are left alone.
fn install_handlers() {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if *installed {
        return;
    }
    *installed = true;

    for &signum in &TEARDOWN_SIGNALS {
        // SAFETY: sigaction with a null new action only queries.
        let mut old = unsafe { std::mem::zeroed::<libc::sigaction>() };
        if unsafe { libc::sigaction(signum, ptr::null(), &mut old) } != 0 {
            continue;
        }
        if old.sa_sigaction == libc::SIG_IGN {
            continue;
        }

        // SAFETY: zeroed sigaction is a valid starting point; the mask
        // calls initialize it fully before installation.
        let mut action = unsafe { std::mem::zeroed::<libc::sigaction>() };
        action.sa_sigaction =
            teardown_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            // Block the whole teardown set while the handler runs.
            for &blocked in &TEARDOWN_SIGNALS {
                libc::sigaddset(&mut action.sa_mask, blocked);
            }
            if libc::sigaction(signum, &action, ptr::null_mut()) == 0 {
                save_old_action(signum, old);
            }
        }
    }
}

extern "C" fn teardown_handler(signum: libc::c_int) {
    for slot in &HANDLES {
        let handle = slot.load(Ordering::Acquire);
        if !handle.is_null() {
            // SAFETY: a non-null entry points at a live RingState; the
            // owning handle deregisters before freeing it.
            unsafe { (*handle).detach(false) };
        }
    }

    // SAFETY: raw signal plumbing; all calls below are
    // async-signal-safe.
    unsafe {
        let mut set = std::mem::zeroed::<libc::sigset_t>();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signum);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());

        // Operator convention: a USR2 forced teardown resurfaces as an
        // interrupt.
        let resend = if signum == libc::SIGUSR2 {
            libc::SIGINT
        } else {
            signum
        };
        match saved_action(resend) {
            Some(old) => {
                libc::sigaction(resend, &old, ptr::null_mut());
            }
            None => {
                let mut default = std::mem::zeroed::<libc::sigaction>();
                default.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(resend, &default, ptr::null_mut());
            }
        }
        libc::raise(resend);
    }
}
