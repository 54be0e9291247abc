//! Ring handles: attach protocol, buffer acquisition, payload I/O,
//! completion, and teardown.
//!
//! # Handles and manager ids
//!
//! Each [`SharedRing`] is a process-local handle onto one segment,
//! identified by the manager id it was assigned at attach. The handle
//! that creates the segment takes id 0 (the Creator) and is the only
//! one allowed to initialize the header and to remove the segment on
//! teardown. Attachers spin on the ready marker, then take the next id
//! with an atomic increment.
//!
//! # Per-slot state machine
//!
//! ```text
//!              get_buffer_for_writing
//!   Empty ───────────────────────────▶ Writing
//!    ▲                                    │ mark_full
//!    │ mark_empty (destructive)           ▼
//!    │                                  Full ──────────────▶ Reading ─┐
//!    │                                    ▲  get_buffer_for_reading   │
//!    │                                    │                           │
//!    │ reclamation (broadcast)            │ reclamation (stale)       │
//!    └────────────────────────────────────┴───────────────────────────┘
//!                                                             mark_empty
//!                                                         (broadcast mode)
//! ```
//!
//! `get_buffer_for_writing(overwrite = true)` may additionally take
//! `Full` or `Reading` slots, pre-empting consumers; a pre-empted
//! reader's next advance observes the ownership change and yields.
//!
//! Claims are made with compare-and-swap on the `(owner, state)` pair
//! and re-verified afterwards; plain stores to a slot are legal only
//! for the unique owner after a successful claim. A handle-local
//! search mutex serializes this handle's scans, and one mutex per slot
//! serializes this handle's operations on that slot; coordination with
//! other processes relies on the CAS protocol alone.

use std::fmt;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI16, AtomicI32, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::clock::wall_clock_us;
use crate::ring::layout::{
    self, BufferMeta, BufferState, RingHeader, READY_MAGIC, UNOWNED,
};
use crate::ring::{segment, teardown};
use crate::trace::{debug, error, info, warn};

/// Bound on rescans after a lost claim race before giving up.
const CLAIM_ATTEMPTS: usize = 5;

/// Errors raised by ring operations.
///
/// Every variant except [`RingError::AttachFailed`] indicates a
/// programming or protocol violation; the handle tears itself down
/// (resetting owned buffers and unmapping) before the error is
/// returned. Operations on an already-invalid handle do not error at
/// all: they return neutral sentinels (`None`, `false`, `0`, empty).
#[derive(Debug, Error)]
pub enum RingError {
    /// Slot index exceeds the ring's buffer count.
    #[error("buffer {buffer} does not exist (ring has {count} buffers)")]
    ArgumentOutOfRange { buffer: usize, count: usize },
    /// The slot is not in the state the operation requires.
    #[error("buffer is in state {actual}, expected {expected}")]
    StateAccessViolation {
        expected: BufferState,
        actual: BufferState,
    },
    /// The slot is not owned by this handle.
    #[error("buffer is owned by {actual}, expected {expected}")]
    OwnerAccessViolation { expected: i16, actual: i16 },
    /// A write would run past the end of the payload.
    #[error(
        "write of {requested} bytes at position {position} exceeds the buffer size {buffer_size}"
    )]
    SharedMemoryWrite {
        position: usize,
        requested: usize,
        buffer_size: usize,
    },
    /// A read would run past the end of the payload.
    #[error(
        "read of {requested} bytes at position {position} exceeds the buffer size {buffer_size}"
    )]
    SharedMemoryRead {
        position: usize,
        requested: usize,
        buffer_size: usize,
    },
    /// Zero-length position advance or similar caller bug.
    #[error("{0}")]
    LogicError(&'static str),
    /// The OS refused segment creation or attachment.
    #[error("failed to attach shared memory key {key:#010x}: {source}")]
    AttachFailed { key: u32, source: io::Error },
}

/// Parameters for creating or attaching to a ring.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Segment key identifying the ring system-wide.
    pub key: u32,
    /// Number of slots. A handle constructed with 0 never creates the
    /// segment and adopts the parameters it finds.
    pub buffer_count: usize,
    /// Payload bytes per slot.
    pub buffer_size: usize,
    /// Staleness threshold for reclamation, in microseconds; 0
    /// disables reclamation entirely.
    pub stale_timeout_us: u64,
    /// Destructive (single-consumer) versus broadcast read mode.
    pub destructive_read: bool,
    /// How long attach may spin waiting for the segment to appear and
    /// for the Creator to publish the ready marker.
    pub attach_timeout: Duration,
}

impl RingConfig {
    /// Configuration with broadcast reads, a 100 second stale timeout,
    /// and a 1 second attach timeout.
    pub fn new(key: u32, buffer_count: usize, buffer_size: usize) -> Self {
        Self {
            key,
            buffer_count,
            buffer_size,
            stale_timeout_us: 100_000_000,
            destructive_read: false,
            attach_timeout: Duration::from_secs(1),
        }
    }
}

/// Attach-time state shared with the signal-teardown registry.
///
/// Boxed inside [`SharedRing`] so its address stays stable for the
/// registry while the public handle moves around.
pub(crate) struct RingState {
    key: u32,
    requested: RingConfig,
    shm_id: AtomicI32,
    base: AtomicPtr<u8>,
    manager_id: AtomicI16,
    last_seen_id: AtomicU64,
    search_lock: Mutex<()>,
    slot_locks: Box<[Mutex<()>]>,
}

impl RingState {
    fn attach(config: RingConfig) -> Self {
        let mut state = Self {
            key: config.key,
            shm_id: AtomicI32::new(-1),
            base: AtomicPtr::new(ptr::null_mut()),
            manager_id: AtomicI16::new(UNOWNED),
            last_seen_id: AtomicU64::new(0),
            search_lock: Mutex::new(()),
            slot_locks: Vec::new().into_boxed_slice(),
            requested: config,
        };
        match state.try_attach() {
            Ok(()) => {
                info!(
                    "attached to ring key {:#010x} as manager {} ({} buffers of {} bytes)",
                    state.key,
                    state.manager_id.load(Ordering::Relaxed),
                    state.buffer_count(),
                    state.buffer_size()
                );
            }
            Err(err) => {
                error!(
                    "attach to ring key {:#010x} failed: {err}; handle is invalid \
                     (check for stale segments with ipcs / ipcrm -m)",
                    state.key
                );
                state.detach(false);
            }
        }
        state
    }

    fn try_attach(&mut self) -> Result<(), RingError> {
        let cfg = self.requested.clone();
        let seg_size = layout::segment_size(cfg.buffer_count, cfg.buffer_size);
        let start = Instant::now();

        let shm_id = match segment::find(cfg.key, seg_size) {
            Ok(id) => id,
            Err(_) if cfg.buffer_count > 0 => {
                debug!(
                    "creating shared memory segment key {:#010x}, {seg_size} bytes",
                    cfg.key
                );
                let id = segment::create(cfg.key, seg_size)
                    .map_err(|source| RingError::AttachFailed { key: cfg.key, source })?;
                self.manager_id.store(0, Ordering::Relaxed);
                id
            }
            Err(first) => {
                // Attach-only handle: the segment may not exist yet.
                // Retry the lookup until the Creator brings it up.
                let mut last = first;
                loop {
                    match segment::find(cfg.key, seg_size) {
                        Ok(id) => break id,
                        Err(err) => {
                            last = err;
                            if start.elapsed() >= cfg.attach_timeout {
                                return Err(RingError::AttachFailed {
                                    key: cfg.key,
                                    source: last,
                                });
                            }
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }
                }
            }
        };
        self.shm_id.store(shm_id, Ordering::Relaxed);

        let base = segment::attach(shm_id).map_err(|source| {
            self.shm_id.store(-1, Ordering::Relaxed);
            RingError::AttachFailed { key: cfg.key, source }
        })?;
        self.base.store(base, Ordering::Release);

        if self.manager_id.load(Ordering::Relaxed) == 0 {
            // SAFETY: the mapping is at least header-sized (seg_size
            // always includes the header); the borrow of the marker
            // ends before the raw-pointer initialization below.
            let magic = unsafe { (*(base as *const RingHeader)).ready_magic.load(Ordering::Acquire) };
            if magic == READY_MAGIC {
                warn!(
                    "creator found an already-initialized segment at key {:#010x}; \
                     reinitializing (a stale ring was left behind, clean up with ipcrm)",
                    cfg.key
                );
            }
            // SAFETY: sole initializer; attachers do not read past the
            // ready marker until it is published last.
            unsafe { init_segment(base, &cfg) };
        } else {
            // SAFETY: the mapping is at least header-sized and outlives
            // this borrow; the Creator only writes before publishing
            // the marker we wait on.
            let header = unsafe { &*(base as *const RingHeader) };
            while header.ready_magic.load(Ordering::Acquire) != READY_MAGIC {
                if start.elapsed() >= cfg.attach_timeout {
                    return Err(RingError::AttachFailed {
                        key: cfg.key,
                        source: io::Error::new(
                            io::ErrorKind::TimedOut,
                            "ready marker was not published in time",
                        ),
                    });
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            if cfg.buffer_count > 0
                && (header.buffer_count as usize != cfg.buffer_count
                    || header.buffer_size as usize != cfg.buffer_size)
            {
                return Err(RingError::AttachFailed {
                    key: cfg.key,
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "segment layout parameters differ from the requested ones",
                    ),
                });
            }
            let id = header.next_id.fetch_add(1, Ordering::AcqRel);
            self.manager_id.store(id as i16, Ordering::Relaxed);
        }

        self.slot_locks = (0..self.buffer_count()).map(|_| Mutex::new(())).collect();
        Ok(())
    }

    pub(crate) fn is_valid(&self) -> bool {
        !self.base.load(Ordering::Acquire).is_null()
    }

    fn my_id(&self) -> i16 {
        self.manager_id.load(Ordering::Relaxed)
    }

    fn header(&self) -> Option<&RingHeader> {
        let base = self.base.load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // SAFETY: a non-null base points at a mapping that starts with
        // an initialized RingHeader and stays mapped until detach.
        Some(unsafe { &*(base as *const RingHeader) })
    }

    fn buffer_count(&self) -> usize {
        self.header().map_or(0, |h| h.buffer_count as usize)
    }

    fn buffer_size(&self) -> usize {
        self.header().map_or(0, |h| h.buffer_size as usize)
    }

    fn destructive(&self) -> bool {
        self.header().is_some_and(|h| h.destructive_read_mode != 0)
    }

    fn timeout_us(&self) -> u64 {
        self.header().map_or(0, |h| h.buffer_timeout_us)
    }

    fn meta(&self, buffer: usize) -> Option<&BufferMeta> {
        let base = self.base.load(Ordering::Acquire);
        if base.is_null() || buffer >= self.buffer_count() {
            return None;
        }
        // SAFETY: the index is in range, so the metadata slot lies
        // inside the mapping; it was initialized by the Creator before
        // the ready marker was published.
        Some(unsafe { &*(base.add(layout::meta_offset(buffer)) as *const BufferMeta) })
    }

    fn payload_ptr(&self, buffer: usize) -> Option<*mut u8> {
        let base = self.base.load(Ordering::Acquire);
        let count = self.buffer_count();
        if base.is_null() || buffer >= count {
            return None;
        }
        // SAFETY: in-range payload offsets lie inside the mapping.
        Some(unsafe { base.add(layout::payload_offset(count, self.buffer_size(), buffer)) })
    }

    fn lock_search(&self) -> MutexGuard<'_, ()> {
        self.search_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slot(&self, buffer: usize) -> MutexGuard<'_, ()> {
        self.slot_locks[buffer]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Refreshes the slot's last-touch timestamp, but only if this
    /// handle owns it.
    fn touch(&self, meta: &BufferMeta) {
        if meta.owner_id.load(Ordering::Acquire) != self.my_id() {
            return;
        }
        meta.last_touch_us.store(wall_clock_us(), Ordering::Release);
    }

    /// Resets every buffer this handle owns to a safe neutral state,
    /// unmaps the segment, and removes it if this handle is the
    /// Creator or `force` is set.
    ///
    /// Also runs from the signal-teardown handler, so this must not
    /// allocate or take locks.
    pub(crate) fn detach(&self, force: bool) {
        let me = self.my_id();
        if self.is_valid() {
            for buffer in 0..self.buffer_count() {
                let Some(meta) = self.meta(buffer) else { continue };
                if meta.owner_id.load(Ordering::Acquire) != me {
                    continue;
                }
                match meta.state() {
                    BufferState::Writing => {
                        let _ = meta.state.compare_exchange(
                            BufferState::Writing as u16,
                            BufferState::Empty as u16,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                    BufferState::Reading => {
                        let _ = meta.state.compare_exchange(
                            BufferState::Reading as u16,
                            BufferState::Full as u16,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                    _ => {}
                }
                let _ = meta.owner_id.compare_exchange(
                    me,
                    UNOWNED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }

        let base = self.base.swap(ptr::null_mut(), Ordering::AcqRel);
        if !base.is_null() {
            let _ = segment::detach(base);
        }

        let id = self.shm_id.load(Ordering::Relaxed);
        if (force || me == 0) && id != -1 {
            let _ = segment::mark_for_removal(id);
            self.shm_id.store(-1, Ordering::Relaxed);
        }
    }
}

/// Initializes the header and every metadata slot, publishing the
/// ready marker last.
///
/// # Safety
///
/// `base` must point at a writable mapping of at least
/// [`layout::segment_size`] bytes for `cfg`'s parameters, and no other
/// handle in this process may be using the mapping concurrently.
/// Remote processes are held off by the ready marker: it is stored
/// with release ordering only after every other field is written.
unsafe fn init_segment(base: *mut u8, cfg: &RingConfig) {
    let header = base as *mut RingHeader;
    ptr::addr_of_mut!((*header).ready_magic).write(AtomicU32::new(0));
    ptr::addr_of_mut!((*header).next_id).write(AtomicU64::new(1));
    ptr::addr_of_mut!((*header).next_sequence_id).write(AtomicU64::new(0));
    ptr::addr_of_mut!((*header).reader_pos).write(AtomicU32::new(0));
    ptr::addr_of_mut!((*header).writer_pos).write(AtomicU32::new(0));
    ptr::addr_of_mut!((*header).lowest_seq_id_read).write(AtomicU64::new(0));
    ptr::addr_of_mut!((*header).buffer_count).write(cfg.buffer_count as u32);
    ptr::addr_of_mut!((*header).buffer_size).write(cfg.buffer_size as u64);
    ptr::addr_of_mut!((*header).buffer_timeout_us).write(cfg.stale_timeout_us);
    ptr::addr_of_mut!((*header).destructive_read_mode).write(u8::from(cfg.destructive_read));
    ptr::addr_of_mut!((*header).rank).write(AtomicU16::new(0));

    let now = wall_clock_us();
    for index in 0..cfg.buffer_count {
        let meta = base.add(layout::meta_offset(index)) as *mut BufferMeta;
        ptr::addr_of_mut!((*meta).sequence_id).write(AtomicU64::new(0));
        ptr::addr_of_mut!((*meta).write_pos).write(AtomicU64::new(0));
        ptr::addr_of_mut!((*meta).read_pos).write(AtomicU64::new(0));
        ptr::addr_of_mut!((*meta).state).write(AtomicU16::new(BufferState::Empty as u16));
        ptr::addr_of_mut!((*meta).owner_id).write(AtomicI16::new(UNOWNED));
        ptr::addr_of_mut!((*meta).last_touch_us).write(AtomicU64::new(now));
    }

    (*header).ready_magic.store(READY_MAGIC, Ordering::Release);
}

/// Handle onto a cross-process ring of fixed-size buffers.
///
/// Constructing the handle attaches (or creates) the segment; see
/// [`RingConfig`]. A failed attach is reported through the log and
/// leaves the handle invalid rather than failing construction; every
/// operation on an invalid handle returns a neutral sentinel. Dropping
/// the handle detaches, returning owned buffers to a safe state, and
/// removes the segment if this handle is the Creator.
pub struct SharedRing {
    state: Box<RingState>,
}

impl SharedRing {
    /// Creates or attaches to the ring identified by `config.key`.
    pub fn new(config: RingConfig) -> Self {
        let state = Box::new(RingState::attach(config));
        teardown::register(&state);
        Self { state }
    }

    /// Whether the handle is attached to a live segment.
    pub fn is_valid(&self) -> bool {
        self.state.is_valid()
    }

    /// The ring's segment key.
    pub fn key(&self) -> u32 {
        self.state.key
    }

    /// This handle's manager id (0 for the Creator, -1 if attach
    /// failed).
    pub fn my_id(&self) -> i16 {
        self.state.my_id()
    }

    /// Whether this handle created and owns the segment.
    pub fn is_creator(&self) -> bool {
        self.state.my_id() == 0
    }

    /// Number of slots in the ring.
    pub fn buffer_count(&self) -> usize {
        self.state.buffer_count()
    }

    /// Payload bytes per slot.
    pub fn buffer_size(&self) -> usize {
        self.state.buffer_size()
    }

    /// Whether buffers are consumed destructively by a single reader.
    pub fn destructive_read_mode(&self) -> bool {
        self.state.destructive()
    }

    /// The rank tag stored in the header.
    pub fn rank(&self) -> u16 {
        self.state.header().map_or(0, |h| h.rank.load(Ordering::Acquire))
    }

    /// Stores a rank tag in the header.
    pub fn set_rank(&self, rank: u16) {
        if let Some(header) = self.state.header() {
            header.rank.store(rank, Ordering::Release);
        }
    }

    /// Highest sequence id this handle has written or read.
    pub fn last_seen_id(&self) -> u64 {
        self.state.last_seen_id.load(Ordering::Acquire)
    }

    /// Smallest sequence id consumed by destructive readers so far.
    pub fn lowest_seq_id_read(&self) -> u64 {
        self.state
            .header()
            .map_or(0, |h| h.lowest_seq_id_read.load(Ordering::Acquire))
    }

    fn fail(&self, err: RingError) -> RingError {
        error!(
            "fatal error on ring key {:#010x}: {err}; tearing down handle",
            self.state.key
        );
        self.state.detach(false);
        err
    }

    fn meta_checked(&self, buffer: usize) -> Result<&BufferMeta, RingError> {
        let count = self.state.buffer_count();
        if buffer >= count {
            return Err(self.fail(RingError::ArgumentOutOfRange { buffer, count }));
        }
        // The handle can only have been torn down between the count
        // check and here by a concurrent fatal error; treat that as
        // out of range too.
        self.state
            .meta(buffer)
            .ok_or(RingError::ArgumentOutOfRange { buffer, count })
    }

    /// Strict precondition check: tears the handle down on violation.
    fn require_owned(&self, meta: &BufferMeta, expected: BufferState) -> Result<(), RingError> {
        let actual = meta.state();
        if actual != expected {
            return Err(self.fail(RingError::StateAccessViolation { expected, actual }));
        }
        let owner = meta.owner_id.load(Ordering::Acquire);
        let me = self.state.my_id();
        if owner != me {
            return Err(self.fail(RingError::OwnerAccessViolation {
                expected: me,
                actual: owner,
            }));
        }
        Ok(())
    }

    /// Non-strict probe of the state/owner predicate: the slot is in
    /// `expected` state and either owned by this handle or unowned
    /// (unowned only counts for the unowned-legal states).
    fn owns_in_state(&self, meta: &BufferMeta, expected: BufferState) -> bool {
        let owner = meta.owner_id.load(Ordering::Acquire);
        let owner_ok = owner == self.state.my_id()
            || (owner == UNOWNED
                && matches!(expected, BufferState::Full | BufferState::Empty));
        owner_ok && meta.state() == expected
    }

    /// Opportunistic stale-slot handling, run on every scan step.
    ///
    /// Returns `true` if the slot was stale (whether or not a
    /// transition was applied).
    fn reclaim_if_stale(&self, buffer: usize) -> bool {
        let Some(meta) = self.state.meta(buffer) else {
            return false;
        };
        let _slot = self.state.lock_slot(buffer);
        let timeout = self.state.timeout_us();
        let now = wall_clock_us();
        let touched = meta.last_touch_us.load(Ordering::Acquire);
        if now < touched {
            // A peer's clock ran ahead of ours; repair the timestamp
            // forward and leave the slot alone.
            meta.last_touch_us.store(now, Ordering::Release);
            return false;
        }
        let state = meta.state();
        if timeout == 0 || now - touched <= timeout || state == BufferState::Empty {
            return false;
        }

        let me = self.state.my_id();
        let owner = meta.owner_id.load(Ordering::Acquire);

        if owner == me && state == BufferState::Writing {
            // Our own write outlived the timeout. Report it; the slot
            // stays usable by us.
            warn!("own write buffer {buffer} is stale (still usable)");
            return true;
        }

        if !self.state.destructive() && state == BufferState::Full {
            let seq = meta.sequence_id.load(Ordering::Acquire);
            if seq < self.state.last_seen_id.load(Ordering::Acquire) || me == 0 {
                // Broadcast buffers nobody will consume anymore. The
                // Creator applies this to any stale Full buffer, which
                // can drop data still unread by a slow consumer.
                if meta
                    .owner_id
                    .compare_exchange(owner, UNOWNED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    meta.write_pos.store(0, Ordering::Release);
                    if meta
                        .state
                        .compare_exchange(
                            BufferState::Full as u16,
                            BufferState::Empty as u16,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        debug!("reset stale broadcast buffer {buffer} (sequence {seq})");
                        if let Some(header) = self.state.header() {
                            let count = self.state.buffer_count();
                            if header.reader_pos.load(Ordering::Acquire) as usize == buffer {
                                header
                                    .reader_pos
                                    .store(((buffer + 1) % count) as u32, Ordering::Release);
                            }
                        }
                        return true;
                    }
                }
                return false;
            }
        }

        if owner != me && state == BufferState::Reading {
            // Re-check the clock so a reader that touched between our
            // first load and now is not clobbered.
            if wall_clock_us().saturating_sub(meta.last_touch_us.load(Ordering::Acquire)) > timeout
                && meta
                    .owner_id
                    .compare_exchange(owner, UNOWNED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                meta.read_pos.store(0, Ordering::Release);
                let _ = meta.state.compare_exchange(
                    BufferState::Reading as u16,
                    BufferState::Full as u16,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                warn!("reclaimed buffer {buffer} from stale reader {owner}");
                return true;
            }
        }
        false
    }

    /// Claims a buffer for reading.
    ///
    /// Scans every slot starting at the reader hint, preferring the
    /// smallest eligible sequence id, and claims it with CAS. Returns
    /// `None` when no buffer is ready or the claim race was lost
    /// repeatedly. In destructive mode the claim advances the shared
    /// consumption watermark and the reader hint.
    pub fn get_buffer_for_reading(&self) -> Option<usize> {
        if !self.state.is_valid() {
            return None;
        }
        let _search = self.state.lock_search();
        let header = self.state.header()?;
        let count = self.state.buffer_count();
        if count == 0 {
            return None;
        }
        let destructive = self.state.destructive();
        let me = self.state.my_id();
        let rp = header.reader_pos.load(Ordering::Acquire) as usize;

        for _attempt in 0..CLAIM_ATTEMPTS {
            let last_seen = self.state.last_seen_id.load(Ordering::Acquire);
            let mut best: Option<(usize, u64, i16)> = None;
            for step in 0..count {
                let buffer = (rp + step) % count;
                self.reclaim_if_stale(buffer);
                let Some(meta) = self.state.meta(buffer) else {
                    continue;
                };
                if meta.state() != BufferState::Full {
                    continue;
                }
                let owner = meta.owner_id.load(Ordering::Acquire);
                if owner != UNOWNED && owner != me {
                    continue;
                }
                let seq = meta.sequence_id.load(Ordering::Acquire);
                if !destructive && seq <= last_seen {
                    continue;
                }
                if best.map_or(true, |(_, best_seq, _)| seq < best_seq) {
                    best = Some((buffer, seq, owner));
                    if destructive || seq == last_seen + 1 {
                        break;
                    }
                }
            }

            let Some((buffer, seq, observed_owner)) = best else {
                // Nothing eligible at all; no point rescanning.
                return None;
            };
            let Some(meta) = self.state.meta(buffer) else {
                return None;
            };
            if meta
                .owner_id
                .compare_exchange(observed_owner, me, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if meta
                .state
                .compare_exchange(
                    BufferState::Full as u16,
                    BufferState::Reading as u16,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                let _ = meta.owner_id.compare_exchange(
                    me,
                    observed_owner,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            self.state.touch(meta);
            if meta.owner_id.load(Ordering::Acquire) != me || meta.state() != BufferState::Reading
            {
                continue;
            }

            meta.read_pos.store(0, Ordering::Release);
            if destructive {
                // Advance the shared watermark only forward; a
                // requeued older buffer must not roll it back.
                if seq > last_seen {
                    let _ = header.lowest_seq_id_read.compare_exchange(
                        last_seen,
                        seq,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                header
                    .reader_pos
                    .store(((buffer + 1) % count) as u32, Ordering::Release);
            }
            self.state.last_seen_id.store(seq, Ordering::Release);
            debug!("claimed buffer {buffer} for reading (sequence {seq})");
            return Some(buffer);
        }
        None
    }

    /// Claims a buffer for writing, stamping a fresh sequence id.
    ///
    /// Prefers `Empty` slots. With `overwrite`, falls back to `Full`
    /// slots (discarding their data) and finally to `Reading` slots,
    /// pre-empting the reader. Returns `None` if nothing is claimable.
    pub fn get_buffer_for_writing(&self, overwrite: bool) -> Option<usize> {
        if !self.state.is_valid() {
            return None;
        }
        let _search = self.state.lock_search();
        let header = self.state.header()?;
        let count = self.state.buffer_count();
        if count == 0 {
            return None;
        }
        let wp = header.writer_pos.load(Ordering::Acquire) as usize;

        for pass in [BufferState::Empty, BufferState::Full, BufferState::Reading] {
            if pass != BufferState::Empty && !overwrite {
                break;
            }
            for step in 0..count {
                let buffer = (wp + step) % count;
                self.reclaim_if_stale(buffer);
                let Some(meta) = self.state.meta(buffer) else {
                    continue;
                };
                if meta.state() != pass {
                    continue;
                }
                let observed_owner = meta.owner_id.load(Ordering::Acquire);
                if pass == BufferState::Empty && observed_owner != UNOWNED {
                    continue;
                }
                if self.try_claim_for_writing(header, meta, buffer, pass, observed_owner) {
                    return Some(buffer);
                }
            }
        }
        None
    }

    fn try_claim_for_writing(
        &self,
        header: &RingHeader,
        meta: &BufferMeta,
        buffer: usize,
        from: BufferState,
        observed_owner: i16,
    ) -> bool {
        let me = self.state.my_id();
        if meta
            .owner_id
            .compare_exchange(observed_owner, me, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if meta
            .state
            .compare_exchange(
                from as u16,
                BufferState::Writing as u16,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            let _ = meta.owner_id.compare_exchange(
                me,
                observed_owner,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return false;
        }
        let count = self.state.buffer_count();
        header
            .writer_pos
            .store(((buffer + 1) % count) as u32, Ordering::Release);
        let seq = header.next_sequence_id.fetch_add(1, Ordering::AcqRel) + 1;
        meta.sequence_id.store(seq, Ordering::Release);
        meta.write_pos.store(0, Ordering::Release);
        self.state.touch(meta);
        debug!(
            "claimed buffer {buffer} for writing (sequence {seq}, from {})",
            from.name()
        );
        true
    }

    /// Whether any buffer is currently eligible for this handle to
    /// read. Does not claim.
    pub fn ready_for_read(&self) -> bool {
        self.scan_read_ready(true) > 0
    }

    /// Number of buffers currently eligible for this handle to read.
    pub fn read_ready_count(&self) -> usize {
        self.scan_read_ready(false)
    }

    fn scan_read_ready(&self, stop_at_first: bool) -> usize {
        if !self.state.is_valid() {
            return 0;
        }
        let _search = self.state.lock_search();
        let count = self.state.buffer_count();
        let destructive = self.state.destructive();
        let me = self.state.my_id();
        let last_seen = self.state.last_seen_id.load(Ordering::Acquire);
        let mut ready = 0;
        for buffer in 0..count {
            self.reclaim_if_stale(buffer);
            let Some(meta) = self.state.meta(buffer) else {
                continue;
            };
            if meta.state() != BufferState::Full {
                continue;
            }
            let owner = meta.owner_id.load(Ordering::Acquire);
            if owner != UNOWNED && owner != me {
                continue;
            }
            if !destructive && meta.sequence_id.load(Ordering::Acquire) <= last_seen {
                continue;
            }
            ready += 1;
            if stop_at_first {
                break;
            }
        }
        ready
    }

    /// Whether any buffer could be claimed for writing. Does not claim.
    pub fn ready_for_write(&self, overwrite: bool) -> bool {
        self.scan_write_ready(overwrite, true) > 0
    }

    /// Number of buffers claimable for writing.
    pub fn write_ready_count(&self, overwrite: bool) -> usize {
        self.scan_write_ready(overwrite, false)
    }

    fn scan_write_ready(&self, overwrite: bool, stop_at_first: bool) -> usize {
        if !self.state.is_valid() {
            return 0;
        }
        let _search = self.state.lock_search();
        let count = self.state.buffer_count();
        let mut ready = 0;
        for buffer in 0..count {
            self.reclaim_if_stale(buffer);
            let Some(meta) = self.state.meta(buffer) else {
                continue;
            };
            let state = meta.state();
            let unowned_empty =
                state == BufferState::Empty && meta.owner_id.load(Ordering::Acquire) == UNOWNED;
            if unowned_empty || (overwrite && state != BufferState::Writing) {
                ready += 1;
                if stop_at_first {
                    break;
                }
            }
        }
        ready
    }

    /// Slot indices currently owned by this handle.
    pub fn buffers_owned_by_self(&self) -> Vec<usize> {
        if !self.state.is_valid() {
            return Vec::new();
        }
        let _search = self.state.lock_search();
        let me = self.state.my_id();
        (0..self.state.buffer_count())
            .filter(|&buffer| {
                self.state
                    .meta(buffer)
                    .is_some_and(|m| m.owner_id.load(Ordering::Acquire) == me)
            })
            .collect()
    }

    /// Bytes written to the buffer so far.
    pub fn data_size(&self, buffer: usize) -> Result<usize, RingError> {
        if !self.state.is_valid() {
            return Ok(0);
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        self.state.touch(meta);
        Ok(meta.write_pos.load(Ordering::Acquire) as usize)
    }

    /// Rewinds the read position to the start of the buffer. Yields
    /// `Ok(false)` without side effects if this handle is not the
    /// owner.
    pub fn reset_read_pos(&self, buffer: usize) -> Result<bool, RingError> {
        if !self.state.is_valid() {
            return Ok(false);
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        if meta.owner_id.load(Ordering::Acquire) != self.state.my_id() {
            return Ok(false);
        }
        self.state.touch(meta);
        meta.read_pos.store(0, Ordering::Release);
        Ok(true)
    }

    /// Rewinds the write position to the start of the buffer. Requires
    /// ownership and `Writing` state; violations tear down the handle.
    pub fn reset_write_pos(&self, buffer: usize) -> Result<(), RingError> {
        if !self.state.is_valid() {
            return Ok(());
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        self.require_owned(meta, BufferState::Writing)?;
        self.state.touch(meta);
        meta.write_pos.store(0, Ordering::Release);
        Ok(())
    }

    /// Advances the read position by `n` bytes.
    ///
    /// Advancing by zero is a hard error. A handle that lost ownership
    /// (for example to an overwriting writer) yields `Ok(false)`
    /// without side effects.
    pub fn advance_read_pos(&self, buffer: usize, n: usize) -> Result<bool, RingError> {
        if !self.state.is_valid() {
            return Ok(false);
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        if n == 0 {
            return Err(self.fail(RingError::LogicError(
                "cannot advance the read position by zero bytes",
            )));
        }
        if meta.owner_id.load(Ordering::Acquire) != self.state.my_id() {
            return Ok(false);
        }
        let pos = meta.read_pos.load(Ordering::Acquire) as usize;
        if pos + n > self.state.buffer_size() {
            warn!("refused read advance past end of buffer {buffer} ({pos} + {n})");
            return Ok(false);
        }
        self.state.touch(meta);
        meta.read_pos.store((pos + n) as u64, Ordering::Release);
        Ok(true)
    }

    /// Advances the write position by `n` bytes.
    ///
    /// Advancing by zero is a hard error. Returns `Ok(false)` if the
    /// advance would run past the buffer size or the handle lost
    /// ownership.
    pub fn advance_write_pos(&self, buffer: usize, n: usize) -> Result<bool, RingError> {
        if !self.state.is_valid() {
            return Ok(false);
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        if n == 0 {
            return Err(self.fail(RingError::LogicError(
                "cannot advance the write position by zero bytes",
            )));
        }
        if meta.owner_id.load(Ordering::Acquire) != self.state.my_id() {
            return Ok(false);
        }
        let pos = meta.write_pos.load(Ordering::Acquire) as usize;
        if pos + n > self.state.buffer_size() {
            warn!("refused write advance past end of buffer {buffer} ({pos} + {n})");
            return Ok(false);
        }
        self.state.touch(meta);
        meta.write_pos.store((pos + n) as u64, Ordering::Release);
        Ok(true)
    }

    /// Whether unread bytes remain in the buffer.
    pub fn more_data(&self, buffer: usize) -> Result<bool, RingError> {
        if !self.state.is_valid() {
            return Ok(false);
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        Ok(meta.read_pos.load(Ordering::Acquire) < meta.write_pos.load(Ordering::Acquire))
    }

    /// Copies `data` into the buffer at the write position and
    /// advances it.
    ///
    /// Requires ownership and `Writing` state. Writing past the end of
    /// the payload is fatal: the handle tears down and the error is
    /// returned. On success the handle's watermark is raised to the
    /// buffer's sequence id and the byte count is returned.
    pub fn write(&self, buffer: usize, data: &[u8]) -> Result<usize, RingError> {
        if !self.state.is_valid() {
            return Ok(0);
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        self.require_owned(meta, BufferState::Writing)?;
        let pos = meta.write_pos.load(Ordering::Acquire) as usize;
        let buffer_size = self.state.buffer_size();
        if pos + data.len() > buffer_size {
            return Err(self.fail(RingError::SharedMemoryWrite {
                position: pos,
                requested: data.len(),
                buffer_size,
            }));
        }
        let Some(payload) = self.state.payload_ptr(buffer) else {
            return Ok(0);
        };
        // SAFETY: this handle owns the slot in Writing state, so no
        // peer mutates the payload; pos + data.len() is within bounds.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), payload.add(pos), data.len()) };
        self.state.touch(meta);
        meta.write_pos.store((pos + data.len()) as u64, Ordering::Release);
        self.state
            .last_seen_id
            .fetch_max(meta.sequence_id.load(Ordering::Acquire), Ordering::AcqRel);
        Ok(data.len())
    }

    /// Copies `out.len()` bytes from the buffer's read position.
    ///
    /// Requires ownership and `Reading` state. Reading past the end of
    /// the payload is fatal. After the copy the slot is re-verified:
    /// only if it is still owned in `Reading` state is the read
    /// position advanced, and the verification result is returned.
    pub fn read(&self, buffer: usize, out: &mut [u8]) -> Result<bool, RingError> {
        if !self.state.is_valid() {
            return Ok(false);
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        self.require_owned(meta, BufferState::Reading)?;
        self.state.touch(meta);
        let pos = meta.read_pos.load(Ordering::Acquire) as usize;
        let buffer_size = self.state.buffer_size();
        if pos + out.len() > buffer_size {
            return Err(self.fail(RingError::SharedMemoryRead {
                position: pos,
                requested: out.len(),
                buffer_size,
            }));
        }
        let Some(payload) = self.state.payload_ptr(buffer) else {
            return Ok(false);
        };
        // SAFETY: pos + out.len() is within the payload; an overwriting
        // peer may race the copy, which the re-verification below
        // detects (the bytes are then discarded by the caller).
        unsafe { ptr::copy_nonoverlapping(payload.add(pos), out.as_mut_ptr(), out.len()) };
        let still_owned = self.owns_in_state(meta, BufferState::Reading);
        if still_owned {
            meta.read_pos.store((pos + out.len()) as u64, Ordering::Release);
            self.state.touch(meta);
        }
        Ok(still_owned)
    }

    /// Completes a write: marks the buffer `Full` and hands ownership
    /// to `destination` (a specific reader id, or -1 for anyone).
    /// A handle that is not the owner yields silently.
    pub fn mark_full(&self, buffer: usize, destination: i16) -> Result<(), RingError> {
        if !self.state.is_valid() {
            return Ok(());
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        self.state.touch(meta);
        if meta.owner_id.load(Ordering::Acquire) == self.state.my_id() {
            if meta.state() != BufferState::Full {
                meta.state
                    .store(BufferState::Full as u16, Ordering::Release);
            }
            meta.owner_id.store(destination, Ordering::Release);
        }
        Ok(())
    }

    /// Completes a read, releasing the buffer.
    ///
    /// Without `force`, requires this handle to own the buffer in
    /// `Reading` state (violations tear down). The buffer returns to
    /// `Full`; it becomes `Empty` when consumed destructively, or when
    /// a forced release comes from the owner or the Creator. Ownership
    /// is always released.
    pub fn mark_empty(&self, buffer: usize, force: bool) -> Result<(), RingError> {
        if !self.state.is_valid() {
            return Ok(());
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        if !force {
            self.require_owned(meta, BufferState::Reading)?;
        }
        self.state.touch(meta);

        meta.read_pos.store(0, Ordering::Release);
        meta.state.store(BufferState::Full as u16, Ordering::Release);

        let me = self.state.my_id();
        let owner = meta.owner_id.load(Ordering::Acquire);
        let destructive = self.state.destructive();
        if (force && (me == 0 || owner == me)) || destructive {
            meta.write_pos.store(0, Ordering::Release);
            meta.state.store(BufferState::Empty as u16, Ordering::Release);
            if let Some(header) = self.state.header() {
                let count = self.state.buffer_count();
                if !destructive && header.reader_pos.load(Ordering::Acquire) as usize == buffer {
                    header
                        .reader_pos
                        .store(((buffer + 1) % count) as u32, Ordering::Release);
                }
            }
        }
        meta.owner_id.store(UNOWNED, Ordering::Release);
        Ok(())
    }

    /// Non-strict probe: whether the buffer is in `state` and owned by
    /// this handle (or unowned, where that is legal for the state).
    pub fn check_buffer(&self, buffer: usize, state: BufferState) -> Result<bool, RingError> {
        if !self.state.is_valid() {
            return Ok(false);
        }
        let meta = self.meta_checked(buffer)?;
        let _slot = self.state.lock_slot(buffer);
        Ok(self.owns_in_state(meta, state))
    }

    /// Number of processes attached to the segment, per the OS.
    pub fn attached_count(&self) -> u16 {
        let id = self.state.shm_id.load(Ordering::Relaxed);
        if !self.state.is_valid() || id == -1 {
            return 0;
        }
        match segment::attach_count(id) {
            Ok(n) => n as u16,
            Err(err) => {
                debug!("could not stat shared memory segment: {err}");
                0
            }
        }
    }

    /// Whether the segment is gone or has been marked for destruction.
    /// Peers treat this as the end-of-data condition.
    pub fn is_end_of_data(&self) -> bool {
        let id = self.state.shm_id.load(Ordering::Relaxed);
        if !self.state.is_valid() || id == -1 {
            return true;
        }
        match segment::marked_for_destruction(id) {
            Ok(marked) => {
                if marked {
                    info!(
                        "segment key {:#010x} marked for destruction; end of data",
                        self.state.key
                    );
                }
                marked
            }
            Err(err) => {
                debug!("could not stat shared memory segment: {err}");
                true
            }
        }
    }

    /// `(owner, state)` snapshot of every slot, for diagnostics.
    pub fn buffer_report(&self) -> Vec<(i16, BufferState)> {
        (0..self.state.buffer_count())
            .filter_map(|buffer| self.state.meta(buffer))
            .map(|meta| (meta.owner_id.load(Ordering::Acquire), meta.state()))
            .collect()
    }

    /// Detaches from the segment, returning owned buffers to a safe
    /// state. With `force`, the segment is removed even if this handle
    /// is not the Creator.
    pub fn detach(&self, force: bool) {
        self.state.detach(force);
    }
}

impl fmt::Display for SharedRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(header) = self.state.header() else {
            return writeln!(f, "SharedRing {:#010x}: detached", self.state.key);
        };
        writeln!(f, "RingHeader:")?;
        writeln!(
            f,
            "Reader Position: {}",
            header.reader_pos.load(Ordering::Acquire)
        )?;
        writeln!(
            f,
            "Writer Position: {}",
            header.writer_pos.load(Ordering::Acquire)
        )?;
        writeln!(f, "Next ID Number: {}", header.next_id.load(Ordering::Acquire))?;
        writeln!(f, "Buffer Count: {}", header.buffer_count)?;
        writeln!(f, "Buffer Size: {} bytes", header.buffer_size)?;
        writeln!(
            f,
            "Buffers Written: {}",
            header.next_sequence_id.load(Ordering::Acquire)
        )?;
        writeln!(f, "Rank of Writer: {}", header.rank.load(Ordering::Acquire))?;
        writeln!(
            f,
            "Ready Magic Bytes: {:#010x}",
            header.ready_magic.load(Ordering::Acquire)
        )?;
        for buffer in 0..self.state.buffer_count() {
            let Some(meta) = self.state.meta(buffer) else {
                continue;
            };
            writeln!(f)?;
            writeln!(f, "Buffer {buffer}:")?;
            writeln!(
                f,
                "sequence_id: {}",
                meta.sequence_id.load(Ordering::Acquire)
            )?;
            writeln!(f, "write_pos: {}", meta.write_pos.load(Ordering::Acquire))?;
            writeln!(f, "read_pos: {}", meta.read_pos.load(Ordering::Acquire))?;
            writeln!(f, "state: {}", meta.state())?;
            writeln!(f, "owner: {}", meta.owner_id.load(Ordering::Acquire))?;
            writeln!(
                f,
                "last touch: {:.6} s",
                meta.last_touch_us.load(Ordering::Acquire) as f64 / 1e6
            )?;
        }
        Ok(())
    }
}

impl Drop for SharedRing {
    fn drop(&mut self) {
        teardown::deregister(&self.state);
        self.state.detach(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Per-test keys: process-unique so concurrent test runs on one
    /// host do not collide, tag-unique within the process.
    fn test_key(tag: u32) -> u32 {
        0x4300_0000 | ((std::process::id() & 0x3FFF) << 8) | tag
    }

    fn creator_config(tag: u32, count: usize, size: usize, destructive: bool) -> RingConfig {
        RingConfig {
            destructive_read: destructive,
            ..RingConfig::new(test_key(tag), count, size)
        }
    }

    macro_rules! ring_or_skip {
        ($ring:expr) => {{
            let ring = $ring;
            if !ring.is_valid() {
                eprintln!("skipping: System V shared memory unavailable on this host");
                return;
            }
            ring
        }};
    }

    #[test]
    fn invalid_handle_returns_sentinels() {
        // Attach-only handle (buffer_count 0) to a key nobody created.
        let ring = SharedRing::new(RingConfig {
            attach_timeout: Duration::from_millis(10),
            ..RingConfig::new(test_key(0x01), 0, 0)
        });
        assert!(!ring.is_valid());
        assert_eq!(ring.my_id(), -1);
        assert_eq!(ring.buffer_count(), 0);
        assert_eq!(ring.get_buffer_for_reading(), None);
        assert_eq!(ring.get_buffer_for_writing(true), None);
        assert!(!ring.ready_for_read());
        assert_eq!(ring.write_ready_count(true), 0);
        assert!(ring.buffers_owned_by_self().is_empty());
        assert_eq!(ring.data_size(0).unwrap(), 0);
        assert_eq!(ring.write(0, b"x").unwrap(), 0);
        assert!(!ring.read(0, &mut [0u8; 1]).unwrap());
        assert!(ring.mark_empty(0, true).is_ok());
        assert_eq!(ring.attached_count(), 0);
        assert!(ring.is_end_of_data());
        assert!(ring.buffer_report().is_empty());
        assert!(ring.to_string().contains("detached"));
        // Detach on an invalid handle is a no-op, not a crash.
        ring.detach(false);
    }

    #[test]
    fn creator_initializes_and_cycles_one_buffer() {
        let ring = ring_or_skip!(SharedRing::new(creator_config(0x02, 2, 128, false)));
        assert!(ring.is_creator());
        assert_eq!(ring.my_id(), 0);
        assert_eq!(ring.buffer_count(), 2);
        assert_eq!(ring.buffer_size(), 128);
        assert_eq!(ring.write_ready_count(false), 2);
        assert_eq!(ring.read_ready_count(), 0);

        let buffer = ring.get_buffer_for_writing(false).unwrap();
        assert!(ring.check_buffer(buffer, BufferState::Writing).unwrap());
        assert_eq!(ring.buffers_owned_by_self(), vec![buffer]);
        assert_eq!(ring.write(buffer, b"hello world").unwrap(), 11);
        assert_eq!(ring.data_size(buffer).unwrap(), 11);
        assert_eq!(ring.last_seen_id(), 1);
        ring.mark_full(buffer, UNOWNED).unwrap();
        assert!(ring.check_buffer(buffer, BufferState::Full).unwrap());

        // Writing raised the producer's own watermark, so in broadcast
        // mode it does not see its own buffer as readable.
        assert_eq!(ring.get_buffer_for_reading(), None);

        // A second handle does.
        let consumer = SharedRing::new(creator_config(0x02, 2, 128, false));
        assert!(consumer.is_valid());
        assert_eq!(consumer.my_id(), 1);
        let got = consumer.get_buffer_for_reading();
        assert_eq!(got, Some(buffer));
        let mut out = [0u8; 11];
        assert!(consumer.read(buffer, &mut out).unwrap());
        assert_eq!(&out, b"hello world");
        assert!(!consumer.more_data(buffer).unwrap());
        consumer.mark_empty(buffer, false).unwrap();
        // Broadcast mode: the buffer returns to Full for other readers.
        assert!(ring.check_buffer(buffer, BufferState::Full).unwrap());
    }

    #[test]
    fn rank_round_trips_through_header() {
        let ring = ring_or_skip!(SharedRing::new(creator_config(0x03, 1, 32, false)));
        assert_eq!(ring.rank(), 0);
        ring.set_rank(7);
        assert_eq!(ring.rank(), 7);
    }

    #[test]
    fn reset_and_advance_positions() {
        let ring = ring_or_skip!(SharedRing::new(creator_config(0x04, 1, 64, true)));
        let buffer = ring.get_buffer_for_writing(false).unwrap();
        ring.write(buffer, &[1u8; 16]).unwrap();
        assert!(ring.advance_write_pos(buffer, 8).unwrap());
        assert_eq!(ring.data_size(buffer).unwrap(), 24);
        // Past the end: refused, not fatal.
        assert!(!ring.advance_write_pos(buffer, 64).unwrap());
        ring.reset_write_pos(buffer).unwrap();
        assert_eq!(ring.data_size(buffer).unwrap(), 0);
        ring.write(buffer, &[2u8; 8]).unwrap();
        ring.mark_full(buffer, UNOWNED).unwrap();

        let buffer = ring.get_buffer_for_reading().unwrap();
        assert!(ring.more_data(buffer).unwrap());
        assert!(ring.advance_read_pos(buffer, 8).unwrap());
        assert!(!ring.more_data(buffer).unwrap());
        assert!(ring.reset_read_pos(buffer).unwrap());
        assert!(ring.more_data(buffer).unwrap());
        ring.mark_empty(buffer, false).unwrap();
    }

    #[test]
    fn zero_length_advance_is_fatal() {
        let ring = ring_or_skip!(SharedRing::new(creator_config(0x05, 1, 32, false)));
        let buffer = ring.get_buffer_for_writing(false).unwrap();
        let err = ring.advance_write_pos(buffer, 0).unwrap_err();
        assert!(matches!(err, RingError::LogicError(_)));
        // The fatal error tore the handle down.
        assert!(!ring.is_valid());
    }

    #[test]
    fn overlong_write_is_fatal() {
        let ring = ring_or_skip!(SharedRing::new(creator_config(0x06, 1, 16, false)));
        let buffer = ring.get_buffer_for_writing(false).unwrap();
        let err = ring.write(buffer, &[0u8; 32]).unwrap_err();
        assert!(matches!(err, RingError::SharedMemoryWrite { .. }));
        assert!(!ring.is_valid());
    }

    #[test]
    fn out_of_range_buffer_is_fatal() {
        let ring = ring_or_skip!(SharedRing::new(creator_config(0x07, 2, 16, false)));
        let err = ring.data_size(5).unwrap_err();
        assert!(matches!(
            err,
            RingError::ArgumentOutOfRange { buffer: 5, count: 2 }
        ));
        assert!(!ring.is_valid());
    }

    #[test]
    fn writing_without_claim_is_fatal() {
        let ring = ring_or_skip!(SharedRing::new(creator_config(0x08, 1, 16, false)));
        let err = ring.write(0, b"x").unwrap_err();
        assert!(matches!(err, RingError::StateAccessViolation { .. }));
        assert!(!ring.is_valid());
    }

    #[test]
    fn display_covers_header_and_slots() {
        let ring = ring_or_skip!(SharedRing::new(creator_config(0x09, 2, 16, false)));
        let report = ring.to_string();
        assert!(report.contains("Reader Position"));
        assert!(report.contains("Ready Magic Bytes: 0xcafe1111"));
        assert!(report.contains("Buffer 1:"));
        assert!(report.contains("state: Empty"));
        assert_eq!(
            ring.buffer_report(),
            vec![(UNOWNED, BufferState::Empty), (UNOWNED, BufferState::Empty)]
        );
    }

    #[test]
    fn sequence_ids_are_strictly_monotonic() {
        let ring = ring_or_skip!(SharedRing::new(creator_config(0x0a, 3, 16, true)));
        let mut last = 0;
        for round in 0..3 {
            for _ in 0..3 {
                let buffer = ring.get_buffer_for_writing(true).unwrap();
                ring.write(buffer, &[round as u8; 4]).unwrap();
                ring.mark_full(buffer, UNOWNED).unwrap();
            }
            // Each claim stamped a fresh, larger sequence id.
            for (_, state) in ring.buffer_report() {
                assert_eq!(state, BufferState::Full);
            }
            assert!(ring.last_seen_id() > last);
            last = ring.last_seen_id();
        }
        assert_eq!(last, 9);
    }

    #[test]
    fn mismatched_attacher_parameters_fail() {
        let creator = ring_or_skip!(SharedRing::new(creator_config(0x0b, 2, 64, false)));
        let attacher = SharedRing::new(RingConfig {
            attach_timeout: Duration::from_millis(50),
            ..RingConfig::new(creator.key(), 2, 128)
        });
        assert!(!attacher.is_valid());
    }
}
