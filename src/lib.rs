//! evq, a bounded, time-ordered event queue for embedded and hosted
//! programs.
//!
//! Events are carved out of a fixed arena, posted with optional delays
//! and periods, and dispatched in deadline order from a single
//! dispatcher. Posting, cancelling, and draining ready events are safe
//! from interrupt contexts, the system specifics live behind the traits
//! in [`traits`] with backends selected at build time.

#![deny(missing_debug_implementations)]
// the slab arena is a shared &'static [u8] with interior mutation done
// through raw pointer casts (see Eoff::as_mut, Evq::alloc_slot); this is
// the intended design of the crate, not an oversight
#![allow(invalid_reference_casting)]

use core::alloc::Layout;
use core::borrow::Borrow;
use core::borrow::BorrowMut;
use core::cell::Cell;
use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::mem::align_of;
use core::mem::forget;
use core::mem::size_of;
use core::num::NonZeroUsize;
use core::ops::Deref;
use core::ops::DerefMut;
use core::ptr;
use core::ptr::drop_in_place;
use core::ptr::NonNull;
use core::slice;

mod util;
use util::*;

pub mod traits;
use traits::*;

pub mod sys;
use sys::*;


/// Event queue errors
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    NoMem,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMem => write!(f, "Out of memory"),
        }
    }
}

impl std::error::Error for Error {}


/// Unique identifier for a posted event
///
/// Ids pack a generation count over the event's slot offset, the
/// generation advances every time the slot is reclaimed, so a stale id
/// can never reach a reused slot. Safe to hand across threads and
/// interrupt contexts.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Id(NonZeroUsize);

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // these really need to be in hex to be readable
        write!(f, "Id(0x{:x})", self.0.get())
    }
}


/// Why dispatch returned
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Dispatched until the requested timeout
    Timeout,
    /// Interrupted by break_
    Break,
}


/// Slab-internal offset, zero is null
///
/// Offset zero always falls in the bucket array at the front of the
/// slab, so no event can ever live there.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
struct Eoff(usize);

impl fmt::Debug for Eoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // these really need to be in hex to be readable
        write!(f, "Eoff(0x{:x})", self.0)
    }
}

impl Eoff {
    // maximum alignment of internal allocations, this must be at least
    // Eslot's alignment, and pointer alignment is a common request
    const ALIGN: usize = max(
        max(align_of::<Eoff>(), align_of::<Eslot>()),
        align_of::<*const usize>()
    );

    const fn null() -> Eoff {
        Eoff(0)
    }

    fn from(q: &Evq, e: &Eslot) -> Eoff {
        unsafe {
            Eoff(
                (e as *const Eslot as *const u8)
                    .offset_from(q.slab.as_ptr())
                    as usize
            )
        }
    }

    fn as_ref(self, q: &Evq) -> Option<&Eslot> {
        if self.0 != 0 {
            Some(unsafe { &*(&q.slab[self.0] as *const u8 as *const Eslot) })
        } else {
            None
        }
    }

    fn as_mut(self, q: &Evq) -> Option<&mut Eslot> {
        unsafe {
            self.as_ref(q).map(|e| &mut *(e as *const Eslot as *mut Eslot))
        }
    }
}

/// Event slot states, a slot is in exactly one at any time
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    /// On its bucket's free list
    Free,
    /// Owned by a caller, between alloc and post
    Alloced,
    /// In the pending list, ordered by target
    Pending,
    /// Claimed by the dispatcher
    Dispatching,
    /// Cancelled, reclaim but never repost
    Zombie,
}

/// Internal event header, lives just before its payload in the slab
#[derive(Debug)]
struct Eslot {
    npw2: u8,
    state: State,
    gen: usize,
    next: Eoff,
    prev: Eoff,
    target: utick,
    period: itick,
    cb: Option<fn(*mut u8)>,
    drop: Option<fn(*mut u8)>,
}

impl Eslot {
    unsafe fn as_ptr<T>(&self) -> *const T {
        (self as *const Eslot).add(1) as *const T
    }

    unsafe fn as_mut_ptr<T>(&mut self) -> *mut T {
        (self as *mut Eslot).add(1) as *mut T
    }

    fn as_ref<T>(&self) -> &T {
        unsafe { &*self.as_ptr() }
    }

    fn as_mut<T>(&mut self) -> &mut T {
        unsafe { &mut *self.as_mut_ptr() }
    }

    unsafe fn from_mut_ptr<'a, T>(ptr: *mut T) -> Option<&'a mut Eslot> {
        if !ptr.is_null() {
            Some(&mut *(ptr as *mut Eslot).sub(1))
        } else {
            None
        }
    }

    fn size(&self) -> usize {
        size_of::<Eslot>() + (Eoff::ALIGN << self.npw2)
    }

    fn reinit(&mut self) {
        self.state = State::Alloced;
        self.next = Eoff::null();
        self.prev = Eoff::null();
        self.target = 0;
        self.period = -1;
        self.cb = None;
        self.drop = None;
    }
}


/// Event queue struct
pub struct Evq {
    // the arena, and how many bits address it
    slab: &'static [u8],
    npw2: u8,
    owned: bool,

    // shared state, all guarded by lock
    slab_front: Cell<usize>,
    slab_back: Cell<usize>,
    chunks: Cell<usize>,
    chunk_bytes: Cell<usize>,
    queue: Cell<Eoff>,
    dispatching: Cell<Eoff>,
    break_requested: Cell<bool>,
    background: UnsafeCell<Option<Box<dyn FnMut(Option<utick>) + Send>>>,
    background_active: Cell<bool>,

    lock: SysLock,
    sema: SysSema,
    clock: SysClock,
}

unsafe impl Send for Evq {}
unsafe impl Sync for Evq {}

impl fmt::Debug for Evq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evq")
            .field("slab", &self.slab.as_ptr_range())
            .field("npw2", &self.npw2)
            .field("slab_front", &self.slab_front.get())
            .field("slab_back", &self.slab_back.get())
            .field("queue", &self.queue.get())
            .finish_non_exhaustive()
    }
}

impl Evq {
    /// Create a queue with a host-allocated arena
    pub fn with_size(size: usize) -> Evq {
        Evq::with_origin(size, 0)
    }

    /// Create a queue with a host-allocated arena and an explicit clock
    /// origin
    ///
    /// Mostly useful for exercising behavior near the tick wrap.
    pub fn with_origin(size: usize, origin: utick) -> Evq {
        let layout = Layout::from_size_align(size, Eoff::ALIGN)
            .expect("evq: arena size overflow");
        let buffer = unsafe { sys::alloc(layout) };
        if buffer.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        unsafe { ptr::write_bytes(buffer, 0, size) };
        let slab = unsafe { slice::from_raw_parts(buffer, size) };
        Evq::from_parts(slab, true, origin)
    }

    /// Create a queue in a caller-provided arena
    ///
    /// The arena carries all of the queue's bookkeeping inline, nothing
    /// else is allocated.
    pub fn with_buffer(buffer: &'static mut [u8]) -> Result<Evq, Error> {
        // align buffer
        let align = alignup(buffer.as_ptr() as usize, Eoff::ALIGN)
            - buffer.as_ptr() as usize;
        let buffer = match buffer.get_mut(align..) {
            // already overflow?
            Some(buffer) => buffer,
            None => return Err(Error::NoMem),
        };

        // zero the buffer, bucket allocation relies on fresh bucket slots
        // reading as null
        buffer.fill(0);

        Ok(Evq::from_parts(buffer, false, 0))
    }

    fn from_parts(slab: &'static [u8], owned: bool, origin: utick) -> Evq {
        Evq {
            slab: slab,
            npw2: npw2(slab.len()),
            owned: owned,

            slab_front: Cell::new(0),
            slab_back: Cell::new(slab.len()),
            chunks: Cell::new(0),
            chunk_bytes: Cell::new(0),
            queue: Cell::new(Eoff::null()),
            dispatching: Cell::new(Eoff::null()),
            break_requested: Cell::new(false),
            background: UnsafeCell::new(None),
            background_active: Cell::new(true),

            lock: SysLock::new(),
            sema: SysSema::new(),
            clock: SysClock::with_origin(origin),
        }
    }

    /// The queue's current clock reading
    pub fn tick(&self) -> utick {
        self.clock.now()
    }
}

impl Drop for Evq {
    fn drop(&mut self) {
        // tell any background timer or chain to stand down
        if let Some(mut background) =
            unsafe { &mut *self.background.get() }.take()
        {
            background(None);
        }

        // drain pending and claimed events, running their destructors
        for list in [self.queue.get(), self.dispatching.get()] {
            let mut eoff = list;
            while let Some(e) = eoff.as_mut(self) {
                eoff = e.next;
                if let Some(drop) = e.drop {
                    drop(unsafe { e.as_mut_ptr() });
                }
            }
        }

        if self.owned {
            unsafe {
                sys::dealloc(
                    self.slab.as_ptr() as *mut u8,
                    Layout::from_size_align_unchecked(
                        self.slab.len(),
                        Eoff::ALIGN
                    ),
                );
            }
        }
    }
}

// Memory management
impl Evq {
    fn buckets(&self) -> &[Cell<Eoff>] {
        let slab_front = self.slab_front.get();
        unsafe {
            slice::from_raw_parts(
                self.slab.as_ptr() as *const Cell<Eoff>,
                slab_front / size_of::<Eoff>()
            )
        }
    }

    fn contains_eslot(&self, e: &Eslot) -> bool {
        self.slab.as_ptr_range()
            .contains(&(e as *const Eslot as *const u8))
    }

    // the queue lock must be held
    fn alloc_slot(&self, layout: Layout) -> Result<&mut Eslot, Error> {
        assert!(layout.align() <= Eoff::ALIGN);

        // find best bucket
        let npw2 = npw2(alignup(layout.size(), Eoff::ALIGN) / Eoff::ALIGN);

        // first, do we have a freed chunk of this class? we don't look at
        // larger buckets, those are kept for the requests that carved
        // them, so small events can't starve larger events
        if let Some(bucket) = self.buckets().get(npw2 as usize) {
            if let Some(e) = bucket.get().as_mut(self) {
                debug_assert_eq!(e.state, State::Free);
                bucket.set(e.next);
                e.reinit();
                return Ok(e);
            }
        }

        // second, grow the bucket array if this is a new class, and carve
        // the chunk from the back of the slab
        let slab_front = self.slab_front.get();
        let slab_back = self.slab_back.get();
        let new_slab_front = max(
            (npw2 as usize + 1)*size_of::<Eoff>(),
            slab_front
        );
        let new_slab_back = aligndown(
            slab_back.saturating_sub(size_of::<Eslot>() + (Eoff::ALIGN << npw2)),
            Eoff::ALIGN
        );

        if new_slab_front > new_slab_back {
            return Err(Error::NoMem);
        }

        // new bucket slots were zeroed at creation, so they already read
        // as null
        self.slab_front.set(new_slab_front);
        self.slab_back.set(new_slab_back);
        self.chunks.set(self.chunks.get() + 1);
        self.chunk_bytes.set(
            self.chunk_bytes.get()
                + size_of::<Eslot>() + (Eoff::ALIGN << npw2)
        );

        unsafe {
            let e = &self.slab[new_slab_back]
                as *const u8 as *const Eslot as *mut Eslot;
            e.write(Eslot {
                npw2: npw2,
                state: State::Alloced,
                gen: 1,
                next: Eoff::null(),
                prev: Eoff::null(),
                target: 0,
                period: -1,
                cb: None,
                drop: None,
            });

            Ok(&mut *e)
        }
    }

    // return a chunk to its bucket, the queue lock must be held
    fn free_slot(&self, e: &mut Eslot) {
        debug_assert!(self.contains_eslot(e));

        // bump the generation so stale ids die with the slot
        e.gen = self.gen_inc(e.gen);
        e.state = State::Free;
        e.cb = None;
        e.drop = None;
        e.prev = Eoff::null();

        let bucket = &self.buckets()[e.npw2 as usize];
        e.next = bucket.get();
        bucket.set(Eoff::from(self, e));
    }

    fn gen_inc(&self, gen: usize) -> usize {
        // generations skip zero so ids are never zero
        let gen = gen.wrapping_add(1) & (usize::MAX >> self.npw2);
        if gen == 0 { 1 } else { gen }
    }

    fn make_id(&self, e: &Eslot) -> Id {
        Id(NonZeroUsize::new((e.gen << self.npw2) | Eoff::from(self, e).0)
            .unwrap())
    }

    // decode an id back into its slot, None if the generation no longer
    // matches. The queue lock must be held.
    fn slot_of(&self, id: Id) -> Option<&mut Eslot> {
        let eoff = id.0.get() & ((1 << self.npw2) - 1);
        let gen = id.0.get() >> self.npw2;

        // ids are opaque, but stale ones can outlive any slot, so be
        // paranoid about what we dereference
        if eoff < self.slab_back.get()
            || eoff + size_of::<Eslot>() > self.slab.len()
            || eoff % Eoff::ALIGN != 0
        {
            return None;
        }

        let e = Eoff(eoff).as_mut(self)?;
        if e.gen != gen {
            return None;
        }
        Some(e)
    }
}

// Queue management
impl Evq {
    // ordered insert into the pending list, inserting before the first
    // strictly-later event keeps posts FIFO among equal deadlines.
    // Returns true if the event became the new head. The queue lock must
    // be held.
    fn enqueue_slot(&self, e: &mut Eslot) -> bool {
        debug_assert!(e.cb.is_some());
        let eoff = Eoff::from(self, e);
        e.state = State::Pending;

        let mut prev = Eoff::null();
        let mut cur = self.queue.get();
        while let Some(c) = cur.as_ref(self) {
            if sdiff(c.target, e.target) > 0 {
                break;
            }
            prev = cur;
            cur = c.next;
        }

        e.next = cur;
        e.prev = prev;
        if let Some(n) = cur.as_mut(self) {
            n.prev = eoff;
        }
        match prev.as_mut(self) {
            Some(p) => {
                p.next = eoff;
                false
            }
            None => {
                self.queue.set(eoff);
                true
            }
        }
    }

    // O(1) unlink via the back-link, the queue lock must be held
    fn unqueue_slot(&self, e: &mut Eslot) {
        debug_assert_eq!(e.state, State::Pending);
        if let Some(n) = e.next.as_mut(self) {
            n.prev = e.prev;
        }
        match e.prev.as_mut(self) {
            Some(p) => p.next = e.next,
            None => self.queue.set(e.next),
        }
        e.next = Eoff::null();
        e.prev = Eoff::null();
    }

    // tell the background timer about the new head, if anyone is
    // listening and no dispatcher is running. The queue lock must be
    // held.
    fn background_update(&self, now: utick) {
        if !self.background_active.get() {
            return;
        }
        if let Some(background) =
            unsafe { &mut *self.background.get() }.as_mut()
        {
            match self.queue.get().as_ref(self) {
                Some(head) => background(Some(clampdiff(head.target, now))),
                None => background(None),
            }
        }
    }

    // compute the deadline, insert, and wake the dispatcher
    fn post_slot(&self, e: &mut Eslot) -> Id {
        let now = self.clock.now();
        // until an event is posted, target holds the requested delay
        let delay = min(e.target, itick::MAX as utick);
        e.target = now.wrapping_add(delay);

        let guard = self.lock.lock();
        let new_head = self.enqueue_slot(e);
        let id = self.make_id(e);
        if new_head {
            self.background_update(now);
        }
        drop(guard);

        self.sema.signal();
        id
    }
}

enum Step {
    Done(Dispatch),
    Wait(Option<utick>),
}

// Dispatch
impl Evq {
    // one pass of the dispatch loop: claim ready events, run them,
    // then decide whether to stop or how long to sleep
    fn dispatch_step(&self, timeout: Option<utick>) -> Step {
        // claim the ready prefix of the pending list wholesale, it is
        // already in dispatch order
        let now = self.clock.now();
        {
            let _guard = self.lock.lock();
            debug_assert_eq!(self.dispatching.get(), Eoff::null());

            let head = self.queue.get();
            let mut tail = Eoff::null();
            let mut cur = head;
            while let Some(e) = cur.as_mut(self) {
                if sdiff(e.target, now) > 0 {
                    break;
                }
                e.state = State::Dispatching;
                tail = cur;
                cur = e.next;
            }

            if let Some(t) = tail.as_mut(self) {
                t.next = Eoff::null();
                self.queue.set(cur);
                if let Some(n) = cur.as_mut(self) {
                    n.prev = Eoff::null();
                }
                self.dispatching.set(head);
            }
        }

        // run the claimed events in order
        loop {
            let e: *mut Eslot;
            let cb: Option<fn(*mut u8)>;
            {
                let _guard = self.lock.lock();
                match self.dispatching.get().as_mut(self) {
                    Some(head) => {
                        self.dispatching.set(head.next);
                        head.next = Eoff::null();
                        cb = match head.state {
                            // cancelled before it could start
                            State::Zombie => None,
                            _ => head.cb,
                        };
                        e = head as *mut Eslot;
                    }
                    None => break,
                }
            }

            // actually dispatch the callback, with the lock released
            let e = unsafe { &mut *e };
            if let Some(cb) = cb {
                cb(unsafe { e.as_mut_ptr() });
            }

            // reschedule periodic events, reclaim everything else
            let reclaim = {
                let _guard = self.lock.lock();
                if e.state == State::Dispatching && e.period >= 0 {
                    // periodic deadlines advance from the previous
                    // deadline, preserving phase across busy dispatchers
                    e.target = e.target.wrapping_add(e.period as utick);
                    self.enqueue_slot(e);
                    false
                } else {
                    true
                }
            };
            if reclaim {
                if let Some(drop) = e.drop {
                    drop(unsafe { e.as_mut_ptr() });
                }
                let _guard = self.lock.lock();
                self.free_slot(e);
            }
        }

        // stop if someone broke us out of the loop, events already
        // claimed above have run to completion
        {
            let _guard = self.lock.lock();
            if self.break_requested.get() {
                self.break_requested.set(false);
                return Step::Done(Dispatch::Break);
            }
        }

        // out of time? re-arm the background timer on the way out
        let now = self.clock.now();
        if let Some(timeout) = timeout {
            if sdiff(now, timeout) >= 0 {
                let _guard = self.lock.lock();
                self.background_active.set(true);
                self.background_update(now);
                return Step::Done(Dispatch::Timeout);
            }
        }

        // how long can we sleep?
        let next = {
            let _guard = self.lock.lock();
            self.queue.get().as_ref(self)
                .map(|head| clampdiff(head.target, now))
        };
        let wait = match (next, timeout.map(|t| clampdiff(t, now))) {
            (Some(a), Some(b)) => Some(min(a, b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        Step::Wait(wait)
    }

    fn dispatch_deadline(&self, ms: Option<utick>) -> Option<utick> {
        ms.map(|ms| {
            self.clock.now().wrapping_add(min(ms, itick::MAX as utick))
        })
    }

    /// Dispatch events for approximately ms milliseconds
    ///
    /// None dispatches forever, until break_. Some(0) drains the
    /// currently ready events without suspending, and is safe to call
    /// from interrupt contexts. There must be at most one dispatcher per
    /// queue at a time, and dispatch must not be called from a
    /// dispatched event.
    pub fn dispatch(&self, ms: Option<utick>) -> Dispatch {
        let timeout = self.dispatch_deadline(ms);
        {
            let _guard = self.lock.lock();
            self.background_active.set(false);
        }

        loop {
            match self.dispatch_step(timeout) {
                Step::Done(dispatch) => return dispatch,
                Step::Wait(wait) => self.sema.wait(wait),
            }
        }
    }

    /// Dispatch the currently ready events without suspending
    pub fn dispatch_ready(&self) -> Dispatch {
        self.dispatch(Some(0))
    }

    /// Dispatch asynchronously, suspending on the async semaphore
    /// instead of blocking the thread
    pub async fn dispatch_async(&self, ms: Option<utick>) -> Dispatch {
        let timeout = self.dispatch_deadline(ms);
        {
            let _guard = self.lock.lock();
            self.background_active.set(false);
        }

        loop {
            match self.dispatch_step(timeout) {
                Step::Done(dispatch) => return dispatch,
                Step::Wait(wait) => self.sema.wait_async(wait).await,
            }
        }
    }

    /// Break a running dispatch out of its loop
    ///
    /// An event that is currently executing runs to completion, the
    /// dispatcher only checks between events.
    pub fn break_(&self) {
        {
            let _guard = self.lock.lock();
            self.break_requested.set(true);
        }
        self.sema.signal();
    }

    /// Cancel an in-flight event
    ///
    /// Returns true iff the event was reclaimed before its callback
    /// started executing. Stale ids are a silent no-op, cancels race
    /// dispatch by design. A cancel can not stop a callback that is
    /// already running, but a cancelled periodic event will not fire
    /// again.
    pub fn cancel(&self, id: Id) -> bool {
        let e = {
            let _guard = self.lock.lock();
            let e = match self.slot_of(id) {
                Some(e) => e,
                None => return false,
            };
            match e.state {
                State::Pending => {
                    self.unqueue_slot(e);
                    // ours now, reclaim outside the lock
                    e.state = State::Zombie;
                    e as *mut Eslot
                }
                State::Dispatching => {
                    // already claimed, the dispatcher will see the zombie
                    // and reclaim it instead of reposting
                    e.state = State::Zombie;
                    return false;
                }
                _ => return false,
            }
        };

        let e = unsafe { &mut *e };
        if let Some(drop) = e.drop {
            drop(unsafe { e.as_mut_ptr() });
        }
        {
            let _guard = self.lock.lock();
            self.free_slot(e);
        }
        self.sema.signal();
        true
    }
}

// raw queue handle that crosses into posted closures, chain's caller
// guarantees the pointee outlives the chain
#[derive(Clone, Copy)]
struct QueuePtr(NonNull<Evq>);

unsafe impl Send for QueuePtr {}

// Background timers and chaining
impl Evq {
    /// Install a background timer callback
    ///
    /// The callback is invoked with the time until the next event
    /// whenever the pending list's head changes while no dispatcher is
    /// running, or with None when nothing is pending and the timer can be
    /// cancelled. This lets a hardware timer or host event loop drive the
    /// queue via dispatch_ready without a dedicated thread.
    ///
    /// Updates are delivered under the queue's internal lock, the
    /// callback must not call back into this queue. A replaced callback
    /// is first told None.
    pub fn background(
        &self,
        background: Option<Box<dyn FnMut(Option<utick>) + Send>>
    ) {
        let now = self.clock.now();
        let _guard = self.lock.lock();
        let slot = unsafe { &mut *self.background.get() };
        if let Some(mut old) = slot.take() {
            old(None);
        }
        *slot = background;
        self.background_active.set(true);
        self.background_update(now);
    }

    /// Route this queue's dispatch through target's dispatch loop
    ///
    /// The chained queue keeps its own arena and pending list, only a
    /// single small dispatch-me event crosses over to target, reposted
    /// whenever this queue's next-wake time changes. chain(None) disarms
    /// the chain and cancels the outstanding dispatch-me event.
    ///
    /// # Safety
    ///
    /// target must outlive this queue, chains must not form a cycle, and
    /// once chained this queue must not run its own dispatcher.
    pub unsafe fn chain(&self, target: Option<&Evq>) {
        match target {
            Some(target) => {
                let chained = QueuePtr(NonNull::from(self));
                let target = QueuePtr(NonNull::from(target));
                let mut posted: Option<Id> = None;
                self.background(Some(Box::new(move |delay| {
                    let chained = chained;
                    let target = target;
                    let target = unsafe { target.0.as_ref() };
                    if let Some(id) = posted.take() {
                        target.cancel(id);
                    }
                    if let Some(delay) = delay {
                        let chained = QueuePtr(chained.0);
                        posted = target.call_in(delay, move || {
                            let chained = chained;
                            unsafe { chained.0.as_ref() }.dispatch_ready();
                        }).ok();
                    }
                })));
            }
            None => {
                self.background(None);
            }
        }
    }
}

// Handling of raw allocations, this is the surface ergonomic binding
// layers build on
impl Evq {
    /// Allocate a raw payload region of at least layout.size() bytes
    ///
    /// Null if the queue is out of memory.
    pub unsafe fn alloc_raw(&self, layout: Layout) -> *mut u8 {
        let _guard = self.lock.lock();
        match self.alloc_slot(layout) {
            Ok(e) => e.as_mut_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Free a raw event, running its destructor if one was installed
    pub unsafe fn dealloc_raw(&self, e: *mut u8, _layout: Layout) {
        let e = match Eslot::from_mut_ptr(e) {
            Some(e) => e,
            None => return, // do nothing
        };
        debug_assert!(self.contains_eslot(e));

        if let Some(drop) = e.drop {
            drop(e.as_mut_ptr());
        }
        let _guard = self.lock.lock();
        self.free_slot(e);
    }

    pub fn contains_raw(&self, e: *mut u8) -> bool {
        match unsafe { Eslot::from_mut_ptr(e) } {
            Some(e) => self.contains_eslot(e),
            None => false,
        }
    }

    /// Delay before a posted event fires, saturates at half the tick
    /// range
    pub unsafe fn set_raw_delay(&self, e: *mut u8, ms: utick) {
        let e = Eslot::from_mut_ptr(e).unwrap();
        debug_assert!(self.contains_eslot(e));
        e.target = min(ms, itick::MAX as utick);
    }

    /// Period for repeatedly firing events, None for one-shot
    pub unsafe fn set_raw_period(&self, e: *mut u8, ms: Option<utick>) {
        let e = Eslot::from_mut_ptr(e).unwrap();
        debug_assert!(self.contains_eslot(e));
        e.period = match ms {
            Some(ms) => min(ms, itick::MAX as utick) as itick,
            None => -1,
        };
    }

    /// Destructor to run when the event is reclaimed
    pub unsafe fn set_raw_drop(&self, e: *mut u8, drop: fn(*mut u8)) {
        let e = Eslot::from_mut_ptr(e).unwrap();
        debug_assert!(self.contains_eslot(e));
        e.drop = Some(drop);
    }

    /// Post a raw event, returning an id for cancel
    pub unsafe fn post_raw(&self, cb: fn(*mut u8), e: *mut u8) -> Id {
        let e = Eslot::from_mut_ptr(e).unwrap();
        debug_assert!(self.contains_eslot(e));
        e.cb = Some(cb);
        self.post_slot(e)
    }
}


/// An allocated but not yet posted event
///
/// Derefs to its payload, so the payload can be configured in place
/// before posting. Dropping the handle reclaims the event.
#[derive(Debug)]
pub struct Event<'a, T> {
    q: &'a Evq,
    e: &'a mut Eslot,
    _phantom: PhantomData<T>,
}

impl<'a, T> Event<'a, T> {
    fn from_eslot(q: &'a Evq, e: &'a mut Eslot) -> Event<'a, T> {
        debug_assert!(q.contains_eslot(e));
        Event {
            q: q,
            e: e,
            _phantom: PhantomData,
        }
    }

    /// Delay before the event fires, saturates at half the tick range
    pub fn delay(self, ms: utick) -> Self {
        self.e.target = min(ms, itick::MAX as utick);
        self
    }

    /// Fire repeatedly with this period, None for one-shot
    pub fn period(self, ms: Option<utick>) -> Self {
        self.e.period = match ms {
            Some(ms) => min(ms, itick::MAX as utick) as itick,
            None => -1,
        };
        self
    }
}

impl Evq {
    /// Allocate an event, moving t into the queue-owned payload
    pub fn alloc<T: Send>(&self, t: T) -> Result<Event<'_, T>, Error> {
        let e = {
            let _guard = self.lock.lock();
            self.alloc_slot(Layout::new::<T>())?
        };
        unsafe { e.as_mut_ptr::<T>().write(t); }
        Ok(Event::from_eslot(self, e))
    }

    /// Post an allocated event, consuming the handle
    pub fn post<T: Post>(&self, e: Event<'_, T>) -> Id {
        // cb/drop thunks
        fn cb_thunk<T: Post>(e: *mut u8) {
            unsafe { &mut *(e as *mut T) }.post();
        }

        fn drop_thunk<T>(e: *mut u8) {
            unsafe { drop_in_place(e as *mut T) };
        }

        debug_assert!(ptr::eq(self, e.q));
        e.e.cb = Some(cb_thunk::<T>);
        e.e.drop = Some(drop_thunk::<T>);

        // enqueue and then forget the handle, the queue owns the event
        // from here on
        let id = self.post_slot(e.e);
        forget(e);
        id
    }
}

impl<T: Post> Event<'_, T> {
    /// Post the event, consuming the handle
    pub fn post(self) -> Id {
        self.q.post(self)
    }
}

impl<T> Drop for Event<'_, T> {
    fn drop(&mut self) {
        // make sure we clean up if the event isn't dispatched
        unsafe { drop_in_place(self.e.as_mut_ptr::<T>()) };
        let _guard = self.q.lock.lock();
        self.q.free_slot(self.e);
    }
}

impl<T> Deref for Event<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.e.as_ref()
    }
}

impl<T> DerefMut for Event<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.e.as_mut()
    }
}

impl<T> AsRef<T> for Event<'_, T> {
    fn as_ref(&self) -> &T {
        self.e.as_ref()
    }
}

impl<T> AsMut<T> for Event<'_, T> {
    fn as_mut(&mut self) -> &mut T {
        self.e.as_mut()
    }
}

impl<T> Borrow<T> for Event<'_, T> {
    fn borrow(&self) -> &T {
        self.e.as_ref()
    }
}

impl<T> BorrowMut<T> for Event<'_, T> {
    fn borrow_mut(&mut self) -> &mut T {
        self.e.as_mut()
    }
}

// Convenience functions
impl Evq {
    /// Post a callback for immediate dispatch
    pub fn call<F: Post + Send>(&self, cb: F) -> Result<Id, Error> {
        Ok(self.alloc(cb)?
            .post())
    }

    /// Post a callback to be dispatched after a delay in milliseconds
    pub fn call_in<F: Post + Send>(
        &self,
        delay: utick,
        cb: F
    ) -> Result<Id, Error> {
        Ok(self.alloc(cb)?
            .delay(delay)
            .post())
    }

    /// Post a callback to be dispatched periodically, starting one
    /// period from now
    pub fn call_every<F: Post + Send>(
        &self,
        period: utick,
        cb: F
    ) -> Result<Id, Error> {
        Ok(self.alloc(cb)?
            .delay(period)
            .period(Some(period))
            .post())
    }
}


/// Queue usage statistics
#[derive(Debug, Clone)]
pub struct Usage {
    pub pending: usize,
    pub pending_bytes: usize,
    pub alloced: usize,
    pub alloced_bytes: usize,
    pub free: usize,
    pub free_bytes: usize,
    pub chunks: usize,
    pub chunk_bytes: usize,
    pub slab_total: usize,
    pub slab_unused: usize,
    pub buckets: usize,
}

impl Evq {
    pub fn usage(&self) -> Usage {
        let _guard = self.lock.lock();

        let mut pending = 0;
        let mut pending_bytes = 0;
        for list in [self.queue.get(), self.dispatching.get()] {
            let mut eoff = list;
            while let Some(e) = eoff.as_ref(self) {
                pending += 1;
                pending_bytes += e.size();
                eoff = e.next;
            }
        }

        let mut free = 0;
        let mut free_bytes = 0;
        for bucket in self.buckets() {
            let mut eoff = bucket.get();
            while let Some(e) = eoff.as_ref(self) {
                free += 1;
                free_bytes += e.size();
                eoff = e.next;
            }
        }

        let chunks = self.chunks.get();
        let chunk_bytes = self.chunk_bytes.get();
        Usage {
            pending: pending,
            pending_bytes: pending_bytes,
            alloced: chunks - free - pending,
            alloced_bytes: chunk_bytes - free_bytes - pending_bytes,
            free: free,
            free_bytes: free_bytes,
            chunks: chunks,
            chunk_bytes: chunk_bytes,
            slab_total: self.slab.len(),
            slab_unused: self.slab_back.get() - self.slab_front.get(),
            buckets: self.buckets().len(),
        }
    }

    pub fn bucket_usage(&self, buckets: &mut [usize]) {
        let _guard = self.lock.lock();
        for (count, bucket) in buckets.iter_mut().zip(self.buckets()) {
            let mut n = 0;
            let mut eoff = bucket.get();
            while let Some(e) = eoff.as_ref(self) {
                n += 1;
                eoff = e.next;
            }
            *count = n;
        }
    }
}
