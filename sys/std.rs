
// sys/std.rs, the hosted system backend: a wrapping millisecond clock on
// Instant, a binary semaphore on Mutex+Condvar with an async wait built
// on async-io, and a plain mutex for the queue lock.

use core::future::Future;
use core::mem::transmute;
use core::pin::Pin;
use core::task::Context;
use core::task::Poll;
use core::task::Waker;
use core::time::Duration;

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Instant;

use async_io::Timer;

use crate::traits::*;


// Host memory, for queues created with with_size
pub(crate) use std::alloc::alloc;
pub(crate) use std::alloc::dealloc;


// Time primitives, milliseconds from an arbitrary epoch
#[allow(non_camel_case_types)] pub type utick = u32;
#[allow(non_camel_case_types)] pub type itick = i32;

/// Monotonic, wrapping millisecond clock
#[derive(Debug)]
pub struct SysClock {
    instant: Instant,
    origin: utick,
}

impl SysClock {
    pub(crate) fn with_origin(origin: utick) -> Self {
        Self {
            instant: Instant::now(),
            origin: origin,
        }
    }
}

impl Clock for SysClock {
    fn now(&self) -> utick {
        self.origin.wrapping_add(
            self.instant
                .elapsed()
                .as_millis()
                as utick
        )
    }
}


/// Binary semaphore
///
/// The signaled flag persists until the next wait, otherwise a signal
/// racing a waiter about to suspend would be lost.
#[derive(Debug)]
pub struct SysSema {
    state: Mutex<SemaState>,
    cond: Condvar,
}

#[derive(Debug)]
struct SemaState {
    signaled: bool,
    waker: Option<Waker>,
}

impl SysSema {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SemaState {
                signaled: false,
                waker: None,
            }),
            cond: Condvar::new(),
        }
    }
}

impl Signal for SysSema {
    fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        state.signaled = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        self.cond.notify_one();
    }
}

impl Sema for SysSema {
    fn wait(&self, timeout: Option<utick>) {
        let mut state = self.state.lock().unwrap();
        match timeout {
            Some(ms) => {
                // a single bounded wait, spurious wakeups are fine upstream
                if !state.signaled {
                    let (guard, _) = self.cond
                        .wait_timeout(state, Duration::from_millis(ms as u64))
                        .unwrap();
                    state = guard;
                }
            }
            None => {
                while !state.signaled {
                    state = self.cond.wait(state).unwrap();
                }
            }
        }
        state.signaled = false;
    }
}

/// Future for async semaphore waits, completes on signal or timeout
#[derive(Debug)]
pub struct SysSemaWait<'a> {
    sema: &'a SysSema,
    timer: Option<Timer>,
}

impl Future for SysSemaWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = unsafe { self.get_unchecked_mut() };
        let mut state = this.sema.state.lock().unwrap();
        if state.signaled {
            state.signaled = false;
            state.waker = None;
            return Poll::Ready(());
        }

        // save waker for signalling
        state.waker = Some(cx.waker().clone());
        drop(state);

        match this.timer.as_mut() {
            Some(timer) => {
                // wait on timer
                unsafe { Pin::new_unchecked(timer) }
                    .poll(cx)
                    .map(|_| ())
            }
            None => Poll::Pending,
        }
    }
}

impl Drop for SysSemaWait<'_> {
    fn drop(&mut self) {
        // make sure the waker is cleared
        self.sema.state.lock().unwrap().waker = None;
    }
}

impl AsyncSema for SysSema {
    // unfortunately we can't define types with lifetimes
    // in traits, the best we can do is unsafely strip the
    // lifetime and leave it up to the caller to drop the
    // types in the correct order
    type AsyncWait = SysSemaWait<'static>;

    fn wait_async(&self, timeout: Option<utick>) -> Self::AsyncWait {
        // only one async wait at a time
        debug_assert!(self.state.lock().unwrap().waker.is_none());

        let wait = SysSemaWait {
            sema: self,
            timer: timeout.map(|ms| Timer::after(Duration::from_millis(ms as u64))),
        };

        // strip lifetime
        unsafe { transmute::<SysSemaWait<'_>, _>(wait) }
    }
}


/// Queue lock
///
/// A plain mutex here, bare-metal ports save and mask the interrupt
/// priority mask instead.
#[derive(Debug)]
pub struct SysLock(Mutex<()>);

impl SysLock {
    pub(crate) fn new() -> Self {
        SysLock(Mutex::new(()))
    }
}

impl Lock for SysLock {
    // same lifetime-strip as the async wait
    type Guard = MutexGuard<'static, ()>;

    fn lock(&self) -> Self::Guard {
        let guard = self.0.lock().unwrap();
        unsafe { transmute::<MutexGuard<'_, ()>, _>(guard) }
    }
}
