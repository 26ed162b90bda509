
// sys/loom.rs, the model-checking backend. Loom has no notion of time, so
// the clock is frozen at its origin and semaphore waits return
// immediately, which the sema contract permits as a spurious wakeup.

use core::future::Future;
use core::mem::transmute;
use core::pin::Pin;
use core::task::Context;
use core::task::Poll;

use loom::sync::Mutex;
use loom::sync::MutexGuard;

use crate::traits::*;


// Host memory, for queues created with with_size
pub(crate) use std::alloc::alloc;
pub(crate) use std::alloc::dealloc;


// Time primitives, milliseconds from an arbitrary epoch
#[allow(non_camel_case_types)] pub type utick = u32;
#[allow(non_camel_case_types)] pub type itick = i32;

/// Model-checking clock, time never advances
#[derive(Debug)]
pub struct SysClock {
    origin: utick,
}

impl SysClock {
    pub(crate) fn with_origin(origin: utick) -> Self {
        Self { origin: origin }
    }
}

impl Clock for SysClock {
    fn now(&self) -> utick {
        self.origin
    }
}


/// Model-checking semaphore, every wait is a spurious wakeup
#[derive(Debug)]
pub struct SysSema;

impl SysSema {
    pub(crate) fn new() -> Self {
        SysSema
    }
}

impl Signal for SysSema {
    fn signal(&self) {}
}

impl Sema for SysSema {
    fn wait(&self, _timeout: Option<utick>) {
        loom::thread::yield_now();
    }
}

#[derive(Debug)]
pub struct SysSemaWait;

impl Future for SysSemaWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(())
    }
}

impl AsyncSema for SysSema {
    type AsyncWait = SysSemaWait;

    fn wait_async(&self, _timeout: Option<utick>) -> Self::AsyncWait {
        SysSemaWait
    }
}


/// Queue lock on loom's mutex
#[derive(Debug)]
pub struct SysLock(Mutex<()>);

impl SysLock {
    pub(crate) fn new() -> Self {
        SysLock(Mutex::new(()))
    }
}

impl Lock for SysLock {
    // same lifetime-strip as sys/std.rs
    type Guard = MutexGuard<'static, ()>;

    fn lock(&self) -> Self::Guard {
        let guard = self.0.lock().unwrap();
        unsafe { transmute::<MutexGuard<'_, ()>, _>(guard) }
    }
}
