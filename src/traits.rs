
use core::fmt::Debug;
use core::future::Future;

use crate::sys::utick;


//// post traits ////

/// Post trait, how events actually execute
///
/// Blanket-implemented for closures, so most callers never see this.
pub trait Post {
    fn post(&mut self);
}

impl<F: FnMut()> Post for F {
    fn post(&mut self) {
        self()
    }
}


//// system level traits ////

/// Some way to get the time, for some definition of time
///
/// Ticks are milliseconds from an arbitrary epoch and wrap, the queue
/// never compares them directly.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> utick;
}

/// Common signal trait for semaphores, this is separate since we
/// need a single signal function for both Sema and AsyncSema
///
/// Signals must be safe to send from interrupt contexts and from inside
/// a held Lock.
pub trait Signal: Send + Sync + Debug {
    fn signal(&self);
}

/// Binary semaphore, aka a waiting/signalling primitive
///
/// Signals are coalescing, multiple signals with no waiter behave like
/// one, but a signal must persist until the next wait. Spurious wakeups
/// have no negative effects, the queue rechecks its state after every
/// wait.
pub trait Sema: Signal {
    /// Wait until signalled or until timeout ms pass, forever if None
    fn wait(&self, timeout: Option<utick>);
}

/// An asynchronous binary semaphore, for waiting asynchronously
pub trait AsyncSema: Signal {
    type AsyncWait: Future<Output=()>;

    fn wait_async(&self, timeout: Option<utick>) -> Self::AsyncWait;
}

/// Locking primitive
///
/// This protects all queue state. On a hosted system this is a plain
/// mutex, on bare-metal it is save-and-mask of the interrupt priority
/// mask. The queue never suspends and never recurses while holding it.
pub trait Lock: Send + Sync + Debug {
    type Guard;
    fn lock(&self) -> Self::Guard;
}
