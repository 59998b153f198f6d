use alloc::collections::VecDeque;
use log::{debug, info};

use crate::thread::{Dispatcher, Thread};

/// A source of threads whose I/O has completed.
///
/// Implemented by [`BlockingDisk`](crate::BlockingDisk): yields the head of
/// its waiter queue, but only while the device reports ready. The trait
/// takes `&self` — the implementor guards its queue internally — so the
/// scheduler can hold the reference across yields.
pub trait IoWaiter {
    /// Dequeue a parked thread if the device is ready and one is waiting.
    fn take_ready_waiter(&self) -> Option<Thread>;
}

/// Cooperative FIFO scheduler.
///
/// Threads enter the ready queue through [`add`](Self::add) (new-thread
/// admission) or [`resume`](Self::resume) (explicit wake) — two names for
/// two call sites, one behavior. The running thread gives up the CPU only by
/// calling [`yield_now`](Self::yield_now).
pub struct Scheduler<'d, D: Dispatcher> {
    dispatcher: D,
    ready: VecDeque<Thread>,
    io: Option<&'d dyn IoWaiter>,
}

impl<'d, D: Dispatcher> Scheduler<'d, D> {
    #[must_use]
    pub fn new(dispatcher: D) -> Self {
        debug!("constructed scheduler");
        Self { dispatcher, ready: VecDeque::new(), io: None }
    }

    /// Register a blocking device whose waiters get dispatch priority.
    pub fn attach_io_waiter(&mut self, io: &'d dyn IoWaiter) {
        self.io = Some(io);
    }

    /// The thread currently executing, per the dispatcher.
    #[must_use]
    pub fn current_thread(&self) -> Thread {
        self.dispatcher.current()
    }

    /// Number of threads in the ready queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Give up the CPU.
    ///
    /// Dispatch order: a parked I/O waiter whose device is ready beats the
    /// ready queue; then the ready-queue head runs. With nothing runnable
    /// anywhere the call logs and returns to the caller, which may simply
    /// yield again.
    pub fn yield_now(&mut self) {
        if let Some(io) = self.io {
            if let Some(waiter) = io.take_ready_waiter() {
                self.dispatcher.dispatch_to(waiter);
                return;
            }
        }
        match self.ready.pop_front() {
            Some(next) => self.dispatcher.dispatch_to(next),
            None => info!("no runnable thread, yield returns to caller"),
        }
    }

    /// Admit a new thread to the back of the ready queue.
    pub fn add(&mut self, thread: Thread) {
        self.ready.push_back(thread);
    }

    /// Re-enqueue a woken thread at the back of the ready queue.
    pub fn resume(&mut self, thread: Thread) {
        self.ready.push_back(thread);
    }

    /// Remove every ready-queue entry carrying `thread`'s id.
    ///
    /// Other threads keep their relative order. This only forgets the
    /// thread; unwinding its stack and reclaiming its memory is the
    /// caller's business.
    pub fn terminate(&mut self, thread: Thread) {
        let before = self.ready.len();
        self.ready.retain(|t| t.id() != thread.id());
        debug!("terminated {thread}: removed {} queue entries", before - self.ready.len());
    }
}
