use alloc::collections::VecDeque;
use log::debug;
use spin::Mutex;

use crate::scheduler::{IoWaiter, Scheduler};
use crate::thread::{Dispatcher, Thread};

/// Bytes per disk block; transfers move `BLOCK_SIZE / 2` PIO words.
pub const BLOCK_SIZE: usize = 512;

/// Operation selector for [`DiskController::issue`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskOp {
    Read,
    Write,
}

/// The physical disk controller.
///
/// One outstanding operation at a time: [`issue`](Self::issue) programs it,
/// [`is_ready`](Self::is_ready) polls for completion of the command phase,
/// and the word accessors move the data once ready. Methods take `&self`;
/// port I/O has no state worth `&mut`.
pub trait DiskController {
    /// Program the controller for `op` on `block`.
    fn issue(&self, op: DiskOp, block: u32);

    /// `true` when the controller is ready to transfer data.
    fn is_ready(&self) -> bool;

    /// Pull one data word (read operations, controller ready).
    fn read_word(&self) -> u16;

    /// Push one data word (write operations, controller ready).
    fn write_word(&self, word: u16);
}

/// A disk that parks threads instead of spinning.
///
/// While an issued operation is in flight, the calling thread enqueues
/// itself on the device-local waiter queue and yields; the scheduler
/// dispatches it again once [`IoWaiter::take_ready_waiter`] sees the
/// controller ready. Only the waiting blocks — the PIO transfer itself is
/// synchronous.
pub struct BlockingDisk<C: DiskController> {
    controller: C,
    waiters: Mutex<VecDeque<Thread>>,
}

impl<C: DiskController> BlockingDisk<C> {
    #[must_use]
    pub fn new(controller: C) -> Self {
        debug!("constructed blocking disk");
        Self { controller, waiters: Mutex::new(VecDeque::new()) }
    }

    /// Delegated controller status poll.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.controller.is_ready()
    }

    /// Number of threads parked on this device.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Park the current thread and yield if the controller is not ready.
    ///
    /// One check, one yield: when control comes back, the caller re-checks
    /// readiness and parks again if the operation is still in flight.
    pub fn wait_until_ready<D: Dispatcher>(&self, sched: &mut Scheduler<'_, D>) {
        if self.controller.is_ready() {
            return;
        }
        let current = sched.current_thread();
        self.waiters.lock().push_back(current);
        debug!("{current} parked on disk");
        sched.yield_now();
    }

    /// Read `block` into `buf`, blocking cooperatively until the controller
    /// has the data.
    pub fn read<D: Dispatcher>(
        &self,
        sched: &mut Scheduler<'_, D>,
        block: u32,
        buf: &mut [u8; BLOCK_SIZE],
    ) {
        self.controller.issue(DiskOp::Read, block);
        while !self.controller.is_ready() {
            self.wait_until_ready(sched);
        }
        for chunk in buf.chunks_exact_mut(2) {
            let word = self.controller.read_word();
            chunk[0] = word as u8;
            chunk[1] = (word >> 8) as u8;
        }
    }

    /// Write `buf` to `block`, blocking cooperatively until the controller
    /// accepts data.
    pub fn write<D: Dispatcher>(
        &self,
        sched: &mut Scheduler<'_, D>,
        block: u32,
        buf: &[u8; BLOCK_SIZE],
    ) {
        self.controller.issue(DiskOp::Write, block);
        while !self.controller.is_ready() {
            self.wait_until_ready(sched);
        }
        for chunk in buf.chunks_exact(2) {
            self.controller.write_word(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
    }
}

impl<C: DiskController> IoWaiter for BlockingDisk<C> {
    fn take_ready_waiter(&self) -> Option<Thread> {
        if !self.controller.is_ready() {
            return None;
        }
        self.waiters.lock().pop_front()
    }
}

#[cfg(feature = "asm")]
pub use ata::AtaPio;

#[cfg(feature = "asm")]
mod ata {
    use super::{DiskController, DiskOp};
    use kernel_registers::port::{inb, inw, outb, outw};

    bitflags::bitflags! {
        /// ATA status register bits.
        #[derive(Copy, Clone)]
        struct Status: u8 {
            const ERR = 1 << 0;
            const DRQ = 1 << 3;
            const DRDY = 1 << 6;
            const BSY = 1 << 7;
        }
    }

    const CMD_READ_SECTORS: u8 = 0x20;
    const CMD_WRITE_SECTORS: u8 = 0x30;

    /// The primary ATA channel, master drive, driven by LBA28 PIO.
    pub struct AtaPio {
        base: u16,
    }

    impl AtaPio {
        /// Controller on the standard primary channel ports `0x1F0..=0x1F7`.
        pub const PRIMARY: Self = Self { base: 0x1F0 };

        fn status(&self) -> Status {
            // SAFETY: status reads have no transfer side effects.
            Status::from_bits_truncate(unsafe { inb(self.base + 7) })
        }
    }

    impl DiskController for AtaPio {
        fn issue(&self, op: DiskOp, block: u32) {
            // SAFETY: the register sequence is the LBA28 command protocol;
            // callers serialize operations through the blocking disk.
            unsafe {
                outb(self.base + 6, 0xE0 | ((block >> 24) & 0x0F) as u8);
                outb(self.base + 2, 1); // one sector
                outb(self.base + 3, block as u8);
                outb(self.base + 4, (block >> 8) as u8);
                outb(self.base + 5, (block >> 16) as u8);
                let cmd = match op {
                    DiskOp::Read => CMD_READ_SECTORS,
                    DiskOp::Write => CMD_WRITE_SECTORS,
                };
                outb(self.base + 7, cmd);
            }
        }

        fn is_ready(&self) -> bool {
            self.status().contains(Status::DRQ)
        }

        fn read_word(&self) -> u16 {
            // SAFETY: only called with DRQ set during a read transfer.
            unsafe { inw(self.base) }
        }

        fn write_word(&self, word: u16) {
            // SAFETY: only called with DRQ set during a write transfer.
            unsafe { outw(self.base, word) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;
    use core::cell::{Cell, RefCell};

    struct RecordingDispatcher {
        current: RefCell<Thread>,
        dispatched: RefCell<Vec<ThreadId>>,
    }

    impl RecordingDispatcher {
        fn new(current: Thread) -> Self {
            Self { current: RefCell::new(current), dispatched: RefCell::new(Vec::new()) }
        }
    }

    impl Dispatcher for &RecordingDispatcher {
        fn current(&self) -> Thread {
            *self.current.borrow()
        }

        fn dispatch_to(&self, thread: Thread) {
            self.dispatched.borrow_mut().push(thread.id());
            *self.current.borrow_mut() = thread;
        }
    }

    /// Controller whose readiness flips after a scripted number of polls,
    /// with canned read data and captured writes.
    struct ScriptedController {
        issued: RefCell<Vec<(DiskOp, u32)>>,
        not_ready_polls: Cell<u32>,
        data: Cell<u16>,
        written: RefCell<Vec<u16>>,
    }

    impl ScriptedController {
        fn ready_after(polls: u32) -> Self {
            Self {
                issued: RefCell::new(Vec::new()),
                not_ready_polls: Cell::new(polls),
                data: Cell::new(0),
                written: RefCell::new(Vec::new()),
            }
        }
    }

    impl DiskController for &ScriptedController {
        fn issue(&self, op: DiskOp, block: u32) {
            self.issued.borrow_mut().push((op, block));
        }

        fn is_ready(&self) -> bool {
            let left = self.not_ready_polls.get();
            if left == 0 {
                return true;
            }
            self.not_ready_polls.set(left - 1);
            false
        }

        fn read_word(&self) -> u16 {
            let w = self.data.get();
            self.data.set(w.wrapping_add(1));
            w
        }

        fn write_word(&self, word: u16) {
            self.written.borrow_mut().push(word);
        }
    }

    fn t(id: u32) -> Thread {
        Thread::new(ThreadId(id))
    }

    #[test]
    fn ready_controller_reads_without_parking() {
        let ctrl = ScriptedController::ready_after(0);
        let disk = BlockingDisk::new(&ctrl);
        let disp = RecordingDispatcher::new(t(7));
        let mut sched = Scheduler::new(&disp);

        let mut buf = [0u8; BLOCK_SIZE];
        disk.read(&mut sched, 42, &mut buf);

        assert_eq!(*ctrl.issued.borrow(), vec![(DiskOp::Read, 42)]);
        assert_eq!(disk.queued(), 0);
        assert!(disp.dispatched.borrow().is_empty());

        // Words 0, 1, 2, … land little-endian.
        assert_eq!(&buf[..6], &[0, 0, 1, 0, 2, 0]);
        assert_eq!(buf[510], 255);
    }

    #[test]
    fn busy_controller_parks_the_reader_until_ready() {
        // Not ready for the read loop's first poll and the park's re-check;
        // ready from the third poll on.
        let ctrl = ScriptedController::ready_after(2);
        let disk = BlockingDisk::new(&ctrl);
        let disp = RecordingDispatcher::new(t(7));
        let mut sched = Scheduler::new(&disp);
        sched.add(t(1));

        let mut buf = [0u8; BLOCK_SIZE];
        disk.read(&mut sched, 3, &mut buf);

        // The reader parked once and the yield dispatched the other thread.
        assert_eq!(*disp.dispatched.borrow(), vec![ThreadId(1)]);
        // In a real switch the reader would resume via the waiter queue;
        // here the call simply continues once the controller turns ready.
        assert_eq!(disk.queued(), 1);
        assert_eq!(disk.waiters.lock().front().copied(), Some(t(7)));
    }

    #[test]
    fn writes_push_the_buffer_as_words() {
        let ctrl = ScriptedController::ready_after(0);
        let disk = BlockingDisk::new(&ctrl);
        let disp = RecordingDispatcher::new(t(7));
        let mut sched = Scheduler::new(&disp);

        let mut buf = [0u8; BLOCK_SIZE];
        buf[0] = 0x34;
        buf[1] = 0x12;
        buf[510] = 0xCD;
        buf[511] = 0xAB;
        disk.write(&mut sched, 9, &buf);

        assert_eq!(*ctrl.issued.borrow(), vec![(DiskOp::Write, 9)]);
        let written = ctrl.written.borrow();
        assert_eq!(written.len(), BLOCK_SIZE / 2);
        assert_eq!(written[0], 0x1234);
        assert_eq!(written[255], 0xABCD);
    }

    #[test]
    fn scheduler_prefers_a_ready_disk_waiter() {
        let ctrl = ScriptedController::ready_after(1);
        let disk = BlockingDisk::new(&ctrl);
        let disp = RecordingDispatcher::new(t(3));
        let mut sched = Scheduler::new(&disp);

        // Park the current thread while the controller is busy; the yield
        // finds nothing runnable and returns.
        disk.wait_until_ready(&mut sched);
        assert_eq!(disk.queued(), 1);

        sched.attach_io_waiter(&disk);
        sched.add(t(1));
        sched.add(t(2));

        // Controller is ready now: the parked thread goes first, then the
        // ready queue drains in order.
        sched.yield_now();
        sched.yield_now();
        sched.yield_now();
        assert_eq!(*disp.dispatched.borrow(), vec![ThreadId(3), ThreadId(1), ThreadId(2)]);
        assert_eq!(disk.queued(), 0);
    }
}
