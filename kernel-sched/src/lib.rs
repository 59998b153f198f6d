//! # Cooperative Scheduling and Blocking Disk I/O
//!
//! A single-CPU, non-preemptive thread scheduler and the disk driver that
//! integrates with it. A thread runs until it yields — explicitly, or inside
//! a disk wait. Nothing here interrupts anybody.
//!
//! ## Ready queue and disk priority
//!
//! The scheduler keeps one FIFO of runnable threads. A registered
//! [`BlockingDisk`] adds a second, device-local FIFO of threads parked on
//! unfinished I/O; on every yield, a parked thread whose device has become
//! ready is dispatched **before** the general ready queue. That way a thread
//! that slept through its I/O completion gets the CPU as soon as possible,
//! and the disk does not sit idle holding a finished request.
//!
//! ## Seams
//!
//! - [`Dispatcher`] is the context-switch primitive: who runs now, and the
//!   register-window save/resume when control is handed over. Tests record
//!   dispatch order instead of switching stacks.
//! - [`DiskController`] is the device: issue an operation, poll readiness,
//!   move PIO words. [`AtaPio`] (behind the `asm` feature) drives the
//!   primary ATA channel; tests script readiness.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod disk;
mod scheduler;
mod thread;

pub use disk::{BLOCK_SIZE, BlockingDisk, DiskController, DiskOp};
pub use scheduler::{IoWaiter, Scheduler};
pub use thread::{Dispatcher, Thread, ThreadId};

#[cfg(feature = "asm")]
pub use disk::AtaPio;
