//! Hardware-independent core library for powermeter-rs
//!
//! This crate holds the persistence and aggregation logic of the power monitor:
//! redundant A/B JSON resources that survive power loss mid-write, the persisted
//! running-average accumulator, the fixed-capacity trackers that downsample the
//! measured power into rolling histories, and the shared-state and task
//! primitives the measuring and tracking loops run on.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both embedded
//! targets and desktop hosts. The default `std` feature adds the filesystem
//! backend, wall clocks and thread-backed task spawning used on ESP-IDF and by
//! the simulator.

#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod app_state;
pub mod clock;
pub mod config;
pub mod error;
pub mod measurement;
pub mod sampling;
pub mod storage;
pub mod sync;
pub mod task;
pub mod tracker;

pub use error::{Error, Result, ResultExt};
