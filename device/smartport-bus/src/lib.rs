#![cfg_attr(not(any(test, feature = "std")), no_std)]
//! Physical and link layer of an emulated SmartPort peripheral.
//!
//! The engine bit-bangs the bus lines through [`hal::BusPins`], paces every transfer with a
//! [`timer::DeadlineTimer`] over a free-running [`hal::Counter`], and hands addressed command
//! packets to the [`device::LogicalDevice`]s attached to the [`arbiter::BusArbiter`].

extern crate alloc;

pub mod arbiter;
pub mod chain;
pub mod config;
pub mod critical;
pub mod device;
pub mod hal;
pub mod link;
pub mod phase;
pub mod timer;
pub mod timing;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(feature = "bcm2835")]
pub mod board;

pub use arbiter::{BusArbiter, BusError, ServiceEvent};
pub use chain::{DaisyChain, DeviceClass, DeviceHandle};
pub use config::{BusConfig, TimerConfig};
pub use device::{Command, DeviceError, LogicalDevice, Transport};
pub use link::{LinkError, LinkLayer, Stage};
pub use phase::Phase;
