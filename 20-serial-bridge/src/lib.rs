//! Bridges one TCP client at a time to a serial-attached device.
//!
//! Bytes are relayed verbatim in both directions; there is no framing.
//!
//! - [`cli`] parses the `serve` and `client` command lines.
//! - [`config`] holds listen, device and queue settings.
//! - [`bridge`] accepts connections and asks the hub to admit them.
//! - [`hub`] owns the live session set: admission, removal and fan-out of
//!   device data, all serialized through one task.
//! - [`session`] runs the per-client receive and send loops.
//! - [`device`] opens the serial port and runs its reader and writer threads.
//! - [`client`] is a small terminal client for manual testing.

pub mod bridge;
pub mod cli;
pub mod client;
pub mod config;
pub mod device;
pub mod hub;
pub mod session;
