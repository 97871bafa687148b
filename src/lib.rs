//! deej-gw - host gateway between a serial slider device and OS audio sessions
//!
//! Slider lines from the device are decoded by `protocol`, carried by `link`,
//! and applied to live sessions found by `audio` through the `router`. The
//! `monitor` mirrors the master volume back to the device; `app` wires it all
//! together.

pub mod app;
pub mod audio;
pub mod config;
pub mod error;
pub mod link;
pub mod monitor;
pub mod protocol;
pub mod router;
pub mod session;
pub mod sniffer;
