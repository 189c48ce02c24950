// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-side USB DFU (1.0/1.1) and DfuSe firmware upgrade library, backing
//! the `dfu-util-rs` CLI.
//!
//! Module layout is leaf-first: USB newtypes and quirks sit at the bottom,
//! the descriptor walker and matcher build `DfuInterface`s out of them, the
//! protocol engine and DfuSe engine drive a claimed interface, and the
//! driver composes all of it into the four user-visible operations.

pub mod clock;
pub mod descriptor;
pub mod dfuse;
pub mod driver;
pub mod engine;
pub mod error;
pub mod file;
pub mod matcher;
pub mod memory_layout;
pub mod progress;
pub mod quirks;
pub mod status;
pub mod transport;
pub mod usb;
