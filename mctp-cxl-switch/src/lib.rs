// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! CXL Switch Fabric Management endpoint over MCTP
//!
//! This crate emulates the management endpoint of a CXL switch, attached to
//! an I2C bus using the MCTP SMBus/I2C transport binding (DSP0237). It
//! responds to a subset of MCTP Control messages, and the CXL Fabric
//! Manager API Physical Switch command set.
//!
//! A host bus model feeds bytes and transaction events to a
//! [`MctpI2cSwitch`], and provides bus mastership through the [`I2cBus`]
//! trait so that replies can be sent.

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![forbid(unsafe_code)]

pub mod config;
pub mod control;
pub mod fmapi;
pub mod i2c;
pub mod pec;
pub mod proto;
pub mod receive;
pub mod responder;
pub mod topology;

#[cfg(any(feature = "std", test))]
pub mod sim;

pub use config::{PecPolicy, SwitchConfig};
pub use i2c::{I2cBus, I2cEvent, MctpI2cSwitch};
pub use responder::TxStatus;
