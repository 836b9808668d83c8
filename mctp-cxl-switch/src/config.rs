// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Endpoint configuration
//!
//! Buffer sizes are fixed at build time. They can be overridden with
//! environment variables when building, for example
//! `MCTP_CXL_SWITCH_SEND_BUF=512 cargo build`.
//!
//! Runtime settings for a switch instance are held in a [`SwitchConfig`].

use mctp::{Eid, Error, Result};
use uuid::Uuid;

/// Takes a `usize` from a build-time environment variable.
///
/// If unset, the default is used. Can be used in a const context.
macro_rules! get_build_var {
    ($name:literal, $default:expr) => {{
        match option_env!($name) {
            Some(v) => {
                let Ok(v) = usize::from_str_radix(v, 10) else {
                    // concat! because const format_args isn't stable
                    panic!(concat!(
                        "Bad value for environment variable ",
                        $name
                    ));
                };
                v
            }
            None => $default,
        }
    }};
}

/// Size of the reply buffer, covering I2C header through the final PEC.
///
/// The SMBus byte count is a `u8`, so replies never need more than 259 bytes.
pub const SEND_BUF: usize = get_build_var!("MCTP_CXL_SWITCH_SEND_BUF", 260);

/// Maximum number of supported message types reported by the control handler.
pub const MAX_MSG_TYPES: usize = get_build_var!("MCTP_CXL_SWITCH_MAX_MSG_TYPES", 4);

// Replies must fit a full MCTP packet plus address, command code, byte count and PEC.
const _: () = assert!(SEND_BUF >= 64);

/// Default 7-bit I2C address of the switch.
pub const DEFAULT_I2C_ADDR: u8 = 0x4d;

/// Default endpoint UUID.
pub const DEFAULT_UUID: Uuid =
    Uuid::from_u128(0xdf2bbeba_73c6_4e33_825c_9800158ac92e);

/// PCI vendor ID reported by Get Vendor Defined Message Support.
pub const DEFAULT_VENDOR_ID: u16 = 0x19e5;

/// Vendor specific field placed in FM-API response headers.
pub const DEFAULT_FMAPI_VENDOR_SPECIFIC: u16 = 0xbeef;

/// Handling of the requester's trailing Packet Error Code.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PecPolicy {
    /// Check and log, but respond regardless.
    #[default]
    Ignore,
    /// Drop requests with a missing or incorrect PEC.
    Enforce,
}

/// Settings for a [`MctpI2cSwitch`](crate::MctpI2cSwitch).
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Own 7-bit I2C address
    pub i2c_addr: u8,
    /// Initial endpoint ID. May be `MCTP_ADDR_NULL` until assigned by a bus owner.
    pub eid: Eid,
    pub pec: PecPolicy,
    /// Reject Set Endpoint ID requests for non-normal EIDs, and the Set
    /// Discovered operation. Otherwise any requested EID is assigned.
    pub strict_eid: bool,
    pub uuid: Uuid,
    pub vendor_id: u16,
    pub fmapi_vendor_specific: u16,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            i2c_addr: DEFAULT_I2C_ADDR,
            eid: mctp::MCTP_ADDR_NULL,
            pec: PecPolicy::default(),
            strict_eid: false,
            uuid: DEFAULT_UUID,
            vendor_id: DEFAULT_VENDOR_ID,
            fmapi_vendor_specific: DEFAULT_FMAPI_VENDOR_SPECIFIC,
        }
    }
}

impl SwitchConfig {
    pub fn new(i2c_addr: u8) -> Self {
        Self {
            i2c_addr,
            ..Default::default()
        }
    }

    /// Checks that settings are usable.
    ///
    /// The address must fit in 7 bits and the EID must be either
    /// null or a normal EID.
    pub fn validate(&self) -> Result<()> {
        if self.i2c_addr > 0x7f {
            return Err(Error::BadArgument);
        }
        if self.eid != mctp::MCTP_ADDR_NULL {
            Eid::new_normal(self.eid.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_valid() {
        SwitchConfig::default().validate().unwrap();
        SwitchConfig::new(0x10).validate().unwrap();
    }

    #[test]
    fn permissive_eid() {
        assert!(!SwitchConfig::default().strict_eid);
        assert!(!SwitchConfig::new(0x10).strict_eid);
    }

    #[test]
    fn bad_config() {
        SwitchConfig::new(0x80).validate().unwrap_err();

        let mut c = SwitchConfig::default();
        c.eid = Eid(0xff);
        c.validate().unwrap_err();
        c.eid = Eid(3);
        c.validate().unwrap_err();
        c.eid = Eid(8);
        c.validate().unwrap();
    }

    #[test]
    fn uuid_bytes() {
        assert_eq!(
            DEFAULT_UUID.as_bytes(),
            &[
                0xdf, 0x2b, 0xbe, 0xba, 0x73, 0xc6, 0x4e, 0x33, 0x82, 0x5c,
                0x98, 0x00, 0x15, 0x8a, 0xc9, 0x2e
            ]
        );
    }
}
