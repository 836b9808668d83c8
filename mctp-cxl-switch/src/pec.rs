// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! SMBus Packet Error Code
//!
//! A CRC-8 with polynomial x^8 + x^2 + x + 1, computed over every byte of
//! a bus transaction including the address byte. Each transaction starts
//! from [`PEC_INIT`].

use crc::{Crc, CRC_8_SMBUS};

const SMBUS_PEC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Starting value for a transaction.
pub const PEC_INIT: u8 = 0;

/// Extends a running PEC value by one byte.
pub fn update_byte(pec: u8, b: u8) -> u8 {
    // No reflection and a zero seed, so a single table step is the
    // checksum of the one byte `pec ^ b`.
    SMBUS_PEC.checksum(&[pec ^ b])
}

/// Extends a running PEC value by a slice of bytes.
pub fn update(pec: u8, data: &[u8]) -> u8 {
    data.iter().fold(pec, |p, b| update_byte(p, *b))
}

/// Computes the PEC of a complete transaction.
pub fn pec(data: &[u8]) -> u8 {
    SMBUS_PEC.checksum(data)
}

/// Running PEC accumulator for one transaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pec(u8);

impl Pec {
    pub fn new() -> Self {
        Self(PEC_INIT)
    }

    pub fn push(&mut self, b: u8) {
        self.0 = update_byte(self.0, b);
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.0 = update(self.0, data);
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn check_value() {
        // Catalog check value for CRC-8/SMBUS
        assert_eq!(pec(b"123456789"), 0xf4);
        assert_eq!(update(PEC_INIT, b"123456789"), 0xf4);
        assert_eq!(pec(&[]), PEC_INIT);
    }

    #[test]
    fn accumulator() {
        let data = [0x20, 0x0f, 0x0a, 0x21, 0x01, 0x00, 0x09, 0xc8, 0x00, 0x85, 0x02];
        let mut p = Pec::new();
        let (a, b) = data.split_at(4);
        p.extend(a);
        for c in b {
            p.push(*c);
        }
        assert_eq!(p.value(), pec(&data));
    }

    proptest! {
        #[test]
        fn matches_smbus_pec(data in proptest::collection::vec(any::<u8>(), 0..300)) {
            prop_assert_eq!(pec(&data), smbus_pec::pec(&data));
            prop_assert_eq!(update(PEC_INIT, &data), smbus_pec::pec(&data));
        }

        #[test]
        fn split_anywhere(data in proptest::collection::vec(any::<u8>(), 1..64), split in 0usize..64) {
            let split = split.min(data.len());
            let (a, b) = data.split_at(split);
            prop_assert_eq!(update(update(PEC_INIT, a), b), pec(&data));
        }
    }
}
