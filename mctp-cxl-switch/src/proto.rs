// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2024-2025 Code Construct
 */

//! MCTP over SMBus/I2C framing, DSP0237
//!
//! A complete bus transaction is laid out as
//!
//! ```text
//! dest_addr<<1 | 0x0f | byte count | src_addr<<1|1 | MCTP header (4) | type | body | PEC
//! ```
//!
//! The byte count covers the source address through the end of the MCTP
//! body. A target never sees the leading address byte, it is consumed by
//! the bus, though it is included in the PEC.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use mctp::{Eid, Error, Result, Tag, TagValue, MCTP_HEADER_VERSION_1};

use crate::pec;

/// SMBus command code for MCTP
pub const MCTP_I2C_COMMAND_CODE: u8 = 0x0f;

/// Destination address, command code, byte count, source address
pub const MCTP_I2C_HEADER: usize = 4;

// bytecount is limited to u8, includes MCTP payload + 1 byte i2c source
pub const MCTP_I2C_MAXMTU: usize = u8::MAX as usize - 1;

pub(crate) const HEADER_LEN: usize = 4;

const MCTP_IC_MASK: u8 = 0x80;

type Header = libmctp::base_packet::MCTPTransportHeader<[u8; HEADER_LEN]>;

pub(crate) type MctpI2cHeader =
    libmctp::smbus_proto::MCTPSMBusHeader<[u8; MCTP_I2C_HEADER]>;

/// Byte offsets as seen by an I2C target, relative to the command code.
pub mod offset {
    pub const COMMAND_CODE: usize = 0;
    pub const BYTE_COUNT: usize = 1;
    pub const SOURCE_ADDR: usize = 2;
    pub const HEADER_VERSION: usize = 3;
    pub const DEST_EID: usize = 4;
    pub const SOURCE_EID: usize = 5;
    pub const FLAGS: usize = 6;
    pub const MSG_TYPE: usize = 7;
    /// First byte of the message body following the type byte
    pub const BODY: usize = 8;
}

/// Address byte for a write to a 7-bit I2C address
pub fn write_addr(addr: u8) -> u8 {
    addr << 1
}

/// SMBus header for an MCTP packet of `len` bytes, from `own_addr` to
/// `i2c_dest`.
pub fn i2c_header(i2c_dest: u8, own_addr: u8, len: usize) -> [u8; MCTP_I2C_HEADER] {
    let mut header = MctpI2cHeader::new();
    header.set_dest_slave_addr(i2c_dest);
    header.set_source_slave_addr(own_addr);
    header.set_source_read_write(1);
    header.set_command_code(MCTP_I2C_COMMAND_CODE);
    // Include i2c source address byte in bytecount. No PEC.
    header.set_byte_count((len + 1) as u8);
    header.0
}

/// Decode message type and IC bit
pub fn decode_type_ic(b: u8) -> (mctp::MsgType, bool) {
    (mctp::MsgType(b & !MCTP_IC_MASK), b & MCTP_IC_MASK != 0)
}

/// MCTP packet header.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct MctpHeader {
    pub dest: Eid,
    pub src: Eid,
    pub som: bool,
    pub eom: bool,
    pub seq: u8,
    pub tag: Tag,
}

impl Default for MctpHeader {
    fn default() -> Self {
        Self {
            dest: mctp::MCTP_ADDR_NULL,
            src: mctp::MCTP_ADDR_NULL,
            som: false,
            eom: false,
            seq: 0,
            tag: Tag::Unowned(TagValue(0)),
        }
    }
}

impl MctpHeader {
    pub const LEN: usize = HEADER_LEN;

    fn from_transport(header: &Header) -> Self {
        let tv = TagValue(header.msg_tag());
        let tag = if header.to() == 1 {
            Tag::Owned(tv)
        } else {
            Tag::Unowned(tv)
        };
        Self {
            dest: Eid(header.dest_endpoint_id()),
            src: Eid(header.source_endpoint_id()),
            som: header.som() == 1,
            eom: header.eom() == 1,
            seq: header.pkt_seq(),
            tag,
        }
    }

    /// Interprets header bytes as received, without checking the version.
    pub fn from_bytes(hd: [u8; HEADER_LEN]) -> Self {
        Self::from_transport(&libmctp::base_packet::MCTPTransportHeader(hd))
    }

    /// Decode header from a packet.
    ///
    /// Source and destination EIDs are not checked for validity.
    pub fn decode(packet: &[u8]) -> Result<Self> {
        let Some(hd) = packet.get(..HEADER_LEN) else {
            warn!("bad len {:?}", packet);
            return Err(Error::InvalidInput);
        };
        let hd: [u8; HEADER_LEN] = hd.try_into().map_err(|_| Error::InvalidInput)?;

        let header = Header::new_from_buf(hd, MCTP_HEADER_VERSION_1).map_err(|_e| {
            trace!("bad header");
            Error::InvalidInput
        })?;

        if header.hdr_version() != MCTP_HEADER_VERSION_1 {
            trace!("Bad MCTP version {:#04x}", header.hdr_version());
            return Err(Error::InvalidInput);
        }

        Ok(Self::from_transport(&header))
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let (to, tv) = match self.tag {
            Tag::Owned(tv) => (true, tv),
            Tag::Unowned(tv) => (false, tv),
        };
        let mut header = Header::new(MCTP_HEADER_VERSION_1);
        header.set_dest_endpoint_id(self.dest.0);
        header.set_source_endpoint_id(self.src.0);
        header.set_som(self.som as u8);
        header.set_eom(self.eom as u8);
        header.set_pkt_seq(self.seq & mctp::MCTP_SEQ_MASK);
        header.set_to(to as u8);
        header.set_msg_tag(tv.0 & mctp::MCTP_TAG_MAX);
        header.0
    }

    /// Header for a single-packet response to this request.
    pub fn response(&self, own_eid: Eid) -> Self {
        let tv = match self.tag {
            Tag::Owned(tv) | Tag::Unowned(tv) => tv,
        };
        Self {
            dest: self.src,
            src: own_eid,
            som: true,
            eom: true,
            seq: 0,
            tag: Tag::Unowned(tv),
        }
    }
}

/// Simple packet processing to add/remove the MCTP-I2C header and PEC.
///
/// Used by bus owners talking to the switch, and for checking replies.
#[derive(Debug, Clone)]
pub struct MctpI2cEncap {
    own_addr: u8,
}

impl MctpI2cEncap {
    pub fn new(own_addr: u8) -> Self {
        Self { own_addr }
    }

    pub fn own_addr(&self) -> u8 {
        self.own_addr
    }

    /// Decodes a transaction starting with the destination address byte.
    ///
    /// Returns the MCTP packet and the 7-bit I2C source address.
    pub fn decode<'f>(&self, mut packet: &'f [u8], pec: bool)
    -> Result<(&'f [u8], u8)> {
        if pec {
            // Remove the pec byte, check it.
            let Some((packet_pec, rest)) = packet.split_last() else {
                return Err(Error::InvalidInput);
            };
            packet = rest;
            let calc_pec = pec::pec(packet);
            if calc_pec != *packet_pec {
                trace!("Incorrect PEC");
                return Err(Error::InvalidInput);
            }
        }

        if packet.len() < MCTP_I2C_HEADER {
            return Err(Error::InvalidInput);
        }

        let (i2c, packet) = packet.split_at(MCTP_I2C_HEADER);
        let i2c: [u8; MCTP_I2C_HEADER] = i2c.try_into().map_err(|_| Error::InvalidInput)?;
        let header = MctpI2cHeader::new_from_buf(i2c);
        // +1 for i2c source address field
        if header.byte_count() as usize != packet.len() + 1 {
            return Err(Error::InvalidInput);
        }

        if header.command_code() != MCTP_I2C_COMMAND_CODE {
            return Err(Error::InvalidInput);
        }
        Ok((packet, header.source_slave_addr()))
    }

    /// Writes a complete transaction to `out`, returning the used portion.
    pub fn encode<'f>(&self, i2c_dest: u8, inp: &[u8], out: &'f mut [u8], pec: bool)
        -> Result<&'f mut [u8]> {

        let pec_extra = pec as usize;
        let out_len = MCTP_I2C_HEADER + inp.len() + pec_extra;
        if out.len() < out_len {
            return Err(Error::NoSpace);
        }
        if inp.len() > MCTP_I2C_MAXMTU {
            return Err(Error::BadArgument);
        }

        let (i2chead, packet) = out.split_at_mut(MCTP_I2C_HEADER);
        i2chead.copy_from_slice(&i2c_header(i2c_dest, self.own_addr, inp.len()));
        packet[..inp.len()].copy_from_slice(inp);

        if pec {
            let pec_content = &out[..MCTP_I2C_HEADER + inp.len()];
            out[MCTP_I2C_HEADER + inp.len()] = pec::pec(pec_content);
        }
        Ok(&mut out[..out_len])
    }
}
