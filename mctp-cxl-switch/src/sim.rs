// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! In-memory bus for driving a switch without hardware
//!
//! [`SimBus`] records the operations a switch performs as bus master.
//! [`Requester`] builds request frames the way a bus owner would, and
//! checks replies.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use mctp::{Eid, Error, MsgType, Result, Tag, TagValue};

use crate::i2c::{I2cBus, I2cEvent, MctpI2cSwitch};
use crate::proto::{self, MctpHeader, MctpI2cEncap, MCTP_I2C_MAXMTU};
use crate::responder::TxStatus;

/// A bus operation performed by the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    RequestMaster,
    StartSend(u8),
    Send(u8),
    EndTransfer,
    Release,
}

/// Records bus operations.
#[derive(Debug, Default)]
pub struct SimBus {
    pub ops: Vec<BusOp>,
    /// Fail the address phase of every write
    pub nack_address: bool,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the last write, starting with the address byte.
    pub fn transmitted(&self) -> Option<Vec<u8>> {
        let start = self
            .ops
            .iter()
            .rposition(|o| matches!(o, BusOp::StartSend(_)))?;
        let mut out = Vec::new();
        for op in &self.ops[start..] {
            match op {
                BusOp::StartSend(a) => out.push(proto::write_addr(*a)),
                BusOp::Send(b) => out.push(*b),
                BusOp::EndTransfer => return Some(out),
                _ => (),
            }
        }
        // Transfer not ended
        None
    }

    /// Whether the last operation gave up the bus.
    pub fn released(&self) -> bool {
        self.ops.last() == Some(&BusOp::Release)
    }
}

impl I2cBus for SimBus {
    fn request_master(&mut self) {
        self.ops.push(BusOp::RequestMaster);
    }

    fn start_send_async(&mut self, addr: u8) -> Result<()> {
        self.ops.push(BusOp::StartSend(addr));
        if self.nack_address {
            return Err(Error::TxFailure);
        }
        Ok(())
    }

    fn send_async(&mut self, b: u8) -> Result<()> {
        self.ops.push(BusOp::Send(b));
        Ok(())
    }

    fn end_transfer(&mut self) {
        self.ops.push(BusOp::EndTransfer);
    }

    fn release(&mut self) {
        self.ops.push(BusOp::Release);
    }
}

/// Runs a complete transaction against `switch`.
///
/// `frame` starts with the address byte. Returns the reply transaction,
/// starting with its address byte, if one was sent.
pub fn transact(
    switch: &mut MctpI2cSwitch,
    bus: &mut SimBus,
    frame: &[u8],
) -> Option<Vec<u8>> {
    let (addr, rest) = frame.split_first()?;
    if addr >> 1 != switch.addr() {
        debug!("No target at {:#04x}", addr >> 1);
        return None;
    }

    switch.event(I2cEvent::StartSend, bus);
    for b in rest {
        switch.write(*b);
    }
    let before = bus.ops.len();
    switch.event(I2cEvent::Finish, bus);
    if !bus.ops[before..].contains(&BusOp::RequestMaster) {
        return None;
    }

    let start = bus.ops.len();
    // One step per byte, plus dispatch and stop. Bounded in case of a
    // misbehaving responder.
    for _ in 0..crate::config::SEND_BUF + 4 {
        match switch.bottom_half(bus) {
            TxStatus::Pending => continue,
            TxStatus::Complete => break,
            TxStatus::Aborted | TxStatus::Idle => return None,
        }
    }
    if !bus.ops[start..].iter().any(|o| matches!(o, BusOp::StartSend(_))) {
        return None;
    }
    bus.transmitted()
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// 7-bit I2C address of the responder
    pub source_addr: u8,
    pub header: MctpHeader,
    pub msg_type: MsgType,
    /// Message body following the type byte
    pub body: Vec<u8>,
}

/// Builds requests as a bus owner.
#[derive(Debug)]
pub struct Requester {
    encap: MctpI2cEncap,
    eid: Eid,
    instance_id: u8,
    tag: u8,
}

impl Requester {
    pub fn new(own_addr: u8, eid: Eid) -> Self {
        Self {
            encap: MctpI2cEncap::new(own_addr),
            eid,
            instance_id: 0,
            tag: 0,
        }
    }

    pub fn addr(&self) -> u8 {
        self.encap.own_addr()
    }

    fn frame(&self, i2c_dest: u8, dest: Eid, typ: MsgType, msg: &[u8]) -> Vec<u8> {
        let header = MctpHeader {
            dest,
            src: self.eid,
            som: true,
            eom: true,
            seq: 0,
            tag: Tag::Owned(TagValue(0)),
        };
        let mut packet = header.encode().to_vec();
        packet.push(typ.0);
        packet.extend_from_slice(msg);
        self.raw(i2c_dest, &packet)
    }

    /// Wraps an arbitrary MCTP packet in a transaction with PEC.
    ///
    /// Packets too long for a single transaction are truncated.
    pub fn raw(&self, i2c_dest: u8, packet: &[u8]) -> Vec<u8> {
        let packet = &packet[..packet.len().min(MCTP_I2C_MAXMTU)];
        let mut out = vec![0u8; packet.len() + proto::MCTP_I2C_HEADER + 1];
        let len = match self.encap.encode(i2c_dest, packet, &mut out, true) {
            Ok(o) => o.len(),
            Err(_) => 0,
        };
        out.truncate(len);
        out
    }

    /// A control request. Instance IDs increment per request.
    pub fn control(&mut self, i2c_dest: u8, dest: Eid, command: u8, body: &[u8]) -> Vec<u8> {
        let mut msg = vec![0x80 | self.instance_id, command];
        msg.extend_from_slice(body);
        self.instance_id = (self.instance_id + 1) & 0x1f;
        self.frame(i2c_dest, dest, mctp::MCTP_TYPE_CONTROL, &msg)
    }

    /// An FM-API request. Message tags increment per request.
    pub fn fmapi(
        &mut self,
        i2c_dest: u8,
        dest: Eid,
        command_set: u8,
        command: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let [l0, l1, l2, _] = (payload.len() as u32).to_le_bytes();
        let mut msg = vec![
            0x00, self.tag, 0x00, command, command_set, l0, l1, l2, 0, 0, 0, 0,
        ];
        msg.extend_from_slice(payload);
        self.tag = self.tag.wrapping_add(1);
        self.frame(i2c_dest, dest, mctp::MCTP_TYPE_CXL_FM, &msg)
    }

    /// Checks and decodes a reply addressed to this requester.
    pub fn decode_reply(&self, reply: &[u8]) -> Result<Reply> {
        let (dest, _) = reply.split_first().ok_or(Error::InvalidInput)?;
        if dest >> 1 != self.addr() {
            return Err(Error::InvalidInput);
        }
        let (packet, source_addr) = self.encap.decode(reply, true)?;
        let header = MctpHeader::decode(packet)?;
        let (typ, rest) = packet[MctpHeader::LEN..]
            .split_first()
            .ok_or(Error::InvalidInput)?;
        let (msg_type, _ic) = proto::decode_type_ic(*typ);
        Ok(Reply {
            source_addr,
            header,
            msg_type,
            body: rest.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchConfig;

    #[test]
    fn control_frame() {
        let mut rq = Requester::new(0x10, Eid(8));
        let f = rq.control(0x4d, Eid(0), 0x02, &[]);
        assert_eq!(
            &f[..11],
            &[0x9a, 0x0f, 0x08, 0x21, 0x01, 0x00, 0x08, 0xc8, 0x00, 0x80, 0x02]
        );
        assert_eq!(f.len(), 12);
        assert_eq!(f[11], crate::pec::pec(&f[..11]));

        let f = rq.control(0x4d, Eid(0), 0x02, &[]);
        assert_eq!(f[9], 0x81);
    }

    #[test]
    fn no_target() {
        let mut sw = MctpI2cSwitch::new(SwitchConfig::new(0x4d)).unwrap();
        let mut bus = SimBus::new();
        let mut rq = Requester::new(0x10, Eid(8));
        let f = rq.control(0x4e, Eid(0), 0x02, &[]);
        assert!(transact(&mut sw, &mut bus, &f).is_none());
        assert!(bus.ops.is_empty());
    }

    #[test]
    fn roundtrip() {
        let mut sw = MctpI2cSwitch::new(SwitchConfig::new(0x4d)).unwrap();
        let mut bus = SimBus::new();
        let mut rq = Requester::new(0x10, Eid(8));
        let f = rq.control(0x4d, Eid(0), 0x02, &[]);
        let reply = transact(&mut sw, &mut bus, &f).unwrap();
        assert!(bus.released());
        let r = rq.decode_reply(&reply).unwrap();
        assert_eq!(r.source_addr, 0x4d);
        assert_eq!(r.body, [0x00, 0x02, 0x00, 0x00, 0x00, 0x00]);

        // Reply to someone else
        let other = Requester::new(0x11, Eid(9));
        other.decode_reply(&reply).unwrap_err();
    }
}
