// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Reply transmission
//!
//! After a request completes the endpoint becomes bus master and writes its
//! reply to the requester, one byte per bottom half invocation.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use heapless::Vec;
use mctp::{Error, Result};

use crate::config::SEND_BUF;
use crate::i2c::I2cBus;
use crate::pec::Pec;
use crate::proto::{self, MCTP_I2C_MAXMTU};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    #[default]
    Idle,
    /// Waiting for the bus to dispatch a received request
    ProcessRequest,
    /// Reply prepared, address phase next
    StartSend,
    /// Sending bytes, one per acknowledge
    Ack,
}

/// Result of a bottom half step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// More bytes to send, call again once the bus acknowledges
    Pending,
    /// The transaction is over and the bus released
    Complete,
    /// A bus operation failed and the reply was abandoned
    Aborted,
    /// Nothing to do
    Idle,
}

/// Transmit side of the endpoint.
#[derive(Debug, Default)]
pub struct Responder {
    state: TxState,
    dest_addr: u8,
    /// Complete transaction, from the address byte. The PEC is appended
    /// once sent.
    buf: Vec<u8, SEND_BUF>,
    /// Length of `buf` before the PEC
    data_len: usize,
    /// Bytes of `buf` sent so far
    sent: usize,
    pec: Pec,
}

impl Responder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == TxState::Idle
    }

    /// Bytes transmitted in the current or most recent transaction,
    /// including the address byte.
    pub fn sent(&self) -> &[u8] {
        &self.buf[..self.sent]
    }

    /// A request is waiting for dispatch.
    pub fn begin(&mut self) {
        if !self.is_idle() {
            warn!("Responder busy in {:?}", self.state);
        }
        self.buf.clear();
        self.sent = 0;
        self.state = TxState::ProcessRequest;
    }

    /// Builds a reply to `dest_addr` from `parts`.
    ///
    /// `parts` are the MCTP packet contents, from the MCTP header onwards.
    pub fn prepare(&mut self, dest_addr: u8, own_addr: u8, parts: &[&[u8]]) -> Result<()> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        if len > MCTP_I2C_MAXMTU {
            return Err(Error::NoSpace);
        }

        self.buf.clear();
        self.sent = 0;
        let hdr = proto::i2c_header(dest_addr, own_addr, len);
        self.buf.extend_from_slice(&hdr).map_err(|_| Error::NoSpace)?;
        for p in parts {
            self.buf.extend_from_slice(p).map_err(|_| Error::NoSpace)?;
        }
        // Room for the PEC
        if self.buf.is_full() {
            return Err(Error::NoSpace);
        }

        self.data_len = self.buf.len();
        self.dest_addr = dest_addr;
        self.state = TxState::StartSend;
        trace!("reply to {dest_addr:#04x}, {} bytes", self.buf.len());
        Ok(())
    }

    /// Ends a transaction that has no reply.
    pub fn skip(&mut self, bus: &mut impl I2cBus) {
        debug!("No reply");
        bus.release();
        self.state = TxState::Idle;
    }

    fn abort(&mut self, bus: &mut impl I2cBus, e: Error) -> TxStatus {
        warn!("Reply to {:#04x} failed at byte {}: {e:?}", self.dest_addr, self.sent);
        bus.end_transfer();
        bus.release();
        self.state = TxState::Idle;
        TxStatus::Aborted
    }

    /// Advances transmission by one bus operation.
    pub fn step(&mut self, bus: &mut impl I2cBus) -> TxStatus {
        match self.state {
            TxState::Idle => {
                trace!("Bottom half while idle");
                TxStatus::Idle
            }
            TxState::ProcessRequest => {
                // Dispatch belongs to the device, nothing to send yet
                TxStatus::Pending
            }
            TxState::StartSend => {
                if let Err(e) = bus.start_send_async(self.dest_addr) {
                    return self.abort(bus, e);
                }
                self.pec = Pec::new();
                self.pec.push(self.buf[0]);
                self.sent = 1;
                self.state = TxState::Ack;
                TxStatus::Pending
            }
            TxState::Ack => {
                if let Some(&b) = self.buf.get(self.sent) {
                    if let Err(e) = bus.send_async(b) {
                        return self.abort(bus, e);
                    }
                    trace!("tx [{}] {b:#04x}", self.sent);
                    self.pec.push(b);
                    self.sent += 1;
                    if self.sent == self.data_len {
                        // PEC follows the last data byte. Space was
                        // checked in prepare().
                        let _ = self.buf.push(self.pec.value());
                    }
                    TxStatus::Pending
                } else {
                    bus.end_transfer();
                    bus.release();
                    self.state = TxState::Idle;
                    debug!("Reply sent, {} bytes", self.sent);
                    TxStatus::Complete
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pec;
    use crate::sim::{BusOp, SimBus};

    fn run(r: &mut Responder, bus: &mut SimBus) -> TxStatus {
        for _ in 0..SEND_BUF + 4 {
            let s = r.step(bus);
            if s != TxStatus::Pending {
                return s;
            }
        }
        panic!("reply didn't complete");
    }

    #[test]
    fn send_reply() {
        let mut r = Responder::new();
        let mut bus = SimBus::new();
        r.begin();
        assert_eq!(r.state(), TxState::ProcessRequest);
        r.prepare(0x10, 0x4d, &[&[1, 8, 0x20, 0xc0], &[0], &[5, 2], &[0, 0x20, 0, 0]])
            .unwrap();
        assert_eq!(run(&mut r, &mut bus), TxStatus::Complete);
        assert!(r.is_idle());

        let sent = r.sent();
        assert_eq!(&sent[..4], &[0x20, 0x0f, 0x0c, 0x9b]);
        assert_eq!(sent.len(), 4 + 11 + 1);
        let (p, data) = sent.split_last().unwrap();
        assert_eq!(*p, pec::pec(data));

        assert_eq!(bus.ops.first(), Some(&BusOp::StartSend(0x10)));
        assert_eq!(
            &bus.ops[bus.ops.len() - 2..],
            &[BusOp::EndTransfer, BusOp::Release]
        );
        assert_eq!(bus.transmitted().unwrap(), sent);
    }

    #[test]
    fn nack_address() {
        let mut r = Responder::new();
        let mut bus = SimBus::new();
        bus.nack_address = true;
        r.begin();
        r.prepare(0x10, 0x4d, &[&[1, 8, 0x20, 0xc0], &[0]]).unwrap();
        assert_eq!(run(&mut r, &mut bus), TxStatus::Aborted);
        assert!(r.is_idle());
        assert_eq!(bus.ops.last(), Some(&BusOp::Release));
    }

    #[test]
    fn too_large() {
        let mut r = Responder::new();
        let big = [0u8; MCTP_I2C_MAXMTU + 1];
        r.begin();
        r.prepare(0x10, 0x4d, &[&big]).unwrap_err();
    }

    #[test]
    fn skip_releases() {
        let mut r = Responder::new();
        let mut bus = SimBus::new();
        r.begin();
        r.skip(&mut bus);
        assert!(r.is_idle());
        assert_eq!(bus.ops, [BusOp::Release]);
        assert_eq!(r.step(&mut bus), TxStatus::Idle);
    }
}
