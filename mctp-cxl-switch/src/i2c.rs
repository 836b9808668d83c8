// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2024-2025 Code Construct
 */

//! CXL switch endpoint as an I2C target
//!
//! The host bus model drives a [`MctpI2cSwitch`] with transaction events and
//! written bytes. When a request is complete the switch asks for bus
//! mastership with [`I2cBus::request_master`], and the host then calls
//! [`MctpI2cSwitch::bottom_half`] until the reply has been sent.
//!
//! Event names follow the master's side of the transfer: a master sends
//! requests to the switch, and would receive from it on a read.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use deku::DekuContainerWrite;
use mctp::{Eid, Error, Result};

use crate::config::{SwitchConfig, SEND_BUF};
use crate::control::{self, MctpControl};
use crate::fmapi::{CciMessageHeader, PhysicalSwitch};
use crate::receive::{Receiver, Request, RequestBody};
use crate::responder::{Responder, TxState, TxStatus};
use crate::topology::SwitchTopology;

/// Transaction events delivered by the bus, seen from the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cEvent {
    /// A master is starting a write to this target
    StartSend,
    /// A master is starting a read from this target
    StartRecv,
    /// Stop condition
    Finish,
    /// The master did not acknowledge
    Nack,
}

/// Bus operations needed to send a reply as master.
pub trait I2cBus {
    /// Asks the bus to schedule the bottom half once it can be mastered.
    fn request_master(&mut self);

    /// Starts a write to `addr`. Fails if the address is not acknowledged.
    fn start_send_async(&mut self, addr: u8) -> Result<()>;

    /// Sends one byte of the current write.
    fn send_async(&mut self, b: u8) -> Result<()>;

    /// Generates a stop condition.
    fn end_transfer(&mut self);

    /// Gives up bus mastership.
    fn release(&mut self);
}

/// An emulated CXL switch Fabric Management endpoint on an I2C bus.
#[derive(Debug)]
pub struct MctpI2cSwitch {
    own_addr: u8,
    receiver: Receiver,
    pending: Option<Request>,
    control: MctpControl,
    fmapi: PhysicalSwitch,
    responder: Responder,
}

impl MctpI2cSwitch {
    pub fn new(config: SwitchConfig) -> Result<Self> {
        config.validate()?;

        let mut control = MctpControl::new(config.eid, config.uuid, config.vendor_id);
        control.set_message_types(&[mctp::MCTP_TYPE_CONTROL, mctp::MCTP_TYPE_CXL_FM])?;
        control.set_strict_eid(config.strict_eid);

        debug!("Switch at {:#04x}, EID {}", config.i2c_addr, config.eid);
        Ok(Self {
            own_addr: config.i2c_addr,
            receiver: Receiver::new(config.i2c_addr, config.pec),
            pending: None,
            control,
            fmapi: PhysicalSwitch::new(SwitchTopology::new(), config.fmapi_vendor_specific),
            responder: Responder::new(),
        })
    }

    /// Own 7-bit I2C address
    pub fn addr(&self) -> u8 {
        self.own_addr
    }

    pub fn eid(&self) -> Eid {
        self.control.eid()
    }

    pub fn topology(&self) -> &SwitchTopology {
        self.fmapi.topology()
    }

    pub fn tx_state(&self) -> TxState {
        self.responder.state()
    }

    /// Bytes of the most recent reply sent, from the address byte.
    pub fn last_sent(&self) -> &[u8] {
        self.responder.sent()
    }

    /// Handles a bus event.
    pub fn event(&mut self, event: I2cEvent, bus: &mut impl I2cBus) {
        trace!("event {event:?}");
        match event {
            I2cEvent::StartSend => self.receiver.start(),
            I2cEvent::StartRecv => {
                debug!("Read from switch, not supported");
                self.receiver.abort();
            }
            I2cEvent::Nack => {
                debug!("NACK at byte {}, resetting receive state", self.receiver.position());
                self.receiver.abort();
            }
            I2cEvent::Finish => {
                let Some(req) = self.receiver.finish() else {
                    return;
                };
                debug!("Type {} request from {:#04x}", req.body.msg_type(), req.source_addr);
                if !self.responder.is_idle() {
                    warn!("Request while replying, dropped");
                    return;
                }
                self.pending = Some(req);
                self.responder.begin();
                bus.request_master();
            }
        }
    }

    /// Receives a byte written by the master.
    pub fn write(&mut self, b: u8) {
        self.receiver.feed(b);
    }

    /// Reads as a target are not supported, returns 0.
    pub fn read(&mut self) -> u8 {
        trace!("read");
        0
    }

    /// Progresses the reply, called by the host with bus mastership.
    pub fn bottom_half(&mut self, bus: &mut impl I2cBus) -> TxStatus {
        if self.responder.state() != TxState::ProcessRequest {
            return self.responder.step(bus);
        }

        let Some(req) = self.pending.take() else {
            warn!("No pending request");
            self.responder.skip(bus);
            return TxStatus::Complete;
        };

        match self.process_request(&req) {
            Ok(true) => self.responder.step(bus),
            Ok(false) => {
                self.responder.skip(bus);
                TxStatus::Complete
            }
            Err(e) => {
                warn!("Reply to {:#04x} failed: {e:?}", req.source_addr);
                self.responder.skip(bus);
                TxStatus::Aborted
            }
        }
    }

    /// Dispatches a request and prepares any reply.
    ///
    /// Returns `false` when the request has no reply.
    fn process_request(&mut self, req: &Request) -> Result<bool> {
        let own_eid = self.control.eid();
        if req.header.dest != own_eid && req.header.dest != mctp::MCTP_ADDR_NULL {
            debug!("Request for EID {}, own EID {}", req.header.dest, own_eid);
        }

        let mut payload = [0u8; SEND_BUF];
        match &req.body {
            RequestBody::Control { header, request } => {
                debug!("Control {request:?} from {:#04x}", req.source_addr);
                let Some(len) = self.control.handle(request, &mut payload) else {
                    return Ok(false);
                };
                // Set Endpoint ID replies from the new EID
                let hdr = req.header.response(self.control.eid()).encode();
                let chdr = control::response_header(*header);
                self.responder.prepare(
                    req.source_addr,
                    self.own_addr,
                    &[&hdr, &[mctp::MCTP_TYPE_CONTROL.0], &chdr, &payload[..len]],
                )?;
            }
            RequestBody::FmApi { tag, request } => {
                debug!("FM-API {request:?} from {:#04x}", req.source_addr);
                let Some(len) = self.fmapi.handle(request, &mut payload) else {
                    return Ok(false);
                };
                let hdr = req.header.response(own_eid).encode();
                let mut cci = [0u8; CciMessageHeader::LEN];
                self.fmapi
                    .response_header(*tag, request, len)
                    .to_slice(&mut cci)
                    .map_err(|_| Error::InternalError)?;
                self.responder.prepare(
                    req.source_addr,
                    self.own_addr,
                    &[&hdr, &[mctp::MCTP_TYPE_CXL_FM.0], &cci, &payload[..len]],
                )?;
            }
            RequestBody::Unsupported(t) => {
                debug!("No handler for message type {t}");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
