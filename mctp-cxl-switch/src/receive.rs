// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Byte-at-a-time request ingestion
//!
//! An I2C target receives a write one byte per bus callback. Each byte is
//! interpreted by its position in the transaction, and the fields of the
//! request are collected into a [`FrameContext`]. At the end of the
//! transaction the context is converted into a typed [`Request`].

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use mctp::{MsgType, MCTP_HEADER_VERSION_1};

use crate::config::PecPolicy;
use crate::control::{ControlContext, ControlRequest};
use crate::fmapi::{FmApiContext, FmApiRequest};
use crate::pec::Pec;
use crate::proto::{self, offset, MctpHeader, MctpI2cHeader, MCTP_I2C_COMMAND_CODE};

/// Message specific part of an incoming frame
#[derive(Debug, Default, Clone)]
pub enum Message {
    /// Message type not yet received
    #[default]
    Pending,
    Control(ControlContext),
    FmApi(FmApiContext),
    Other(MsgType),
}

/// State for the transaction currently being received.
///
/// With [`PecPolicy::Enforce`] the byte count decides where data ends: the
/// byte at `2 + byte_count` is the PEC and anything later is ignored. With
/// [`PecPolicy::Ignore`] every byte is parsed by position, and only the
/// final byte of the transaction is taken as the PEC, provided it lies at
/// or beyond the position given by the byte count.
#[derive(Debug, Clone)]
pub struct FrameContext {
    own_addr: u8,
    policy: PecPolicy,
    command_code: u8,
    byte_count: Option<u8>,
    source_addr: u8,
    mctp_header: [u8; MctpHeader::LEN],
    header: MctpHeader,
    ic: bool,
    message: Message,
    /// Position of the next byte
    pos: usize,
    /// Last byte received, not yet parsed
    held: Option<u8>,
    pec: Pec,
    received_pec: Option<u8>,
}

impl FrameContext {
    fn new(own_addr: u8, policy: PecPolicy) -> Self {
        let mut pec = Pec::new();
        // The address byte is consumed by the bus but covered by the PEC
        pec.push(proto::write_addr(own_addr));
        Self {
            own_addr,
            policy,
            command_code: 0,
            byte_count: None,
            source_addr: 0,
            mctp_header: [0; MctpHeader::LEN],
            header: MctpHeader::default(),
            ic: false,
            message: Message::Pending,
            pos: 0,
            held: None,
            pec,
            received_pec: None,
        }
    }

    /// Position of the trailing PEC, once the byte count is known
    fn pec_pos(&self) -> Option<usize> {
        self.byte_count.map(|c| offset::SOURCE_ADDR + c as usize)
    }

    fn feed(&mut self, b: u8) {
        let pos = self.pos;
        self.pos += 1;

        match self.policy {
            PecPolicy::Enforce => match self.pec_pos() {
                Some(p) if pos == p => {
                    trace!("PEC {b:#04x}");
                    self.received_pec = Some(b);
                }
                Some(p) if pos > p => {
                    debug!("Trailing byte {b:#04x} at {pos} ignored");
                }
                _ => self.parse(pos, b),
            },
            PecPolicy::Ignore => {
                if let Some(prev) = self.held.replace(b) {
                    self.parse(pos - 1, prev);
                }
            }
        }
    }

    /// Handles the held final byte at the end of the transaction.
    fn end(&mut self) {
        let Some(b) = self.held.take() else {
            return;
        };
        let pos = self.pos - 1;
        match self.pec_pos() {
            Some(p) if pos >= p => {
                if pos > p {
                    debug!("Byte count {:?} short of frame, {} bytes", self.byte_count, self.pos);
                }
                trace!("PEC {b:#04x}");
                self.received_pec = Some(b);
            }
            _ => self.parse(pos, b),
        }
    }

    fn parse(&mut self, pos: usize, b: u8) {
        self.pec.push(b);

        match pos {
            offset::COMMAND_CODE => self.command_code = b,
            offset::BYTE_COUNT => self.byte_count = Some(b),
            offset::SOURCE_ADDR => {
                let header = MctpI2cHeader::new_from_buf([
                    proto::write_addr(self.own_addr),
                    self.command_code,
                    self.byte_count.unwrap_or(0),
                    b,
                ]);
                if header.command_code() != MCTP_I2C_COMMAND_CODE {
                    warn!("Bad command code {:#04x}", self.command_code);
                }
                self.source_addr = header.source_slave_addr();
            }
            offset::HEADER_VERSION => {
                if b & 0xf != MCTP_HEADER_VERSION_1 {
                    warn!("Bad MCTP header version {b:#04x}");
                }
                self.mctp_header[0] = b;
            }
            offset::DEST_EID | offset::SOURCE_EID => {
                self.mctp_header[pos - offset::HEADER_VERSION] = b;
            }
            offset::FLAGS => {
                self.mctp_header[3] = b;
                self.header = MctpHeader::from_bytes(self.mctp_header);
            }
            offset::MSG_TYPE => {
                let (typ, ic) = proto::decode_type_ic(b);
                self.ic = ic;
                self.message = match typ {
                    mctp::MCTP_TYPE_CONTROL => Message::Control(ControlContext::new()),
                    mctp::MCTP_TYPE_CXL_FM => Message::FmApi(FmApiContext::new()),
                    t => {
                        debug!("Unsupported message type {t}");
                        Message::Other(t)
                    }
                };
            }
            _ => {
                let off = pos - offset::BODY;
                match &mut self.message {
                    Message::Control(c) => c.feed(off, b),
                    Message::FmApi(f) => f.feed(off, b),
                    Message::Other(_) | Message::Pending => (),
                }
            }
        }
    }
}

/// A complete request, ready for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// 7-bit I2C address of the requester
    pub source_addr: u8,
    pub header: MctpHeader,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// `header` is the request's control message header
    Control { header: [u8; 2], request: ControlRequest },
    FmApi { tag: u8, request: FmApiRequest },
    Unsupported(MsgType),
}

impl RequestBody {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Control { .. } => mctp::MCTP_TYPE_CONTROL,
            Self::FmApi { .. } => mctp::MCTP_TYPE_CXL_FM,
            Self::Unsupported(t) => *t,
        }
    }
}

/// Receive side of the endpoint.
#[derive(Debug)]
pub struct Receiver {
    own_addr: u8,
    policy: PecPolicy,
    ctx: FrameContext,
    receiving: bool,
}

impl Receiver {
    pub fn new(own_addr: u8, policy: PecPolicy) -> Self {
        Self {
            own_addr,
            policy,
            ctx: FrameContext::new(own_addr, policy),
            receiving: false,
        }
    }

    /// Begins a new transaction, discarding any partial one.
    pub fn start(&mut self) {
        if self.receiving && self.ctx.pos > 0 {
            debug!("Discarding partial frame, {} bytes", self.ctx.pos);
        }
        self.ctx = FrameContext::new(self.own_addr, self.policy);
        self.receiving = true;
    }

    pub fn feed(&mut self, b: u8) {
        if !self.receiving {
            warn!("Byte {b:#04x} outside a transaction");
            self.start();
        }
        trace!("rx [{}] {b:#04x}", self.ctx.pos);
        self.ctx.feed(b);
    }

    /// Discards the current transaction.
    pub fn abort(&mut self) {
        self.ctx = FrameContext::new(self.own_addr, self.policy);
        self.receiving = false;
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// Number of bytes received in the current transaction
    pub fn position(&self) -> usize {
        self.ctx.pos
    }

    /// Ends the transaction.
    ///
    /// Returns the request to dispatch, if the frame carried one.
    pub fn finish(&mut self) -> Option<Request> {
        let mut ctx =
            core::mem::replace(&mut self.ctx, FrameContext::new(self.own_addr, self.policy));
        let was_receiving = core::mem::replace(&mut self.receiving, false);
        if !was_receiving {
            debug!("Finish without receive");
            return None;
        }
        ctx.end();

        if let Some(p) = ctx.pec_pos() {
            if ctx.pos < p {
                debug!("Short frame: byte count {:?}, {} bytes", ctx.byte_count, ctx.pos);
            }
        }

        if !self.check_pec(&ctx) {
            return None;
        }

        if ctx.ic {
            debug!("Integrity check bit set, ignored");
        }

        let body = match ctx.message {
            Message::Pending => {
                debug!("Frame ended before message type, {} bytes", ctx.pos);
                return None;
            }
            Message::Control(c) => RequestBody::Control {
                header: c.header(),
                request: c.request(),
            },
            Message::FmApi(f) => RequestBody::FmApi {
                tag: f.header().tag,
                request: f.request(),
            },
            Message::Other(t) => RequestBody::Unsupported(t),
        };

        Some(Request {
            source_addr: ctx.source_addr,
            header: ctx.header,
            body,
        })
    }

    /// Returns whether the request should be processed
    fn check_pec(&self, ctx: &FrameContext) -> bool {
        let calc = ctx.pec.value();
        let ok = match ctx.received_pec {
            Some(p) if p == calc => {
                trace!("PEC ok");
                true
            }
            Some(p) => {
                warn!("Incorrect PEC {p:#04x}, expected {calc:#04x}");
                false
            }
            None => {
                debug!("No PEC received");
                false
            }
        };
        ok || self.policy == PecPolicy::Ignore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pec;
    use mctp::{Eid, Tag, TagValue};

    const OWN: u8 = 0x4d;

    // Returns the frame as seen by the target, with the PEC appended
    fn frame(body: &[u8]) -> std::vec::Vec<u8> {
        let mut f = std::vec![0x0f, 0, 0x21, 0x01, 0x20, 0x08, 0xc8];
        f.extend_from_slice(body);
        f[1] = (f.len() - 2) as u8;
        let mut full = std::vec![OWN << 1];
        full.extend_from_slice(&f);
        f.push(pec::pec(&full));
        f
    }

    fn receive(r: &mut Receiver, bytes: &[u8]) -> Option<Request> {
        r.start();
        for b in bytes {
            r.feed(*b);
        }
        r.finish()
    }

    #[test]
    fn get_eid() {
        let mut r = Receiver::new(OWN, PecPolicy::Enforce);
        let req = receive(&mut r, &frame(&[0x00, 0x85, 0x02])).unwrap();
        assert_eq!(req.source_addr, 0x10);
        assert_eq!(req.header.dest, Eid(0x20));
        assert_eq!(req.header.src, Eid(0x08));
        assert_eq!(req.header.tag, Tag::Owned(TagValue(0)));
        assert_eq!(
            req.body,
            RequestBody::Control {
                header: [0x85, 0x02],
                request: ControlRequest::GetEndpointId
            }
        );
        assert!(!r.is_receiving());
    }

    #[test]
    fn fmapi() {
        let mut r = Receiver::new(OWN, PecPolicy::Enforce);
        let req = receive(
            &mut r,
            &frame(&[0x07, 0, 0x0b, 0, 0, 0x51, 0, 0, 0, 0, 0, 0, 0]),
        )
        .unwrap();
        assert_eq!(
            req.body,
            RequestBody::FmApi {
                tag: 0x0b,
                request: FmApiRequest::IdentifySwitch
            }
        );
        assert_eq!(req.body.msg_type(), mctp::MCTP_TYPE_CXL_FM);
    }

    #[test]
    fn other_type() {
        let mut r = Receiver::new(OWN, PecPolicy::Ignore);
        let req = receive(&mut r, &frame(&[0x01, 0x80, 0x02])).unwrap();
        assert_eq!(req.body, RequestBody::Unsupported(MsgType(1)));
    }

    #[test]
    fn pec_policy() {
        let mut f = frame(&[0x00, 0x80, 0x02]);
        *f.last_mut().unwrap() ^= 0x40;

        let mut r = Receiver::new(OWN, PecPolicy::Ignore);
        assert!(receive(&mut r, &f).is_some());
        let mut r = Receiver::new(OWN, PecPolicy::Enforce);
        assert!(receive(&mut r, &f).is_none());

        // Missing
        f.pop();
        assert!(receive(&mut r, &f).is_none());
        let mut r = Receiver::new(OWN, PecPolicy::Ignore);
        assert!(receive(&mut r, &f).is_some());
    }

    #[test]
    fn trailing_bytes() {
        let mut f = frame(&[0x00, 0x80, 0x04, 0xff]);
        f.extend_from_slice(&[0x01, 0x02, 0x03]);
        let expect = RequestBody::Control {
            header: [0x80, 0x04],
            request: ControlRequest::GetVersionSupport { msg_type: 0xff },
        };
        let mut r = Receiver::new(OWN, PecPolicy::Enforce);
        assert_eq!(receive(&mut r, &f).unwrap().body, expect);
        let mut r = Receiver::new(OWN, PecPolicy::Ignore);
        assert_eq!(receive(&mut r, &f).unwrap().body, expect);
    }

    #[test]
    fn short_byte_count() {
        // Byte count ends at the message type
        let mut f = frame(&[0x00, 0x80, 0x02]);
        f[1] = 5;

        let mut r = Receiver::new(OWN, PecPolicy::Ignore);
        let req = receive(&mut r, &f).unwrap();
        assert_eq!(req.source_addr, 0x10);
        assert_eq!(
            req.body,
            RequestBody::Control {
                header: [0x80, 0x02],
                request: ControlRequest::GetEndpointId
            }
        );

        // The message type is taken as the PEC
        let mut r = Receiver::new(OWN, PecPolicy::Enforce);
        assert!(receive(&mut r, &f).is_none());
    }

    #[test]
    fn missing_pec_parsed() {
        // Last byte is data when the byte count places the PEC after it
        let mut f = frame(&[0x00, 0x80, 0x04, 0x07]);
        f.pop();
        let mut r = Receiver::new(OWN, PecPolicy::Ignore);
        let req = receive(&mut r, &f).unwrap();
        assert_eq!(
            req.body,
            RequestBody::Control {
                header: [0x80, 0x04],
                request: ControlRequest::GetVersionSupport { msg_type: 0x07 }
            }
        );
    }

    #[test]
    fn short_frame() {
        let mut r = Receiver::new(OWN, PecPolicy::Ignore);
        assert!(receive(&mut r, &[0x0f, 0x08, 0x21, 0x01]).is_none());
        // No transaction
        assert!(r.finish().is_none());
    }

    #[test]
    fn abort_discards() {
        let mut r = Receiver::new(OWN, PecPolicy::Ignore);
        r.start();
        for b in &frame(&[0x00, 0x80, 0x02])[..6] {
            r.feed(*b);
        }
        assert_eq!(r.position(), 6);
        r.abort();
        assert!(!r.is_receiving());
        assert_eq!(r.position(), 0);
        assert!(r.finish().is_none());

        // Next frame is unaffected
        assert!(receive(&mut r, &frame(&[0x00, 0x80, 0x02])).is_some());
    }

    #[test]
    fn restart() {
        let mut r = Receiver::new(OWN, PecPolicy::Enforce);
        r.start();
        r.feed(0x0f);
        r.feed(0x30);
        let req = receive(&mut r, &frame(&[0x00, 0x80, 0x05])).unwrap();
        assert!(matches!(
            req.body,
            RequestBody::Control { request: ControlRequest::GetMessageTypeSupport, .. }
        ));
    }
}
