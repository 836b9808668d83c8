// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2024-2025 Code Construct
 */

//! MCTP Control Protocol responder, DSP0236 section 12

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use heapless::Vec;
use libmctp::control_packet::{CommandCode, CompletionCode};
use mctp::{Eid, MsgType};
use uuid::Uuid;

use crate::config::MAX_MSG_TYPES;

type Header = libmctp::control_packet::MCTPControlMessageHeader<[u8; 2]>;

/// A `Result` with a MCTP Control Completion Code as error
pub type ControlResult<T> = core::result::Result<T, CompletionCode>;

/// DSP0236 1.3.1 version entry (alpha, update, major, minor)
const MCTP_VERSION: [u8; 4] = [0x00, 0x00, 0x03, 0x01];

/// Vendor ID format for a PCI vendor ID
const VENDOR_ID_FORMAT_PCI: u8 = 0x00;

const MAX_RSP: usize = 32;

type Body = Vec<u8, MAX_RSP>;

/// Set Endpoint ID operation, request byte 1 bits 1:0
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SetEidOp {
    Set,
    Force,
    Reset,
    SetDiscovered,
}

impl SetEidOp {
    fn from_bits(b: u8) -> Self {
        match b & 0x03 {
            0b00 => Self::Set,
            0b01 => Self::Force,
            0b10 => Self::Reset,
            _ => Self::SetDiscovered,
        }
    }
}

/// A parsed control request
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ControlRequest {
    SetEndpointId { op: SetEidOp, eid: Eid },
    GetEndpointId,
    GetEndpointUuid,
    GetVersionSupport { msg_type: u8 },
    GetMessageTypeSupport,
    GetVendorDefinedSupport { selector: u8 },
    ResolveEndpointId { target: Eid },
    Unsupported(u8),
}

impl ControlRequest {
    pub fn command_code(&self) -> u8 {
        match self {
            Self::SetEndpointId { .. } => CommandCode::SetEndpointID as u8,
            Self::GetEndpointId => CommandCode::GetEndpointID as u8,
            Self::GetEndpointUuid => CommandCode::GetEndpointUUID as u8,
            Self::GetVersionSupport { .. } => CommandCode::GetMCTPVersionSupport as u8,
            Self::GetMessageTypeSupport => CommandCode::GetMessageTypeSupport as u8,
            Self::GetVendorDefinedSupport { .. } => {
                CommandCode::GetVendorDefinedMessageSupport as u8
            }
            Self::ResolveEndpointId { .. } => CommandCode::ResolveEndpointID as u8,
            Self::Unsupported(c) => *c,
        }
    }
}

/// Control part of an incoming frame.
///
/// Offsets passed to [`feed`](Self::feed) are relative to the byte
/// following the message type.
#[derive(Debug, Default, Clone)]
pub struct ControlContext {
    /// rq/d/instance ID and command code, as received
    header: [u8; 2],
    // Command specific bytes, meaning depends on the command code
    param: [u8; 2],
    nparam: usize,
}

impl ControlContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, off: usize, b: u8) {
        match off {
            0 => {
                self.header[0] = b;
                let header = Header::new_from_buf(self.header);
                if header.rq() == 0 {
                    warn!("Control message without request bit");
                }
                if header.d() != 0 {
                    debug!("Datagram control message");
                }
            }
            1 => {
                self.header[1] = b;
                trace!("control command {b:#04x}");
            }
            _ => self.feed_param(off - 2, b),
        }
    }

    fn feed_param(&mut self, off: usize, b: u8) {
        let want = param_len(&CommandCode::from(self.header[1]));
        if off < want {
            self.param[off] = b;
            self.nparam = off + 1;
        } else {
            trace!("control byte {off} ignored: {b:#04x}");
        }
    }

    /// Control message header bytes of the request
    pub fn header(&self) -> [u8; 2] {
        self.header
    }

    /// Converts the collected fields into a request.
    pub fn request(&self) -> ControlRequest {
        let command = self.header[1];
        let cmd = CommandCode::from(command);
        if self.nparam < param_len(&cmd) {
            debug!("Short request for command {command:#04x}, {} bytes", self.nparam);
        }
        let [p0, p1] = self.param;
        match cmd {
            CommandCode::SetEndpointID => ControlRequest::SetEndpointId {
                op: SetEidOp::from_bits(p0),
                eid: Eid(p1),
            },
            CommandCode::GetEndpointID => ControlRequest::GetEndpointId,
            CommandCode::GetEndpointUUID => ControlRequest::GetEndpointUuid,
            CommandCode::GetMCTPVersionSupport => {
                ControlRequest::GetVersionSupport { msg_type: p0 }
            }
            CommandCode::GetMessageTypeSupport => {
                ControlRequest::GetMessageTypeSupport
            }
            CommandCode::GetVendorDefinedMessageSupport => {
                ControlRequest::GetVendorDefinedSupport { selector: p0 }
            }
            CommandCode::ResolveEndpointID => {
                ControlRequest::ResolveEndpointId { target: Eid(p0) }
            }
            _ => {
                debug!("Unknown control command {command:#04x}");
                ControlRequest::Unsupported(command)
            }
        }
    }
}

/// Number of request bytes following the command code
fn param_len(cmd: &CommandCode) -> usize {
    match cmd {
        CommandCode::SetEndpointID => 2,
        CommandCode::GetMCTPVersionSupport
        | CommandCode::GetVendorDefinedMessageSupport
        | CommandCode::ResolveEndpointID => 1,
        _ => 0,
    }
}

/// Control message header for a response to the request header `req`
pub fn response_header(req: [u8; 2]) -> [u8; 2] {
    let mut header = Header::new_from_buf(req);
    header.set_rq(0);
    header.0
}

fn put(body: &mut Body, b: &[u8]) -> ControlResult<()> {
    body.extend_from_slice(b).map_err(|_| {
        warn!("Control response overflow");
        CompletionCode::Error
    })
}

/// A Control Message handler.
///
/// Owns the endpoint's EID, which changes only when a Set Endpoint ID
/// request is handled.
#[derive(Debug, Clone)]
pub struct MctpControl {
    eid: Eid,
    uuid: Uuid,
    types: Vec<MsgType, MAX_MSG_TYPES>,
    vendor_id: u16,
    strict_eid: bool,
}

impl MctpControl {
    pub fn new(eid: Eid, uuid: Uuid, vendor_id: u16) -> Self {
        Self {
            eid,
            uuid,
            types: Vec::new(),
            vendor_id,
            strict_eid: false,
        }
    }

    pub fn eid(&self) -> Eid {
        self.eid
    }

    /// Validate Set Endpoint ID requests.
    ///
    /// When set, only Set and Force with a normal EID are applied. Otherwise
    /// every Set Endpoint ID request assigns its EID.
    pub fn set_strict_eid(&mut self, strict: bool) {
        self.strict_eid = strict;
    }

    pub fn set_message_types(&mut self, types: &[MsgType]) -> mctp::Result<()> {
        if types.len() > self.types.capacity() {
            return Err(mctp::Error::NoSpace);
        }
        self.types.clear();
        // We have already checked the length, so no Err here
        let _ = self.types.extend_from_slice(types);
        Ok(())
    }

    /// Writes the response body (starting with the completion code) to
    /// `rsp_buf`.
    ///
    /// Returns the body length, or `None` if the command has no response.
    pub fn handle(&mut self, req: &ControlRequest, rsp_buf: &mut [u8]) -> Option<usize> {
        let mut body = Body::new();
        let r = match req {
            ControlRequest::SetEndpointId { op, eid } => {
                self.set_eid(*op, *eid, &mut body)
            }
            ControlRequest::GetEndpointId => {
                // simple endpoint, dynamic EID
                put(&mut body, &[CompletionCode::Success as u8, self.eid.0, 0x00, 0x00])
            }
            ControlRequest::GetEndpointUuid => self.uuid(&mut body),
            ControlRequest::GetVersionSupport { msg_type } => {
                self.version_support(*msg_type, &mut body)
            }
            ControlRequest::GetMessageTypeSupport => self.message_types(&mut body),
            ControlRequest::GetVendorDefinedSupport { selector } => {
                self.vendor_support(*selector, &mut body)
            }
            ControlRequest::ResolveEndpointId { target } => {
                debug!("Resolve EID {target} not handled");
                return None;
            }
            ControlRequest::Unsupported(c) => {
                warn!("No response for control command {c:#04x}");
                return None;
            }
        };

        if let Err(cc) = r {
            let cc = cc as u8;
            debug!("Command {:#04x} completion code {cc:#04x}", req.command_code());
            body.clear();
            // Fits, body was cleared
            let _ = body.push(cc);
        }
        let out = rsp_buf.get_mut(..body.len())?;
        out.copy_from_slice(&body);
        Some(body.len())
    }

    fn set_eid(&mut self, op: SetEidOp, eid: Eid, body: &mut Body) -> ControlResult<()> {
        let assign = if !self.strict_eid {
            if Eid::new_normal(eid.0).is_err() {
                debug!("Assigning non-normal EID {eid}, {op:?}");
            }
            true
        } else {
            match op {
                SetEidOp::Set | SetEidOp::Force => {
                    Eid::new_normal(eid.0).map_err(|_| {
                        warn!("Rejected Set Endpoint ID {eid}");
                        CompletionCode::ErrorInvalidData
                    })?;
                    true
                }
                SetEidOp::Reset => false,
                SetEidOp::SetDiscovered => {
                    debug!("Set Endpoint ID 'set discovered' unsupported");
                    return Err(CompletionCode::ErrorInvalidData);
                }
            }
        };

        if assign {
            if eid != self.eid {
                info!("EID set to {eid} (was {})", self.eid);
            }
            self.eid = eid;
        } else {
            debug!("Set Endpoint ID reset, keeping {}", self.eid);
        }

        // assignment accepted, no EID pool
        let status = 0b0000_0000;
        put(body, &[CompletionCode::Success as u8, status, self.eid.0, 0x00])
    }

    fn uuid(&self, body: &mut Body) -> ControlResult<()> {
        put(body, &[CompletionCode::Success as u8])?;
        put(body, self.uuid.as_bytes())
    }

    fn version_support(&self, msg_type: u8, body: &mut Body) -> ControlResult<()> {
        debug!("Get version for type {msg_type:#04x}");
        put(body, &[CompletionCode::Success as u8, 1])?;
        put(body, &MCTP_VERSION)
    }

    fn message_types(&self, body: &mut Body) -> ControlResult<()> {
        let n: u8 = self.types.len().try_into().map_err(|_| CompletionCode::Error)?;
        put(body, &[CompletionCode::Success as u8, n])?;
        for t in &self.types {
            put(body, &[t.0])?;
        }
        Ok(())
    }

    fn vendor_support(&self, selector: u8, body: &mut Body) -> ControlResult<()> {
        if selector != 0 {
            debug!("No vendor ID set {selector}");
            return Err(CompletionCode::ErrorInvalidData);
        }
        let [vh, vl] = self.vendor_id.to_be_bytes();
        // 0xff: no more vendor ID sets. Command set type 0.
        put(
            body,
            &[CompletionCode::Success as u8, 0xff, VENDOR_ID_FORMAT_PCI, vh, vl, 0x00, 0x00],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_UUID, DEFAULT_VENDOR_ID};

    fn control() -> MctpControl {
        let mut c = MctpControl::new(Eid(0x20), DEFAULT_UUID, DEFAULT_VENDOR_ID);
        c.set_message_types(&[mctp::MCTP_TYPE_CONTROL, mctp::MCTP_TYPE_CXL_FM])
            .unwrap();
        c
    }

    fn parse(bytes: &[u8]) -> ControlContext {
        let mut ctx = ControlContext::new();
        for (i, b) in bytes.iter().enumerate() {
            ctx.feed(i, *b);
        }
        ctx
    }

    fn respond(c: &mut MctpControl, req: &[u8]) -> Option<std::vec::Vec<u8>> {
        let mut buf = [0u8; 64];
        let req = parse(req).request();
        c.handle(&req, &mut buf).map(|n| buf[..n].to_vec())
    }

    #[test]
    fn parse_header() {
        let ctx = parse(&[0x85, 0x02]);
        assert_eq!(ctx.header(), [0x85, 0x02]);
        assert_eq!(ctx.request(), ControlRequest::GetEndpointId);
        assert_eq!(response_header(ctx.header()), [0x05, 0x02]);
    }

    #[test]
    fn parse_set_eid() {
        let ctx = parse(&[0x80, 0x01, 0x01, 0x33, 0xaa]);
        assert_eq!(
            ctx.request(),
            ControlRequest::SetEndpointId { op: SetEidOp::Force, eid: Eid(0x33) }
        );
        assert_eq!(ctx.request().command_code(), 0x01);
    }

    #[test]
    fn get_eid() {
        let mut c = control();
        assert_eq!(respond(&mut c, &[0x80, 0x02]).unwrap(), [0, 0x20, 0, 0]);
    }

    #[test]
    fn set_eid() {
        let mut c = control();
        assert_eq!(
            respond(&mut c, &[0x80, 0x01, 0x00, 0x42]).unwrap(),
            [0, 0, 0x42, 0]
        );
        assert_eq!(c.eid(), Eid(0x42));
        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x01, 0x43]).unwrap(), [0, 0, 0x43, 0]);
        assert_eq!(respond(&mut c, &[0x80, 0x02]).unwrap(), [0, 0x43, 0, 0]);
    }

    #[test]
    fn set_eid_any_operation() {
        let mut c = control();
        // Reserved EID
        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x00, 0x05]).unwrap(), [0, 0, 0x05, 0]);
        assert_eq!(respond(&mut c, &[0x80, 0x02]).unwrap(), [0, 0x05, 0, 0]);
        // Reset
        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x02, 0x42]).unwrap(), [0, 0, 0x42, 0]);
        assert_eq!(c.eid(), Eid(0x42));
        // Set discovered
        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x03, 0x30]).unwrap(), [0, 0, 0x30, 0]);
        // Broadcast
        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x00, 0xff]).unwrap(), [0, 0, 0xff, 0]);
        assert_eq!(respond(&mut c, &[0x80, 0x02]).unwrap(), [0, 0xff, 0, 0]);
    }

    #[test]
    fn set_eid_strict() {
        let mut c = control();
        c.set_strict_eid(true);
        // Reserved EID
        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x00, 0x03]).unwrap(), [2]);
        // Broadcast
        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x01, 0xff]).unwrap(), [2]);
        // Set discovered
        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x03, 0x30]).unwrap(), [2]);
        assert_eq!(c.eid(), Eid(0x20));

        // Reset keeps current
        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x02, 0x50]).unwrap(), [0, 0, 0x20, 0]);
        assert_eq!(c.eid(), Eid(0x20));

        assert_eq!(respond(&mut c, &[0x80, 0x01, 0x00, 0x42]).unwrap(), [0, 0, 0x42, 0]);
        assert_eq!(c.eid(), Eid(0x42));
    }

    #[test]
    fn uuid() {
        let mut c = control();
        let r = respond(&mut c, &[0x80, 0x03]).unwrap();
        assert_eq!(r.len(), 17);
        assert_eq!(r[0], 0);
        assert_eq!(&r[1..], DEFAULT_UUID.as_bytes());
    }

    #[test]
    fn version() {
        let mut c = control();
        let r = respond(&mut c, &[0x80, 0x04, 0xff]).unwrap();
        assert_eq!(r, [0, 1, 0, 0, 3, 1]);
    }

    #[test]
    fn msg_types() {
        let mut c = control();
        assert_eq!(respond(&mut c, &[0x80, 0x05]).unwrap(), [0, 2, 0x00, 0x07]);

        let too_many = [MsgType(1); MAX_MSG_TYPES + 1];
        c.set_message_types(&too_many).unwrap_err();
    }

    #[test]
    fn vendor_defined() {
        let mut c = control();
        assert_eq!(
            respond(&mut c, &[0x80, 0x06, 0x00]).unwrap(),
            [0, 0xff, 0x00, 0x19, 0xe5, 0x00, 0x00]
        );
        assert_eq!(respond(&mut c, &[0x80, 0x06, 0x01]).unwrap(), [2]);
    }

    #[test]
    fn completion_codes() {
        let c = control();
        let mut body = Body::new();
        assert!(c.vendor_support(1, &mut body) == Err(CompletionCode::ErrorInvalidData));
        assert!(body.is_empty());

        // Overflow
        let mut full = Body::new();
        full.resize(MAX_RSP - 1, 0).unwrap();
        assert!(c.uuid(&mut full) == Err(CompletionCode::Error));
    }

    #[test]
    fn unsupported() {
        let mut c = control();
        assert!(respond(&mut c, &[0x80, 0x07, 0x10]).is_none());
        assert!(respond(&mut c, &[0x80, 0x0e]).is_none());
        assert!(respond(&mut c, &[0x80, 0x7f]).is_none());
        assert_eq!(parse(&[0x80, 0x7f]).request().command_code(), 0x7f);
    }

    #[test]
    fn small_buffer() {
        let mut c = control();
        let mut buf = [0u8; 4];
        assert!(c.handle(&ControlRequest::GetEndpointUuid, &mut buf).is_none());
        assert_eq!(c.handle(&ControlRequest::GetEndpointId, &mut buf), Some(4));
    }
}
