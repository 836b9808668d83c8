// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! CXL Fabric Manager API over MCTP
//!
//! Only the Physical Switch command set is implemented. Messages start with
//! a 12 byte CCI message header, followed by the command payload.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use deku::{DekuContainerWrite, DekuRead, DekuWrite};
use heapless::Vec;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::topology::{SwitchTopology, NUM_PORTS};

/// Maximum number of ports accepted in a Get Physical Port State request
pub const MAX_PORTS_REQ: usize = NUM_PORTS;

/// CCI message category for requests
pub const CATEGORY_REQUEST: u8 = 0;
/// CCI message category for responses
pub const CATEGORY_RESPONSE: u8 = 1;

/// FM-API command sets
#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum CommandSet {
    PhysicalSwitch = 0x51,
    VirtualSwitch = 0x52,
    MldPort = 0x53,
    MldComponent = 0x54,
}

/// Physical Switch command set commands
#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum PhysicalSwitchCmd {
    IdentifySwitch = 0x00,
    GetPhysicalPortState = 0x01,
    PhysicalPortControl = 0x02,
    SendPpbCxlIoConfig = 0x03,
}

/// CCI message header
#[derive(Debug, Default, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct CciMessageHeader {
    pub category: u8,
    pub tag: u8,
    pub rsvd: u8,
    pub command: u8,
    pub command_set: u8,
    /// 20 bit payload length, bit 23 is background operation
    pub payload_len: [u8; 3],
    pub return_code: u16,
    pub vendor_specific: u16,
}

impl CciMessageHeader {
    pub const LEN: usize = 12;

    pub fn payload_length(&self) -> u32 {
        let [a, b, c] = self.payload_len;
        u32::from_le_bytes([a, b, c & 0x0f, 0])
    }

    pub fn set_payload_length(&mut self, len: u32) {
        let [a, b, c, _] = len.to_le_bytes();
        self.payload_len = [a, b, c & 0x0f];
    }
}

/// Identify Switch Device response, CXL 2.0 Table 89
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct IdentifySwitchResp {
    pub ingress_port_id: u8,
    pub rsvd: u8,
    pub num_physical_ports: u8,
    pub num_vcs: u8,
    pub active_port_bitmask: [u8; 32],
    pub active_vcs_bitmask: [u8; 32],
    pub num_total_vppb: u16,
    pub num_active_vppb: u16,
}

impl IdentifySwitchResp {
    pub const LEN: usize = 72;
}

/// Get Physical Port State response header, CXL 2.0 Table 91
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PortStateRespHeader {
    pub num_ports: u8,
    pub rsvd: [u8; 3],
}

impl PortStateRespHeader {
    pub const LEN: usize = 4;
}

/// Port Information Block, CXL 2.0 Table 92
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PortStateInfoBlock {
    pub port_id: u8,
    pub config_state: u8,
    pub connected_device_cxl_version: u8,
    pub rsvd: u8,
    pub connected_device_type: u8,
    pub port_cxl_version_bitmask: u8,
    pub max_link_width: u8,
    pub negotiated_link_width: u8,
    pub supported_link_speeds_vector: u8,
    pub max_link_speed: u8,
    pub current_link_speed: u8,
    pub ltssm_state: u8,
    pub first_lane_num: u8,
    pub link_state: u16,
    pub supported_ld_count: u8,
}

impl PortStateInfoBlock {
    pub const LEN: usize = 16;
}

/// Command specific fields, collected as request bytes arrive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
enum Params {
    #[default]
    None,
    PortState {
        declared: Option<u8>,
        ports: Vec<u8, MAX_PORTS_REQ>,
    },
    PortControl {
        ppb_id: Option<u8>,
        opcode: Option<u8>,
    },
}

/// FM-API part of an incoming frame.
///
/// Offsets passed to [`feed`](Self::feed) are relative to the start of the
/// CCI message header.
#[derive(Debug, Default, Clone)]
pub struct FmApiContext {
    header: CciMessageHeader,
    params: Params,
}

impl FmApiContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, off: usize, b: u8) {
        let h = &mut self.header;
        match off {
            0 => {
                h.category = b;
                if b != CATEGORY_REQUEST {
                    warn!("FM-API message category {b} is not a request");
                }
            }
            1 => h.tag = b,
            2 => h.rsvd = b,
            3 => h.command = b,
            4 => {
                h.command_set = b;
                self.params = self.new_params();
            }
            5..=7 => h.payload_len[off - 5] = b,
            8 => h.return_code = b as u16,
            9 => h.return_code |= (b as u16) << 8,
            10 => h.vendor_specific = b as u16,
            11 => h.vendor_specific |= (b as u16) << 8,
            _ => self.feed_payload(off - CciMessageHeader::LEN, b),
        }
    }

    fn new_params(&self) -> Params {
        let h = &self.header;
        match (CommandSet::from_u8(h.command_set), PhysicalSwitchCmd::from_u8(h.command)) {
            (Some(CommandSet::PhysicalSwitch), Some(PhysicalSwitchCmd::GetPhysicalPortState)) => {
                Params::PortState { declared: None, ports: Vec::new() }
            }
            (Some(CommandSet::PhysicalSwitch), Some(PhysicalSwitchCmd::PhysicalPortControl)) => {
                Params::PortControl { ppb_id: None, opcode: None }
            }
            (Some(CommandSet::PhysicalSwitch), Some(_)) => Params::None,
            (Some(CommandSet::PhysicalSwitch), None) => {
                debug!("Physical switch command {:#04x} not handled", h.command);
                Params::None
            }
            (set, _) => {
                debug!("FM-API command set {:#04x} not handled ({set:?})", h.command_set);
                Params::None
            }
        }
    }

    fn feed_payload(&mut self, off: usize, b: u8) {
        match &mut self.params {
            Params::PortState { declared, ports } => {
                if off == 0 {
                    *declared = Some(b);
                    if b as usize > MAX_PORTS_REQ {
                        debug!("{b} ports requested, limited to {MAX_PORTS_REQ}");
                    }
                } else if off <= declared.unwrap_or(0) as usize {
                    // Excess ports beyond capacity are dropped
                    if ports.push(b).is_err() {
                        trace!("dropped port {b}");
                    }
                } else {
                    trace!("extra port state byte {b:#04x}");
                }
            }
            Params::PortControl { ppb_id, opcode } => match off {
                0 => {
                    debug!("ppb id {b}");
                    *ppb_id = Some(b);
                }
                1 => {
                    debug!("port opcode {b}");
                    *opcode = Some(b);
                }
                _ => (),
            },
            Params::None => (),
        }
    }

    pub fn header(&self) -> &CciMessageHeader {
        &self.header
    }

    /// Converts the collected fields into a request.
    pub fn request(self) -> FmApiRequest {
        let h = self.header;
        match (CommandSet::from_u8(h.command_set), self.params) {
            (Some(CommandSet::PhysicalSwitch), Params::PortState { declared, ports }) => {
                if declared.unwrap_or(0) as usize > ports.len() {
                    debug!(
                        "port list short, declared {:?} received {}",
                        declared,
                        ports.len()
                    );
                }
                FmApiRequest::GetPhysicalPortState { ports }
            }
            (Some(CommandSet::PhysicalSwitch), Params::PortControl { ppb_id, opcode }) => {
                FmApiRequest::PhysicalPortControl { ppb_id, opcode }
            }
            (Some(CommandSet::PhysicalSwitch), Params::None) => {
                match PhysicalSwitchCmd::from_u8(h.command) {
                    Some(PhysicalSwitchCmd::IdentifySwitch) => FmApiRequest::IdentifySwitch,
                    Some(PhysicalSwitchCmd::SendPpbCxlIoConfig) => FmApiRequest::SendPpbConfig,
                    _ => FmApiRequest::Unsupported {
                        command_set: h.command_set,
                        command: h.command,
                    },
                }
            }
            _ => FmApiRequest::Unsupported {
                command_set: h.command_set,
                command: h.command,
            },
        }
    }
}

/// A parsed FM-API request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FmApiRequest {
    IdentifySwitch,
    /// Ports in request order, as received. When fewer port IDs arrive than
    /// the request declares, only those received are reported.
    GetPhysicalPortState { ports: Vec<u8, MAX_PORTS_REQ> },
    PhysicalPortControl { ppb_id: Option<u8>, opcode: Option<u8> },
    SendPpbConfig,
    Unsupported { command_set: u8, command: u8 },
}

impl FmApiRequest {
    pub fn command_set(&self) -> u8 {
        match self {
            Self::Unsupported { command_set, .. } => *command_set,
            _ => CommandSet::PhysicalSwitch as u8,
        }
    }

    pub fn command(&self) -> u8 {
        let c = match self {
            Self::IdentifySwitch => PhysicalSwitchCmd::IdentifySwitch,
            Self::GetPhysicalPortState { .. } => PhysicalSwitchCmd::GetPhysicalPortState,
            Self::PhysicalPortControl { .. } => PhysicalSwitchCmd::PhysicalPortControl,
            Self::SendPpbConfig => PhysicalSwitchCmd::SendPpbCxlIoConfig,
            Self::Unsupported { command, .. } => return *command,
        };
        c as u8
    }
}

/// Physical Switch command set responder.
#[derive(Debug, Clone)]
pub struct PhysicalSwitch {
    topology: SwitchTopology,
    vendor_specific: u16,
}

impl PhysicalSwitch {
    pub fn new(topology: SwitchTopology, vendor_specific: u16) -> Self {
        Self {
            topology,
            vendor_specific,
        }
    }

    pub fn topology(&self) -> &SwitchTopology {
        &self.topology
    }

    /// Response CCI header for a request, with `len` bytes of payload.
    pub fn response_header(&self, tag: u8, req: &FmApiRequest, len: usize) -> CciMessageHeader {
        let mut h = CciMessageHeader {
            category: CATEGORY_RESPONSE,
            tag,
            rsvd: 0,
            command: req.command(),
            command_set: req.command_set(),
            payload_len: [0; 3],
            return_code: 0,
            vendor_specific: self.vendor_specific,
        };
        h.set_payload_length(len as u32);
        h
    }

    /// Writes the response payload for `req` to `rsp_buf`.
    ///
    /// Returns the payload length, or `None` when no response is sent.
    pub fn handle(&self, req: &FmApiRequest, rsp_buf: &mut [u8]) -> Option<usize> {
        let r = match req {
            FmApiRequest::IdentifySwitch => {
                self.topology.identify().to_slice(rsp_buf)
            }
            FmApiRequest::GetPhysicalPortState { ports } => {
                self.port_state(ports, rsp_buf)
            }
            FmApiRequest::PhysicalPortControl { ppb_id, opcode } => {
                // Emulated ports have no link to control
                debug!("Physical port control ppb {ppb_id:?} opcode {opcode:?} ignored");
                return None;
            }
            FmApiRequest::SendPpbConfig => {
                debug!("Send PPB CXL.io config not implemented");
                return None;
            }
            FmApiRequest::Unsupported { command_set, command } => {
                warn!("No FM-API response for set {command_set:#04x} command {command:#04x}");
                return None;
            }
        };

        r.inspect_err(|e| warn!("FM-API response encode failed: {e:?}")).ok()
    }

    fn port_state(&self, ports: &[u8], rsp_buf: &mut [u8]) -> Result<usize, deku::DekuError> {
        let head = PortStateRespHeader {
            num_ports: ports.len() as u8,
            rsvd: [0; 3],
        };
        let mut len = head.to_slice(rsp_buf)?;
        for p in ports {
            let block = self.topology.port(*p).info_block();
            len += block.to_slice(&mut rsp_buf[len..])?;
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deku::DekuContainerRead;

    fn feed_all(ctx: &mut FmApiContext, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            ctx.feed(i, *b);
        }
    }

    fn port_state_req(ports: &[u8]) -> FmApiContext {
        let mut ctx = FmApiContext::new();
        let mut msg = std::vec![0x00, 0x05, 0x00, 0x01, 0x51, 0, 0, 0, 0, 0, 0, 0];
        msg.push(ports.len() as u8);
        msg.extend_from_slice(ports);
        feed_all(&mut ctx, &msg);
        ctx
    }

    #[test]
    fn header_fields() {
        let mut ctx = FmApiContext::new();
        feed_all(
            &mut ctx,
            &[0x00, 0x09, 0x00, 0x00, 0x51, 0x34, 0x12, 0x0f, 0x01, 0x00, 0xef, 0xbe],
        );
        let h = ctx.header();
        assert_eq!(h.tag, 9);
        assert_eq!(h.payload_length(), 0x0f1234 & 0xfffff);
        assert_eq!(h.return_code, 1);
        assert_eq!(h.vendor_specific, 0xbeef);
        assert_eq!(ctx.request(), FmApiRequest::IdentifySwitch);
    }

    #[test]
    fn port_list() {
        let req = port_state_req(&[3, 0, 9]).request();
        let FmApiRequest::GetPhysicalPortState { ports } = req else {
            panic!("wrong request {req:?}");
        };
        assert_eq!(ports.as_slice(), &[3, 0, 9]);
    }

    #[test]
    fn port_list_truncated() {
        let ports: std::vec::Vec<u8> = (0..14).rev().collect();
        let req = port_state_req(&ports).request();
        let FmApiRequest::GetPhysicalPortState { ports: got } = req else {
            panic!("wrong request {req:?}");
        };
        assert_eq!(got.as_slice(), &ports[..MAX_PORTS_REQ]);
    }

    #[test]
    fn port_list_short() {
        // Declared 4 ports, 2 sent
        let mut ctx = FmApiContext::new();
        feed_all(&mut ctx, &[0x00, 0x05, 0x00, 0x01, 0x51, 0, 0, 0, 0, 0, 0, 0, 4, 7, 1]);
        let req = ctx.request();
        let FmApiRequest::GetPhysicalPortState { ports } = &req else {
            panic!("wrong request {req:?}");
        };
        assert_eq!(ports.as_slice(), &[7, 1]);

        let sw = PhysicalSwitch::new(SwitchTopology::new(), 0xbeef);
        let mut buf = [0u8; 256];
        let n = sw.handle(&req, &mut buf).unwrap();
        assert_eq!(n, PortStateRespHeader::LEN + 2 * PortStateInfoBlock::LEN);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[4], 7);
        assert_eq!(buf[20], 1);
    }

    #[test]
    fn port_list_extra_bytes() {
        // Declared 1 port, 3 sent
        let mut ctx = FmApiContext::new();
        feed_all(&mut ctx, &[0x00, 0x05, 0x00, 0x01, 0x51, 0, 0, 0, 0, 0, 0, 0, 1, 4, 5, 6]);
        let FmApiRequest::GetPhysicalPortState { ports } = ctx.request() else {
            panic!();
        };
        assert_eq!(ports.as_slice(), &[4]);
    }

    #[test]
    fn port_control() {
        let mut ctx = FmApiContext::new();
        feed_all(&mut ctx, &[0x00, 0x01, 0x00, 0x02, 0x51, 0, 0, 0, 0, 0, 0, 0, 4, 1]);
        let req = ctx.request();
        assert_eq!(
            req,
            FmApiRequest::PhysicalPortControl { ppb_id: Some(4), opcode: Some(1) }
        );
        let sw = PhysicalSwitch::new(SwitchTopology::new(), 0xbeef);
        let mut buf = [0u8; 256];
        assert!(sw.handle(&req, &mut buf).is_none());
    }

    #[test]
    fn unsupported() {
        let mut ctx = FmApiContext::new();
        feed_all(&mut ctx, &[0x00, 0x01, 0x00, 0x00, 0x52, 0, 0, 0, 0, 0, 0, 0]);
        let req = ctx.request();
        assert_eq!(req, FmApiRequest::Unsupported { command_set: 0x52, command: 0 });
        assert_eq!(req.command_set(), 0x52);

        let sw = PhysicalSwitch::new(SwitchTopology::new(), 0xbeef);
        let mut buf = [0u8; 256];
        assert!(sw.handle(&req, &mut buf).is_none());
        assert!(sw.handle(&FmApiRequest::SendPpbConfig, &mut buf).is_none());
    }

    #[test]
    fn identify_payload() {
        let sw = PhysicalSwitch::new(SwitchTopology::new(), 0xbeef);
        let mut buf = [0u8; 256];
        let n = sw.handle(&FmApiRequest::IdentifySwitch, &mut buf).unwrap();
        assert_eq!(n, IdentifySwitchResp::LEN);
        assert_eq!(&buf[..6], &[0, 0, 10, 2, 0xff, 0x03]);
        assert_eq!(buf[36], 0x03);
        assert_eq!(&buf[68..72], &[128, 0, 8, 0]);

        let (_rest, id) = IdentifySwitchResp::from_bytes((&buf[..n], 0)).unwrap();
        assert_eq!(id, sw.topology().identify());
    }

    #[test]
    fn port_state_payload() {
        let sw = PhysicalSwitch::new(SwitchTopology::new(), 0xbeef);
        let mut buf = [0u8; 256];
        let req = port_state_req(&[5, 1]).request();
        let n = sw.handle(&req, &mut buf).unwrap();
        assert_eq!(n, PortStateRespHeader::LEN + 2 * PortStateInfoBlock::LEN);
        assert_eq!(&buf[..4], &[2, 0, 0, 0]);
        assert_eq!(
            &buf[4..20],
            &[5, 3, 2, 0, 4, 0x02, 0x10, 0x10, 0x1c, 5, 5, 7, 0, 0, 0, 3]
        );
        assert_eq!(
            &buf[20..36],
            &[1, 4, 2, 0, 0, 0x02, 0x10, 0x10, 0x1c, 5, 5, 7, 0, 0, 0, 0]
        );

        // No ports
        let req = port_state_req(&[]).request();
        let n = sw.handle(&req, &mut buf).unwrap();
        assert_eq!(n, PortStateRespHeader::LEN);
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn response_header() {
        let sw = PhysicalSwitch::new(SwitchTopology::new(), 0xbeef);
        let h = sw.response_header(7, &FmApiRequest::IdentifySwitch, 72);
        let mut buf = [0u8; 16];
        let n = h.to_slice(&mut buf).unwrap();
        assert_eq!(n, CciMessageHeader::LEN);
        assert_eq!(&buf[..n], &[1, 7, 0, 0, 0x51, 72, 0, 0, 0, 0, 0xef, 0xbe]);
    }
}
