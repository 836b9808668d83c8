// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Virtual switch topology
//!
//! A fixed description of the emulated switch: ten physical ports, the
//! first two upstream and the rest downstream, each downstream port with a
//! CXL Type-3 device attached. Nothing here changes after construction.

use enumset::{EnumSet, EnumSetType};

use crate::fmapi::{IdentifySwitchResp, PortStateInfoBlock};

/// Number of physical ports
pub const NUM_PORTS: usize = 10;

/// Ports with IDs below this are upstream ports
pub const NUM_UPSTREAM_PORTS: u8 = 2;

const NUM_VCS: u8 = 2;
const TOTAL_VPPB: u16 = 128;
const ACTIVE_VPPB: u16 = 8;

/// Current port configuration state, CXL 2.0 Table 92
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortConfigState {
    Disabled = 0,
    BindInProgress = 1,
    UnbindInProgress = 2,
    /// Downstream port, active and bound
    Dsp = 3,
    /// Upstream port, active and unbound
    Usp = 4,
    InvalidPortId = 0xf,
}

/// Connected device type, CXL 2.0 Table 92
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectedDevice {
    None = 0,
    Pcie = 1,
    CxlType1 = 2,
    CxlType2 = 3,
    CxlType3 = 4,
    CxlType3Pooled = 5,
}

/// Bit positions of the Port CXL Version Bitmask
#[derive(EnumSetType, Debug)]
pub enum CxlVersion {
    Cxl1_1 = 0,
    Cxl2_0 = 1,
}

/// Bit positions of the Supported Link Speeds Vector
#[derive(EnumSetType, Debug)]
pub enum LinkSpeed {
    /// 2.5 GT/s
    Gen1 = 0,
    /// 5 GT/s
    Gen2 = 1,
    /// 8 GT/s
    Gen3 = 2,
    /// 16 GT/s
    Gen4 = 3,
    /// 32 GT/s
    Gen5 = 4,
    /// 64 GT/s
    Gen6 = 5,
}

impl LinkSpeed {
    /// Encoding for the Max/Current Link Speed fields, 1 for 2.5 GT/s.
    pub fn code(self) -> u8 {
        self as u8 + 1
    }
}

/// Link Training and Status State Machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LtssmState {
    Detect = 0,
    Polling = 1,
    Configuration = 2,
    Recovery = 3,
    L0 = 4,
    L0s = 5,
    L1 = 6,
    L2 = 7,
    Disabled = 8,
    Loopback = 9,
    HotReset = 10,
}

/// A physical switch port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPort {
    pub id: u8,
    pub config_state: PortConfigState,
    pub connected_cxl_version: u8,
    pub connected_device: ConnectedDevice,
    pub cxl_versions: EnumSet<CxlVersion>,
    pub max_link_width: u8,
    pub negotiated_link_width: u8,
    pub supported_speeds: EnumSet<LinkSpeed>,
    pub max_speed: LinkSpeed,
    pub current_speed: LinkSpeed,
    pub ltssm: LtssmState,
    pub first_lane: u8,
    pub link_state: u16,
    pub supported_ld_count: u8,
}

impl PhysicalPort {
    /// Describes a port by ID.
    ///
    /// IDs below [`NUM_UPSTREAM_PORTS`] are upstream with nothing connected,
    /// any other ID is a downstream port with a Type-3 device.
    pub fn new(id: u8) -> Self {
        let (config_state, connected_device, supported_ld_count) =
            if id < NUM_UPSTREAM_PORTS {
                (PortConfigState::Usp, ConnectedDevice::None, 0)
            } else {
                (PortConfigState::Dsp, ConnectedDevice::CxlType3, 3)
            };

        Self {
            id,
            config_state,
            connected_cxl_version: 2,
            connected_device,
            cxl_versions: CxlVersion::Cxl2_0.into(),
            max_link_width: 16,
            negotiated_link_width: 16,
            supported_speeds: LinkSpeed::Gen3 | LinkSpeed::Gen4 | LinkSpeed::Gen5,
            max_speed: LinkSpeed::Gen5,
            current_speed: LinkSpeed::Gen5,
            ltssm: LtssmState::L2,
            first_lane: 0,
            link_state: 0,
            supported_ld_count,
        }
    }

    pub fn is_upstream(&self) -> bool {
        self.config_state == PortConfigState::Usp
    }

    pub fn info_block(&self) -> PortStateInfoBlock {
        PortStateInfoBlock {
            port_id: self.id,
            config_state: self.config_state as u8,
            connected_device_cxl_version: self.connected_cxl_version,
            rsvd: 0,
            connected_device_type: self.connected_device as u8,
            port_cxl_version_bitmask: self.cxl_versions.as_u32() as u8,
            max_link_width: self.max_link_width,
            negotiated_link_width: self.negotiated_link_width,
            supported_link_speeds_vector: self.supported_speeds.as_u32() as u8,
            max_link_speed: self.max_speed.code(),
            current_link_speed: self.current_speed.code(),
            ltssm_state: self.ltssm as u8,
            first_lane_num: self.first_lane,
            link_state: self.link_state,
            supported_ld_count: self.supported_ld_count,
        }
    }
}

/// The switch as reported to a Fabric Manager.
#[derive(Debug, Clone)]
pub struct SwitchTopology {
    ports: [PhysicalPort; NUM_PORTS],
    ingress_port: u8,
    num_vcs: u8,
    total_vppb: u16,
    active_vppb: u16,
}

impl Default for SwitchTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchTopology {
    pub fn new() -> Self {
        Self {
            ports: core::array::from_fn(|i| PhysicalPort::new(i as u8)),
            ingress_port: 0,
            num_vcs: NUM_VCS,
            total_vppb: TOTAL_VPPB,
            active_vppb: ACTIVE_VPPB,
        }
    }

    pub fn ports(&self) -> &[PhysicalPort] {
        &self.ports
    }

    /// Looks up a port.
    ///
    /// IDs outside the table are described by the same upstream/downstream
    /// classification rule as the table itself.
    pub fn port(&self, id: u8) -> PhysicalPort {
        self.ports
            .get(id as usize)
            .copied()
            .unwrap_or_else(|| PhysicalPort::new(id))
    }

    fn active_port_bitmask(&self) -> [u8; 32] {
        let mut mask = [0u8; 32];
        for p in self.ports.iter().filter(|p| p.ltssm != LtssmState::Disabled) {
            mask[p.id as usize / 8] |= 1 << (p.id % 8);
        }
        mask
    }

    fn active_vcs_bitmask(&self) -> [u8; 32] {
        let mut mask = [0u8; 32];
        for v in 0..self.num_vcs {
            mask[v as usize / 8] |= 1 << (v % 8);
        }
        mask
    }

    /// Identify Switch Device response payload
    pub fn identify(&self) -> IdentifySwitchResp {
        IdentifySwitchResp {
            ingress_port_id: self.ingress_port,
            rsvd: 0,
            num_physical_ports: self.ports.len() as u8,
            num_vcs: self.num_vcs,
            active_port_bitmask: self.active_port_bitmask(),
            active_vcs_bitmask: self.active_vcs_bitmask(),
            num_total_vppb: self.total_vppb,
            num_active_vppb: self.active_vppb,
        }
    }
}
