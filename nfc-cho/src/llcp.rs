// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The seam towards the LLCP layer.
//!
//! The handover core neither owns nor drives LLCP; it receives the SAP
//! callback events of one service access point as [`SapEvent`]s on its
//! queue and issues link operations through the [`LlcpLink`] trait.

/// Disconnected-mode reason: connect request rejected temporarily.
pub const DM_REASON_TEMP_REJECT: u8 = 0x20;

/// Which kind of LLCP traffic a congestion report concerns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkType {
    /// Connectionless (logical) traffic
    Logical,
    /// A data-link connection
    DataLink,
}

/// The LLCP SAP callback events consumed by the handover session.
#[derive(Clone, Debug)]
pub enum SapEvent {
    /// Data is queued on a data-link connection
    DataInd {
        /// Local endpoint
        local_sap: u8,
        /// Remote endpoint
        remote_sap: u8,
    },
    /// The peer requests a data-link connection
    ConnectInd {
        /// Local endpoint the peer dialed
        local_sap: u8,
        /// Remote endpoint
        remote_sap: u8,
        /// MIU offered by the peer
        miu: u16,
    },
    /// The peer accepted our connect request
    ConnectResp {
        /// Local endpoint
        local_sap: u8,
        /// Remote endpoint
        remote_sap: u8,
        /// MIU granted by the peer
        miu: u16,
    },
    /// The peer disconnected, or rejected our connect request
    DisconnectInd {
        /// Local endpoint
        local_sap: u8,
        /// Remote endpoint
        remote_sap: u8,
    },
    /// Our disconnect completed, or our connect was refused
    DisconnectResp {
        /// Local endpoint
        local_sap: u8,
        /// Remote endpoint
        remote_sap: u8,
    },
    /// Congestion started or cleared
    Congest {
        /// Connectionless or data-link traffic
        link_type: LinkType,
        /// Local endpoint
        local_sap: u8,
        /// Remote endpoint
        remote_sap: u8,
        /// Congested right now
        is_congested: bool,
    },
    /// The LLCP link itself came up or went down
    LinkStatus {
        /// Link is up
        is_activated: bool,
        /// Local device initiated the link
        is_initiator: bool,
    },
}

/// Outcome of handing a PDU to LLCP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataStatus {
    /// Accepted
    Ok,
    /// Accepted, but the connection is now congested
    Congested,
    /// Rejected
    Fail,
}

/// Parameters of a data-link connection.
#[derive(Clone, Debug, Default)]
pub struct ConnParams {
    /// Maximum information unit
    pub miu: u16,
    /// Receive window
    pub rw: u8,
    /// Service name, for connect-by-name requests
    pub service_name: Option<String>,
}

/// Operations the handover session performs on the LLCP layer.
pub trait LlcpLink: Send {
    /// Register a server endpoint under a service name. Returns the SAP.
    fn register_server(&mut self, service_name: &str) -> Option<u8>;

    /// Register a client endpoint. Returns the SAP.
    fn register_client(&mut self) -> Option<u8>;

    /// Release an endpoint; any data link on it is disconnected.
    fn deregister(&mut self, sap: u8);

    /// Dial the service named in `params` from `local_sap`.
    fn connect_req(&mut self, local_sap: u8, params: &ConnParams) -> DataStatus;

    /// Accept a pending connect indication.
    fn connect_cfm(&mut self, local_sap: u8, remote_sap: u8, params: &ConnParams);

    /// Reject a pending connect indication.
    fn connect_reject(&mut self, local_sap: u8, remote_sap: u8, reason: u8);

    /// Start disconnecting a data-link connection.
    fn disconnect_req(&mut self, local_sap: u8, remote_sap: u8, flush: bool);

    /// Queue one PDU on the connection.
    fn send_data(&mut self, local_sap: u8, remote_sap: u8, data: &[u8]) -> DataStatus;

    /// Append up to `max_len` queued receive bytes to `out`. Returns
    /// true while more data remains queued.
    fn read_data_link_data(
        &mut self,
        local_sap: u8,
        remote_sap: u8,
        max_len: usize,
        out: &mut Vec<u8>,
    ) -> bool;

    /// Drop all queued receive data of the connection.
    fn flush_data_link_rx(&mut self, local_sap: u8, remote_sap: u8);

    /// (local, remote) MIU of the LLCP link; local is zero while the
    /// link is down.
    fn link_miu(&self) -> (u16, u16);
}
