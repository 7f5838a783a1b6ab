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

//! NFC Connection Handover.
//!
//! Implements the negotiated handover protocol over an LLCP data-link
//! connection: Handover Request/Select message assembly, the session
//! state machine with random-number collision resolution, and the
//! adaptor that reassembles and segments NDEF messages on the link.

pub mod adaptor;
pub mod llcp;
pub mod msg;
pub mod sm;

pub use adaptor::{spawn, ChoHandle};
pub use sm::{ChoSession, RandomSource, TickRandom};

use crate::llcp::SapEvent;
use crate::msg::{AcInfo, AcRecord};
use thiserror::Error;
use tokio::time::Duration;

/// Well-known LLCP service name of the handover server.
pub const SERVICE_NAME: &str = "urn:nfc:sn:handover";

/// Connection Handover version implemented here, major in the high
/// nibble.
pub const VERSION: u8 = 0x12;

/// Data-link MIU cap for the handover connection.
pub const HANDOVER_MIU: u16 = 128;

/// Longest accepted carrier/aux data reference name.
pub const MAX_REF_NAME_LEN: usize = 16;

/// Most auxiliary data references accepted per alternative carrier.
pub const MAX_AUX_DATA_COUNT: usize = 4;

/// Major version nibble.
pub fn major(version: u8) -> u8 {
    version >> 4
}

/// Minor version nibble.
pub fn minor(version: u8) -> u8 {
    version & 0x0f
}

/// Operation status surfaced to applications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Status {
    /// Success
    #[error("ok")]
    Ok,
    /// Generic failure
    #[error("failed")]
    Failed,
    /// The data link is congested; transmission resumes on its own
    #[error("congested")]
    Congested,
    /// Command not acceptable in the current state
    #[error("semantic error")]
    SemanticError,
    /// A length field is out of range
    #[error("bad length")]
    BadLength,
    /// No buffer space
    #[error("no buffers")]
    NoBuffers,
    /// Malformed message
    #[error("syntax error")]
    SyntaxError,
    /// Unknown handle
    #[error("bad handle")]
    BadHandle,
}

/// Why a handover session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscReason {
    /// The local application asked for the disconnect
    ApiRequest,
    /// The peer disconnected
    PeerRequest,
    /// The peer did not produce a handover message in time
    Timeout,
    /// The data-link connection could not be created
    ConnectionFail,
    /// The LLCP link went down
    LinkDeactivated,
    /// A connection already exists
    AlreadyConnected,
    /// The peer sent a message of unknown type
    UnknownMsg,
    /// The peer sent a message illegal in the current state
    SemanticError,
    /// The peer sent an invalid NDEF message
    InvalidMsg,
    /// Local failure
    InternalError,
}

/// Role taken after connection setup or collision resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Proposes alternative carriers with Hr
    Requester,
    /// Picks a carrier and answers with Hs
    Selector,
    /// Both peers drew the same random number; roles not yet decided
    Undecided,
}

/// Tunables of the handover session.
#[derive(Clone, Debug)]
pub struct ChoConfig {
    /// MIU offered on the handover data-link connection
    pub miu: u16,
    /// Receive window offered on the data-link connection
    pub rw: u8,
    /// How long to wait for the peer's Hs after sending Hr
    pub hs_timeout: Duration,
    /// Longest allowed gap between segments of an incoming Hr
    pub segmented_hr_timeout: Duration,
    /// Per-message buffer cap for assembly and reassembly
    pub pool_buf_size: usize,
    /// Test override: fixed collision-resolution random number
    pub test_random: Option<u16>,
    /// Test override: version byte sent in Hr/Hs
    pub test_version: Option<u8>,
}

impl Default for ChoConfig {
    fn default() -> Self {
        ChoConfig {
            miu: HANDOVER_MIU,
            rw: 4,
            hs_timeout: Duration::from_millis(1000),
            segmented_hr_timeout: Duration::from_millis(1000),
            pool_buf_size: 2048,
            test_random: None,
            test_version: None,
        }
    }
}

/// Internal event alphabet of the session state machine. API calls,
/// LLCP callbacks and timer expiry all arrive through this one queue.
#[derive(Debug)]
pub enum ChoEvent {
    /// Application registers the handover service
    ApiRegister {
        /// Listen for incoming handover connections
        enable_server: bool,
    },
    /// Application tears the service down
    ApiDeregister,
    /// Application dials the peer's handover server
    ApiConnect,
    /// Application ends the session
    ApiDisconnect,
    /// Application sends a Handover Request
    ApiSendHr {
        /// One entry per alternative carrier
        ac_info: Vec<AcInfo>,
        /// NDEF message with the carrier configuration records
        carriers: Vec<u8>,
    },
    /// Application answers with a Handover Select
    ApiSendHs {
        /// Selected carriers
        ac_info: Vec<AcInfo>,
        /// NDEF message with the carrier configuration records
        carriers: Vec<u8>,
    },
    /// Application answers with a Handover Select error record
    ApiSendSelectError {
        /// Error reason code
        reason: u8,
        /// Reason-specific datum
        data: u32,
    },
    /// Event from the LLCP link
    Llcp(SapEvent),
    /// A registered NDEF type handler matched a tag read (static
    /// handover)
    NdefTypeDispatch {
        /// The dispatched NDEF message
        data: Vec<u8>,
    },
    /// The session timer expired
    Timeout,
}

/// Events delivered to the application.
#[derive(Debug)]
pub enum ChoAppEvent {
    /// Outcome of `register`
    Registered {
        /// Registration status
        status: Status,
    },
    /// The LLCP link came up
    Activated {
        /// Local device initiated the link
        is_initiator: bool,
    },
    /// The LLCP link went down
    Deactivated,
    /// A handover data-link connection is established
    Connected {
        /// Role until any collision is resolved
        initial_role: Role,
    },
    /// The peer sent a Handover Request; answer with `send_hs` or
    /// `send_select_error`
    Request {
        /// Parse status
        status: Status,
        /// Alternative carriers proposed by the peer
        ac: Vec<AcRecord>,
        /// The carrier-configuration NDEF message
        ref_ndef: Vec<u8>,
    },
    /// The peer answered our Hr with a Handover Select
    Select {
        /// Parse status
        status: Status,
        /// Carriers the peer selected
        ac: Vec<AcRecord>,
        /// The carrier-configuration NDEF message
        ref_ndef: Vec<u8>,
    },
    /// The peer answered with an error record
    SelectError {
        /// Error reason code
        reason: u8,
        /// Reason-specific datum
        data: u32,
    },
    /// A send failed; the session stays up
    TxFail {
        /// Failure status
        status: Status,
    },
    /// Terminal event: the session is gone
    Disconnected {
        /// Why
        reason: DiscReason,
    },
}
