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

//! The Connection Handover session state machine.
//!
//! One control block drives Disabled → Idle → W4CC → Connected. Every
//! external stimulus arrives as a [`ChoEvent`] and is processed to
//! completion before the next; the machine never suspends. Simultaneous
//! connection attempts are resolved with the random number carried in
//! the cr record.

use crate::adaptor::{Reassembler, RxStatus};
use crate::llcp::{ConnParams, DataStatus, LinkType, LlcpLink, SapEvent, DM_REASON_TEMP_REJECT};
use crate::msg::{self, AcInfo, MsgType};
use crate::{
    major, ChoAppEvent, ChoConfig, ChoEvent, DiscReason, Role, Status, SERVICE_NAME, VERSION,
};
use log::{debug, error, warn};
use nfc_ndef::registry::{Handle, Handler, SharedRegistry};
use nfc_ndef::wkt;
use nfc_ndef::Tnf;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, Instant};

/// Retry hint (seconds) sent with a temporary-memory error record.
const TEMP_MEM_RETRY_HINT: u32 = 1;

/// Source of collision-resolution random numbers. Injected so tests
/// and the test overrides can pin the draw.
pub trait RandomSource: Send {
    /// Draw a fresh 16-bit random number.
    fn draw_u16(&mut self) -> u16;
}

/// Default random source: folds the monotonic tick count into 16 bits.
pub struct TickRandom {
    origin: std::time::Instant,
}

impl TickRandom {
    /// Create a tick-based random source.
    pub fn new() -> TickRandom {
        TickRandom { origin: std::time::Instant::now() }
    }
}

impl Default for TickRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for TickRandom {
    fn draw_u16(&mut self) -> u16 {
        let ticks = self.origin.elapsed().as_nanos() as u32;
        ((ticks >> 16) ^ ticks) as u16
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Disabled,
    Idle,
    W4Cc,
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubState {
    W4LocalHr,
    W4RemoteHs,
    W4LocalHs,
    W4RemoteHr,
}

/// Endpoints and send state of one data-link connection.
#[derive(Clone, Copy, Debug, Default)]
struct DataLink {
    local_sap: u8,
    remote_sap: u8,
    remote_miu: u16,
    congested: bool,
}

struct TxBuf {
    data: Vec<u8>,
    sent: usize,
}

/// The handover control block. Owned and mutated only by the event
/// loop; one event at a time.
pub struct ChoSession {
    state: State,
    substate: SubState,
    llcp_activated: bool,
    client_only: bool,
    server_sap: Option<u8>,
    client_sap: Option<u8>,
    local_link_miu: u16,
    link: DataLink,
    /// Second data link accepted while our own connect is pending.
    collision: Option<DataLink>,
    tx: Option<TxBuf>,
    rx: Reassembler,
    tx_random_number: u16,
    disc_reason: DiscReason,
    timer_deadline: Option<Instant>,
    config: ChoConfig,
    llcp: Box<dyn LlcpLink>,
    rng: Box<dyn RandomSource>,
    registry: SharedRegistry,
    ndef_handles: Vec<Handle>,
    app_tx: UnboundedSender<ChoAppEvent>,
    self_tx: UnboundedSender<ChoEvent>,
}

impl ChoSession {
    /// Create a control block in the Disabled state.
    pub fn new(
        config: ChoConfig,
        llcp: Box<dyn LlcpLink>,
        registry: SharedRegistry,
        rng: Box<dyn RandomSource>,
        app_tx: UnboundedSender<ChoAppEvent>,
        self_tx: UnboundedSender<ChoEvent>,
    ) -> ChoSession {
        let rx = Reassembler::new(config.pool_buf_size);
        ChoSession {
            state: State::Disabled,
            substate: SubState::W4LocalHr,
            llcp_activated: false,
            client_only: false,
            server_sap: None,
            client_sap: None,
            local_link_miu: 0,
            link: DataLink::default(),
            collision: None,
            tx: None,
            rx,
            tx_random_number: 0,
            disc_reason: DiscReason::InternalError,
            timer_deadline: None,
            config,
            llcp,
            rng,
            registry,
            ndef_handles: Vec::new(),
            app_tx,
            self_tx,
        }
    }

    /// Deadline of the armed session timer, if any. Read by the event
    /// loop to drive [`ChoEvent::Timeout`].
    pub fn timer_deadline(&self) -> Option<Instant> {
        self.timer_deadline
    }

    /// Process one event to completion.
    pub fn handle(&mut self, event: ChoEvent) {
        debug!("state {:?}/{:?}, event {:?}", self.state, self.substate, event);
        if matches!(event, ChoEvent::Timeout) {
            self.stop_timer();
        }
        match self.state {
            State::Disabled => self.on_disabled(event),
            State::Idle => self.on_idle(event),
            State::W4Cc => self.on_w4_cc(event),
            State::Connected => self.on_connected(event),
        }
    }

    fn emit(&self, event: ChoAppEvent) {
        let _ = self.app_tx.send(event);
    }

    fn start_timer(&mut self, period: Duration) {
        self.timer_deadline = Some(Instant::now() + period);
    }

    fn stop_timer(&mut self) {
        self.timer_deadline = None;
    }

    fn version(&self) -> u8 {
        self.config.test_version.unwrap_or(VERSION)
    }

    fn draw_random(&mut self) -> u16 {
        let number = match self.config.test_random {
            Some(fixed) => fixed,
            None => self.rng.draw_u16(),
        };
        debug!("tx_random_number = {number:#06x}");
        self.tx_random_number = number;
        number
    }

    fn conn_params(&self) -> ConnParams {
        ConnParams {
            miu: u16::min(self.local_link_miu, self.config.miu),
            rw: self.config.rw,
            service_name: None,
        }
    }

    /* ---------------- state handlers ---------------- */

    fn on_disabled(&mut self, event: ChoEvent) {
        match event {
            ChoEvent::ApiRegister { enable_server } => {
                let status = self.proc_api_reg(enable_server);
                if status == Status::Ok {
                    self.state = State::Idle;
                }
                self.emit(ChoAppEvent::Registered { status });

                if status == Status::Ok {
                    /* the LLCP link may already be up */
                    let (local_miu, _) = self.llcp.link_miu();
                    self.local_link_miu = local_miu;
                    if local_miu > 0 {
                        self.llcp_activated = true;
                        self.emit(ChoAppEvent::Activated { is_initiator: false });
                    }
                }
            }
            _ => warn!("unexpected event in Disabled"),
        }
    }

    fn on_idle(&mut self, event: ChoEvent) {
        match event {
            ChoEvent::ApiRegister { .. } => {
                self.emit(ChoAppEvent::Registered { status: Status::Failed });
            }
            ChoEvent::ApiDeregister => {
                self.proc_api_dereg();
                self.state = State::Disabled;
            }
            ChoEvent::ApiConnect => {
                if self.llcp_activated {
                    if self.create_connection() == Status::Ok {
                        self.state = State::W4Cc;
                    } else {
                        self.emit(ChoAppEvent::Disconnected {
                            reason: DiscReason::ConnectionFail,
                        });
                    }
                } else {
                    self.emit(ChoAppEvent::Disconnected { reason: DiscReason::LinkDeactivated });
                }
            }
            ChoEvent::ApiDisconnect => {
                /* nothing to disconnect */
                self.process_disconnection(DiscReason::ApiRequest);
            }
            ChoEvent::Llcp(SapEvent::ConnectInd { local_sap, remote_sap, miu }) => {
                let params = self.conn_params();
                self.llcp.connect_cfm(local_sap, remote_sap, &params);
                self.link =
                    DataLink { local_sap, remote_sap, remote_miu: miu, congested: false };
                self.substate = SubState::W4RemoteHr;
                self.state = State::Connected;
                self.emit(ChoAppEvent::Connected { initial_role: Role::Selector });
            }
            ChoEvent::Llcp(SapEvent::LinkStatus { is_activated, is_initiator }) => {
                if is_activated {
                    self.llcp_activated = true;
                    self.local_link_miu = self.llcp.link_miu().0;
                    self.emit(ChoAppEvent::Activated { is_initiator });
                } else {
                    self.llcp_activated = false;
                    self.emit(ChoAppEvent::Deactivated);
                }
            }
            ChoEvent::ApiSendHr { .. } | ChoEvent::ApiSendHs { .. } => {
                debug!("dropping handover message sent while idle");
            }
            ChoEvent::NdefTypeDispatch { data } => self.proc_ndef_type_dispatch(&data),
            _ => warn!("unexpected event in Idle"),
        }
    }

    fn on_w4_cc(&mut self, event: ChoEvent) {
        match event {
            ChoEvent::ApiRegister { .. } => {
                self.emit(ChoAppEvent::Registered { status: Status::Failed });
            }
            ChoEvent::ApiDeregister => {
                self.proc_api_dereg();
                self.state = State::Disabled;
            }
            ChoEvent::ApiConnect => {
                self.emit(ChoAppEvent::Disconnected { reason: DiscReason::AlreadyConnected });
            }
            ChoEvent::ApiDisconnect => {
                /* drop any collision connection we accepted */
                if let Some(shadow) = self.collision.take() {
                    self.llcp.disconnect_req(shadow.local_sap, shadow.remote_sap, false);
                }
                self.state = State::Idle;
                /* we cannot send DISC because we don't know the remote SAP */
                self.process_disconnection(DiscReason::ApiRequest);
            }
            ChoEvent::Llcp(SapEvent::ConnectResp { local_sap, remote_sap, miu }) => {
                self.state = State::Connected;
                self.substate = SubState::W4LocalHr;
                self.link =
                    DataLink { local_sap, remote_sap, remote_miu: miu, congested: false };
                self.emit(ChoAppEvent::Connected { initial_role: Role::Requester });
            }
            ChoEvent::Llcp(SapEvent::ConnectInd { local_sap, remote_sap, miu }) => {
                if self.collision.is_some() {
                    self.llcp.connect_reject(local_sap, remote_sap, DM_REASON_TEMP_REJECT);
                } else {
                    /* accept and remember it; roles resolve once a
                     * connect response or an Hr arrives */
                    let params = self.conn_params();
                    self.llcp.connect_cfm(local_sap, remote_sap, &params);
                    self.collision = Some(DataLink {
                        local_sap,
                        remote_sap,
                        remote_miu: miu,
                        congested: false,
                    });
                }
            }
            ChoEvent::Llcp(SapEvent::DataInd { local_sap, remote_sap }) => {
                self.on_data_ind(local_sap, remote_sap);
            }
            ChoEvent::Llcp(SapEvent::DisconnectResp { .. }) => {
                /* peer rejected our connect; if we already accepted its
                 * connection, continue there as selector */
                if let Some(shadow) = self.collision.take() {
                    self.link = shadow;
                    self.substate = SubState::W4RemoteHr;
                    self.state = State::Connected;
                    self.emit(ChoAppEvent::Connected { initial_role: Role::Selector });
                } else {
                    self.state = State::Idle;
                    self.process_disconnection(DiscReason::ConnectionFail);
                }
            }
            ChoEvent::Llcp(SapEvent::DisconnectInd { local_sap, remote_sap }) => {
                let is_shadow = self.collision.map_or(false, |shadow| {
                    shadow.local_sap == local_sap && shadow.remote_sap == remote_sap
                });
                if is_shadow {
                    self.collision = None;
                } else {
                    self.state = State::Idle;
                    self.process_disconnection(DiscReason::ConnectionFail);
                }
            }
            ChoEvent::Llcp(SapEvent::Congest { link_type, is_congested, .. }) => {
                if link_type == LinkType::DataLink {
                    if let Some(shadow) = &mut self.collision {
                        shadow.congested = is_congested;
                    }
                }
            }
            ChoEvent::ApiSendHr { .. } | ChoEvent::ApiSendHs { .. } => {
                debug!("dropping handover message sent while connecting");
            }
            ChoEvent::NdefTypeDispatch { data } => self.proc_ndef_type_dispatch(&data),
            _ => warn!("unexpected event in W4CC"),
        }
    }

    fn on_connected(&mut self, event: ChoEvent) {
        match event {
            ChoEvent::ApiRegister { .. } => {
                self.emit(ChoAppEvent::Registered { status: Status::Failed });
            }
            ChoEvent::ApiDeregister => {
                self.proc_api_dereg();
                self.state = State::Disabled;
            }
            ChoEvent::ApiConnect => {
                self.emit(ChoAppEvent::Disconnected { reason: DiscReason::AlreadyConnected });
            }
            ChoEvent::ApiDisconnect => {
                if let Some(shadow) = self.collision.take() {
                    self.llcp.disconnect_req(shadow.local_sap, shadow.remote_sap, false);
                }
                self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
                self.disc_reason = DiscReason::ApiRequest;
            }
            ChoEvent::ApiSendHr { ac_info, carriers } => {
                if self.substate == SubState::W4LocalHr {
                    let status = self.send_hr(&ac_info, &carriers);
                    if status == Status::Ok {
                        self.substate = SubState::W4RemoteHs;
                        self.start_timer(self.config.hs_timeout);
                    } else {
                        error!("failed to send Hr");
                        self.notify_tx_fail(status);
                    }
                } else {
                    error!("unexpected send Hr in {:?}", self.substate);
                    self.notify_tx_fail(Status::SemanticError);
                }
            }
            ChoEvent::ApiSendHs { ac_info, carriers } => {
                if self.substate == SubState::W4LocalHs {
                    let status = self.send_hs(&ac_info, &carriers);
                    if status == Status::Ok {
                        self.substate = SubState::W4RemoteHr;
                    } else {
                        error!("failed to send Hs");
                        self.notify_tx_fail(status);
                    }
                } else {
                    error!("unexpected send Hs in {:?}", self.substate);
                    self.notify_tx_fail(Status::SemanticError);
                }
            }
            ChoEvent::ApiSendSelectError { reason, data } => {
                if self.substate == SubState::W4LocalHs {
                    let status = self.send_hs_error(reason, data);
                    if status == Status::Ok {
                        self.substate = SubState::W4RemoteHr;
                    } else {
                        error!("failed to send Hs error record");
                        self.notify_tx_fail(status);
                    }
                } else {
                    error!("unexpected select error in {:?}", self.substate);
                    self.notify_tx_fail(Status::SemanticError);
                }
            }
            ChoEvent::Llcp(SapEvent::ConnectResp { local_sap, remote_sap, .. }) => {
                /* peer accepted our stale connect after we already
                 * accepted its own; drop the extra link */
                self.llcp.disconnect_req(local_sap, remote_sap, false);
            }
            ChoEvent::Llcp(SapEvent::ConnectInd { local_sap, remote_sap, .. }) => {
                self.llcp.connect_reject(local_sap, remote_sap, DM_REASON_TEMP_REJECT);
            }
            ChoEvent::Llcp(SapEvent::DataInd { local_sap, remote_sap }) => {
                self.on_data_ind(local_sap, remote_sap);
            }
            ChoEvent::Llcp(SapEvent::DisconnectInd { local_sap, remote_sap }) => {
                if self.link.local_sap == local_sap && self.link.remote_sap == remote_sap {
                    self.state = State::Idle;
                    self.process_disconnection(DiscReason::PeerRequest);
                } else {
                    /* the collision connection went away */
                    self.collision = None;
                }
            }
            ChoEvent::Llcp(SapEvent::DisconnectResp { local_sap, remote_sap }) => {
                if self.link.local_sap == local_sap && self.link.remote_sap == remote_sap {
                    self.state = State::Idle;
                    let reason = self.disc_reason;
                    self.process_disconnection(reason);
                } else {
                    self.collision = None;
                }
            }
            ChoEvent::Llcp(SapEvent::Congest {
                link_type,
                local_sap,
                remote_sap,
                is_congested,
            }) => {
                if link_type == LinkType::DataLink
                    && self.link.local_sap == local_sap
                    && self.link.remote_sap == remote_sap
                {
                    self.link.congested = is_congested;
                    if !is_congested {
                        let pending = self
                            .tx
                            .as_ref()
                            .map_or(false, |tx| tx.sent < tx.data.len());
                        if pending {
                            self.send_handover_msg();
                        }
                    }
                }
            }
            ChoEvent::Timeout => {
                match self.substate {
                    SubState::W4RemoteHs => error!("failed to receive Hs message"),
                    /* no complete Hr ever arrived; the application is
                     * not told about the partial one */
                    SubState::W4RemoteHr => error!("failed to receive Hr message"),
                    _ => {}
                }
                self.disc_reason = DiscReason::Timeout;
                self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
            }
            ChoEvent::NdefTypeDispatch { .. } => {
                /* negotiated handover is in progress, ignore static */
            }
            _ => warn!("unexpected event in Connected"),
        }
    }

    /* ---------------- registration ---------------- */

    fn proc_api_reg(&mut self, enable_server: bool) -> Status {
        if enable_server {
            self.server_sap = self.llcp.register_server(SERVICE_NAME);
            if self.server_sap.is_none() {
                error!("cannot register CHO server");
                return Status::Failed;
            }
        } else {
            self.client_sap = self.llcp.register_client();
            if self.client_sap.is_none() {
                error!("cannot register CHO client");
                return Status::Failed;
            }
            /* keep the client registered across disconnects so LLCP
             * still reports link status */
            self.client_only = true;
        }
        self.register_type_handlers();
        Status::Ok
    }

    /// Static handover: receive Hs and simplified carrier messages read
    /// from tags through the NDEF type registry.
    fn register_type_handlers(&mut self) {
        let Ok(mut registry) = self.registry.lock() else {
            error!("NDEF type registry is poisoned");
            return;
        };
        let types: [(Tnf, &[u8]); 3] = [
            (Tnf::WellKnown, wkt::HS_TYPE),
            (Tnf::Media, wkt::BT_OOB_TYPE),
            (Tnf::Media, wkt::WIFI_WSC_TYPE),
        ];
        for (tnf, type_name) in types {
            let tx = self.self_tx.clone();
            let handler: Handler = Box::new(move |_, data| {
                let _ = tx.send(ChoEvent::NdefTypeDispatch { data: data.to_vec() });
            });
            match registry.register(tnf, type_name, true, handler) {
                Ok(handle) => self.ndef_handles.push(handle),
                Err(e) => warn!("cannot register CHO NDEF handler: {e}"),
            }
        }
    }

    fn proc_api_dereg(&mut self) {
        if let Some(sap) = self.client_sap.take() {
            self.llcp.deregister(sap);
        }
        if let Some(sap) = self.server_sap.take() {
            self.llcp.deregister(sap);
        }
        if let Ok(mut registry) = self.registry.lock() {
            for handle in self.ndef_handles.drain(..) {
                registry.deregister(handle);
            }
        }
        self.stop_timer();
        self.llcp_activated = false;
        self.client_only = false;
        self.collision = None;
        self.tx = None;
        self.rx.clear();
    }

    /* ---------------- connection management ---------------- */

    fn create_connection(&mut self) -> Status {
        if self.client_sap.is_none() {
            self.client_sap = self.llcp.register_client();
        }
        let Some(sap) = self.client_sap else {
            error!("cannot register CHO client");
            return Status::Failed;
        };
        let mut params = self.conn_params();
        params.service_name = Some(SERVICE_NAME.to_owned());
        match self.llcp.connect_req(sap, &params) {
            DataStatus::Ok => Status::Ok,
            _ => Status::Failed,
        }
    }

    fn process_disconnection(&mut self, reason: DiscReason) {
        self.stop_timer();
        self.tx = None;
        self.rx.clear();
        /* when a server is registered, dropping the client would also
         * drop the link-status reports */
        if !self.client_only {
            if let Some(sap) = self.client_sap.take() {
                self.llcp.deregister(sap);
            }
        }
        self.collision = None;
        self.emit(ChoAppEvent::Disconnected { reason });
    }

    fn notify_tx_fail(&mut self, status: Status) {
        self.emit(ChoAppEvent::TxFail { status });
    }

    fn check_disconnect_collision(&mut self) {
        if let Some(shadow) = self.collision {
            self.llcp.disconnect_req(shadow.local_sap, shadow.remote_sap, false);
        }
    }

    /* ---------------- receive path ---------------- */

    /// Pull all queued LLCP bytes into the reassembly buffer and act on
    /// the outcome.
    fn on_data_ind(&mut self, local_sap: u8, remote_sap: u8) {
        self.stop_timer();
        let status = self.rx.read(self.llcp.as_mut(), local_sap, remote_sap);
        match status {
            RxStatus::TempMem => {
                error!("reassembly failed: temporary memory constraint");
                if self.substate == SubState::W4RemoteHr {
                    /* ask the requester to retry later */
                    let _ = self.send_hs_error(wkt::ERR_TEMP_MEM, TEMP_MEM_RETRY_HINT);
                } else {
                    self.disc_reason = DiscReason::InternalError;
                    self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
                }
            }
            RxStatus::PermMem => {
                error!("reassembly failed: permanent memory constraint");
                if self.substate == SubState::W4RemoteHr {
                    /* report our buffer size so the peer can shrink the
                     * message */
                    let _ =
                        self.send_hs_error(wkt::ERR_PERM_MEM, self.config.pool_buf_size as u32);
                } else {
                    self.disc_reason = DiscReason::InternalError;
                    self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
                }
            }
            RxStatus::Invalid => {
                error!("invalid handover NDEF message");
                if self.substate == SubState::W4RemoteHr {
                    /* stay quiet, the requester will time out */
                } else {
                    self.disc_reason = DiscReason::InvalidMsg;
                    self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
                }
            }
            RxStatus::Incomplete => {
                if self.substate == SubState::W4RemoteHr {
                    self.start_timer(self.config.segmented_hr_timeout);
                }
            }
            RxStatus::Complete => self.rx_handover_msg(),
        }
    }

    /// A complete handover message is in the reassembly buffer.
    fn rx_handover_msg(&mut self) {
        if self.state == State::W4Cc {
            /* the peer sent its Hr before accepting our connection */
            if let Some(shadow) = self.collision.take() {
                self.link = shadow;
            }
            self.substate = SubState::W4RemoteHr;
            self.state = State::Connected;
            self.emit(ChoAppEvent::Connected { initial_role: Role::Selector });
        }
        self.proc_rx_handover_msg();
    }

    fn proc_rx_handover_msg(&mut self) {
        let rx_msg = self.rx.take();
        let msg_type = msg::msg_type(&rx_msg);
        let mut free_tx = true;

        match self.substate {
            SubState::W4RemoteHs => match msg_type {
                /* we sent Hr and received Hr: collision */
                MsgType::Hr => free_tx = self.resolve_collision(&rx_msg),
                MsgType::Hs => {
                    self.proc_hs(&rx_msg);
                    self.substate = SubState::W4LocalHr;
                }
                _ => {
                    error!("unknown message type while waiting for Hs");
                    self.check_disconnect_collision();
                    self.disc_reason = DiscReason::UnknownMsg;
                    self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
                }
            },
            SubState::W4RemoteHr => match msg_type {
                MsgType::Hr => {
                    self.proc_hr(&rx_msg);
                    /* on a parse error the peer runs into its timeout */
                    self.substate = SubState::W4LocalHs;
                }
                _ => {
                    error!("expecting a Handover Request");
                    self.check_disconnect_collision();
                    self.disc_reason = DiscReason::SemanticError;
                    self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
                }
            },
            _ => {
                error!("unexpected data in substate {:?}", self.substate);
                self.check_disconnect_collision();
                self.disc_reason = DiscReason::SemanticError;
                self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
            }
        }

        if free_tx {
            self.tx = None;
        }
    }

    /* ---------------- collision resolution ---------------- */

    /// Both sides sent Hr. Returns whether the TX buffer can be freed.
    fn resolve_collision(&mut self, rx_msg: &[u8]) -> bool {
        match self.local_device_role(rx_msg) {
            Role::Selector => {
                /* the peer won; clean up our own outgoing connection */
                if let Some(shadow) = self.collision.take() {
                    self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
                    self.link = shadow;
                }
                self.substate = SubState::W4LocalHs;
                self.proc_hr(rx_msg);
                true
            }
            Role::Undecided => {
                /* equal random numbers: redraw and resend our Hr */
                let new_random = self.draw_random();
                let mut status = Status::Failed;
                if let Some(tx) = self.tx.as_mut() {
                    if msg::update_random_number(&mut tx.data, new_random).is_ok() {
                        tx.sent = 0;
                        status = Status::Ok;
                    }
                }
                if status == Status::Ok {
                    status = self.send_handover_msg();
                }

                if status == Status::Failed {
                    error!("failed to resend Hr with a new random number");
                    self.disc_reason = DiscReason::InternalError;
                    self.llcp.disconnect_req(self.link.local_sap, self.link.remote_sap, false);
                    true
                } else {
                    self.start_timer(self.config.hs_timeout);
                    /* the TX message is being reused */
                    false
                }
            }
            Role::Requester => {
                /* we won; wait for the peer's Hs */
                true
            }
        }
    }

    /// Compare our random number with the peer's; the LSB decides which
    /// direction the comparison runs so both sides agree.
    fn local_device_role(&self, rx_msg: &[u8]) -> Role {
        let Ok(hr) = msg::parse_hr(rx_msg) else {
            error!("failed to parse hr record");
            return Role::Undecided;
        };
        let local = self.tx_random_number;
        let remote = hr.random_number;
        debug!("tx_random_number={local:#06x}, rx_random_number={remote:#06x}");

        if local == remote {
            Role::Undecided
        } else if (local ^ remote) & 0x0001 == 0 {
            if local > remote {
                Role::Selector
            } else {
                Role::Requester
            }
        } else if local > remote {
            Role::Requester
        } else {
            Role::Selector
        }
    }

    /* ---------------- message processing ---------------- */

    fn proc_hr(&mut self, rx_msg: &[u8]) {
        let hr = match msg::parse_hr(rx_msg) {
            Ok(hr) => hr,
            Err(_) => {
                error!("failed to parse hr record");
                return;
            }
        };

        if hr.version != self.version() {
            debug!("version {:#04x} not matched", hr.version);
            if major(hr.version) > major(self.version()) {
                /* newer peer: answer with an empty Hs */
                let _ = self.send_hs(&[], &[]);
                return;
            }
        }

        if msg::verify_carrier_refs(rx_msg, &hr.ac).is_err() {
            error!("failed to parse carrier configuration");
            self.emit(ChoAppEvent::Request {
                status: Status::Failed,
                ac: Vec::new(),
                ref_ndef: Vec::new(),
            });
            return;
        }

        let ref_ndef = if hr.ac.is_empty() { Vec::new() } else { rx_msg.to_vec() };
        self.emit(ChoAppEvent::Request { status: Status::Ok, ac: hr.ac, ref_ndef });
    }

    fn proc_hs(&mut self, rx_msg: &[u8]) {
        let failed = |session: &ChoSession| {
            session.emit(ChoAppEvent::Select {
                status: Status::Failed,
                ac: Vec::new(),
                ref_ndef: Vec::new(),
            });
        };

        let hs = match msg::parse_hs(rx_msg) {
            Ok(hs) => hs,
            Err(_) => {
                error!("failed to parse hs record");
                failed(self);
                return;
            }
        };

        if let Some(err) = hs.error {
            self.emit(ChoAppEvent::SelectError { reason: err.reason, data: err.data });
            return;
        }

        if hs.version != self.version() {
            error!("version {:#04x} not matched", hs.version);
            failed(self);
            return;
        }

        if msg::verify_carrier_refs(rx_msg, &hs.ac).is_err() {
            error!("failed to parse carrier configuration");
            failed(self);
            return;
        }

        let ref_ndef =
            if hs.ac.is_empty() { Vec::new() } else { msg::hs_tail(rx_msg).unwrap_or_default() };
        self.emit(ChoAppEvent::Select { status: Status::Ok, ac: hs.ac, ref_ndef });
    }

    /// A registered NDEF type handler matched a message read from a tag
    /// (static handover). Ignored while a negotiated handover runs.
    fn proc_ndef_type_dispatch(&mut self, data: &[u8]) {
        if self.state == State::Connected {
            return;
        }
        match msg::msg_type(data) {
            MsgType::Hs => self.proc_hs(data),
            MsgType::BtOob | MsgType::Wifi => {
                self.emit(ChoAppEvent::Select {
                    status: Status::Ok,
                    ac: msg::simplified_select(),
                    ref_ndef: data.to_vec(),
                });
            }
            _ => error!("unexpected CHO message type"),
        }
    }

    /* ---------------- transmit path ---------------- */

    fn send_hr(&mut self, ac_info: &[AcInfo], carriers: &[u8]) -> Status {
        let random = self.draw_random();
        let version = self.version();
        match msg::build_hr(version, random, ac_info, carriers, self.config.pool_buf_size) {
            Ok(data) => {
                self.tx = Some(TxBuf { data, sent: 0 });
                match self.send_handover_msg() {
                    Status::Congested => Status::Ok,
                    status => status,
                }
            }
            Err(status) => status,
        }
    }

    fn send_hs(&mut self, ac_info: &[AcInfo], carriers: &[u8]) -> Status {
        let version = self.version();
        match msg::build_hs(version, ac_info, carriers, self.config.pool_buf_size) {
            Ok(data) => {
                self.tx = Some(TxBuf { data, sent: 0 });
                match self.send_handover_msg() {
                    Status::Congested => Status::Ok,
                    status => status,
                }
            }
            Err(status) => status,
        }
    }

    fn send_hs_error(&mut self, reason: u8, data: u32) -> Status {
        let version = self.version();
        match msg::build_hs_error(version, reason, data, self.config.pool_buf_size) {
            Ok(bytes) => {
                self.tx = Some(TxBuf { data: bytes, sent: 0 });
                match self.send_handover_msg() {
                    Status::Congested => Status::Ok,
                    status => status,
                }
            }
            Err(status) => status,
        }
    }

    /// Push TX segments of at most the remote MIU until the message is
    /// out or the connection congests.
    fn send_handover_msg(&mut self) -> Status {
        let Some(mut tx) = self.tx.take() else { return Status::Failed };
        debug!("send_handover_msg size={} sent={}", tx.data.len(), tx.sent);

        let mut status = Status::Failed;
        let mut drop_tx = false;
        while !self.link.congested && tx.sent < tx.data.len() {
            let seg_end =
                usize::min(tx.sent + usize::from(self.link.remote_miu), tx.data.len());
            match self.llcp.send_data(
                self.link.local_sap,
                self.link.remote_sap,
                &tx.data[tx.sent..seg_end],
            ) {
                DataStatus::Ok => {
                    tx.sent = seg_end;
                    status = Status::Ok;
                }
                DataStatus::Congested => {
                    debug!("data link connection is congested");
                    tx.sent = seg_end;
                    self.link.congested = true;
                    status = Status::Congested;
                    break;
                }
                DataStatus::Fail => {
                    status = Status::Failed;
                    drop_tx = true;
                    break;
                }
            }
        }

        /* keep the buffer otherwise: a collision may need the same Hr
         * resent with a fresh random number */
        if !drop_tx {
            self.tx = Some(tx);
        }
        status
    }
}
