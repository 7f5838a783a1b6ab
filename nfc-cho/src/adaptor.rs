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

//! LLCP adaptor: NDEF reassembly over a data-link connection and the
//! event loop that drives the session state machine.

use crate::llcp::{LlcpLink, SapEvent};
use crate::msg::AcInfo;
use crate::sm::{ChoSession, RandomSource};
use crate::{ChoAppEvent, ChoConfig, ChoEvent};
use log::{debug, error};
use nfc_ndef::registry::SharedRegistry;
use nfc_ndef::{msg as ndef, NdefError};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

/// Outcome of pulling queued LLCP bytes into the reassembly buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RxStatus {
    /// A complete NDEF message is buffered
    Complete,
    /// More segments are needed
    Incomplete,
    /// The bytes cannot become a valid NDEF message
    Invalid,
    /// No buffer could be allocated; the peer may retry
    TempMem,
    /// The message exceeds the per-connection buffer cap
    PermMem,
}

/// Accumulates LLCP segments until they validate as one NDEF message.
pub(crate) struct Reassembler {
    buf: Option<Vec<u8>>,
    cap: usize,
}

impl Reassembler {
    pub(crate) fn new(cap: usize) -> Reassembler {
        Reassembler { buf: None, cap }
    }

    /// Drain everything LLCP has queued for this connection, then
    /// classify the buffer contents.
    pub(crate) fn read(
        &mut self,
        llcp: &mut dyn LlcpLink,
        local_sap: u8,
        remote_sap: u8,
    ) -> RxStatus {
        let mut buf = match self.buf.take() {
            Some(buf) => buf,
            None => {
                let mut fresh = Vec::new();
                if fresh.try_reserve_exact(self.cap).is_err() {
                    error!("failed to allocate reassembly buffer");
                    return RxStatus::TempMem;
                }
                fresh
            }
        };

        loop {
            let room = self.cap.saturating_sub(buf.len());
            let more = llcp.read_data_link_data(local_sap, remote_sap, room, &mut buf);
            if buf.len() >= self.cap && more {
                error!("handover message exceeds the {} byte buffer", self.cap);
                llcp.flush_data_link_rx(local_sap, remote_sap);
                return RxStatus::PermMem;
            }
            if !more {
                break;
            }
        }

        match ndef::validate(&buf, false) {
            Ok(()) => {
                self.buf = Some(buf);
                RxStatus::Complete
            }
            Err(NdefError::MsgTooShort)
            | Err(NdefError::NoMsgEnd)
            | Err(NdefError::LengthMismatch) => {
                debug!("need more data to complete the NDEF message");
                self.buf = Some(buf);
                RxStatus::Incomplete
            }
            Err(e) => {
                error!("failed to validate NDEF message: {e}");
                RxStatus::Invalid
            }
        }
    }

    /// Hand out the assembled message, leaving the buffer empty.
    pub(crate) fn take(&mut self) -> Vec<u8> {
        self.buf.take().unwrap_or_default()
    }

    pub(crate) fn clear(&mut self) {
        self.buf = None;
    }
}

/// Handle for submitting events to a running handover service. All
/// methods enqueue; the event loop does the work.
#[derive(Clone)]
pub struct ChoHandle {
    tx: UnboundedSender<ChoEvent>,
}

impl ChoHandle {
    fn send(&self, event: ChoEvent) {
        if self.tx.send(event).is_err() {
            error!("handover service is gone");
        }
    }

    /// Register the handover service; the outcome arrives as
    /// [`ChoAppEvent::Registered`].
    pub fn register(&self, enable_server: bool) {
        self.send(ChoEvent::ApiRegister { enable_server });
    }

    /// Tear the service down.
    pub fn deregister(&self) {
        self.send(ChoEvent::ApiDeregister);
    }

    /// Dial the peer's handover server.
    pub fn connect(&self) {
        self.send(ChoEvent::ApiConnect);
    }

    /// End the handover session.
    pub fn disconnect(&self) {
        self.send(ChoEvent::ApiDisconnect);
    }

    /// Send a Handover Request built from the carrier records.
    pub fn send_hr(&self, ac_info: Vec<AcInfo>, carriers: Vec<u8>) {
        self.send(ChoEvent::ApiSendHr { ac_info, carriers });
    }

    /// Answer a request with a Handover Select.
    pub fn send_hs(&self, ac_info: Vec<AcInfo>, carriers: Vec<u8>) {
        self.send(ChoEvent::ApiSendHs { ac_info, carriers });
    }

    /// Answer a request with an error record.
    pub fn send_select_error(&self, reason: u8, data: u32) {
        self.send(ChoEvent::ApiSendSelectError { reason, data });
    }

    /// Feed one LLCP SAP callback event into the session.
    pub fn llcp_event(&self, event: SapEvent) {
        self.send(ChoEvent::Llcp(event));
    }
}

/// Spawn the handover service: the session control block plus the task
/// draining its event queue. Returns the submit handle, the application
/// event stream and the task handle.
pub fn spawn(
    config: ChoConfig,
    llcp: Box<dyn LlcpLink>,
    registry: SharedRegistry,
    rng: Box<dyn RandomSource>,
) -> (ChoHandle, UnboundedReceiver<ChoAppEvent>, JoinHandle<()>) {
    let (evt_tx, evt_rx) = unbounded_channel();
    let (app_tx, app_rx) = unbounded_channel();
    let session = ChoSession::new(config, llcp, registry, rng, app_tx, evt_tx.clone());
    let task = tokio::spawn(run(session, evt_rx));
    (ChoHandle { tx: evt_tx }, app_rx, task)
}

/// The cooperative event loop: one event at a time, with the pinned
/// sleep tracking the session timer.
async fn run(mut session: ChoSession, mut events: UnboundedReceiver<ChoEvent>) {
    let timeout = sleep(Duration::MAX);
    // The max_deadline parks the sleep far in the future whenever no
    // session timer is armed.
    let max_deadline = timeout.deadline();
    tokio::pin!(timeout);
    loop {
        select! {
            event = events.recv() => match event {
                Some(event) => session.handle(event),
                None => break,
            },
            () = &mut timeout => session.handle(ChoEvent::Timeout),
        }
        match session.timer_deadline() {
            Some(deadline) => timeout.as_mut().reset(deadline),
            None => timeout.as_mut().reset(max_deadline),
        }
    }
    debug!("handover event loop terminated");
}
