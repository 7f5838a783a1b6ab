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

//! End-to-end negotiated handover between two sessions connected by an
//! in-memory LLCP pipe.

use nfc_cho::llcp::{ConnParams, DataStatus, LlcpLink, SapEvent};
use nfc_cho::msg::{AcInfo, Cps};
use nfc_cho::sm::RandomSource;
use nfc_cho::{spawn, ChoAppEvent, ChoConfig, ChoHandle, DiscReason, Role, Status};
use nfc_ndef::registry::TypeRegistry;
use nfc_ndef::wkt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};

const SERVER_SAP: u8 = 0x10;
const CLIENT_SAP: u8 = 0x20;

type RxMap = Arc<Mutex<HashMap<(u8, u8), VecDeque<Vec<u8>>>>>;

/// One side of the in-memory LLCP link. Wire operations enqueue SAP
/// events on the peer's (or our own) service queue, exactly one per
/// LLCP primitive; sent data lands in the peer's receive queues.
#[derive(Clone, Default)]
struct PipeEnd {
    peer: Arc<Mutex<Option<ChoHandle>>>,
    local: Arc<Mutex<Option<ChoHandle>>>,
    /// Receive queues keyed by (local_sap, remote_sap) on this side.
    rx: RxMap,
    /// The peer's receive queues.
    peer_rx: RxMap,
}

impl PipeEnd {
    fn peer_event(&self, event: SapEvent) {
        if let Some(handle) = self.peer.lock().unwrap().as_ref() {
            handle.llcp_event(event);
        }
    }

    fn local_event(&self, event: SapEvent) {
        if let Some(handle) = self.local.lock().unwrap().as_ref() {
            handle.llcp_event(event);
        }
    }
}

impl LlcpLink for PipeEnd {
    fn register_server(&mut self, _service_name: &str) -> Option<u8> {
        Some(SERVER_SAP)
    }

    fn register_client(&mut self) -> Option<u8> {
        Some(CLIENT_SAP)
    }

    fn deregister(&mut self, _sap: u8) {}

    fn connect_req(&mut self, local_sap: u8, params: &ConnParams) -> DataStatus {
        self.peer_event(SapEvent::ConnectInd {
            local_sap: SERVER_SAP,
            remote_sap: local_sap,
            miu: params.miu,
        });
        DataStatus::Ok
    }

    fn connect_cfm(&mut self, local_sap: u8, remote_sap: u8, params: &ConnParams) {
        self.peer_event(SapEvent::ConnectResp {
            local_sap: remote_sap,
            remote_sap: local_sap,
            miu: params.miu,
        });
    }

    fn connect_reject(&mut self, local_sap: u8, remote_sap: u8, _reason: u8) {
        self.peer_event(SapEvent::DisconnectResp {
            local_sap: remote_sap,
            remote_sap: local_sap,
        });
    }

    fn disconnect_req(&mut self, local_sap: u8, remote_sap: u8, _flush: bool) {
        self.peer_event(SapEvent::DisconnectInd {
            local_sap: remote_sap,
            remote_sap: local_sap,
        });
        self.local_event(SapEvent::DisconnectResp { local_sap, remote_sap });
    }

    fn send_data(&mut self, local_sap: u8, remote_sap: u8, data: &[u8]) -> DataStatus {
        self.peer_rx
            .lock()
            .unwrap()
            .entry((remote_sap, local_sap))
            .or_default()
            .push_back(data.to_vec());
        self.peer_event(SapEvent::DataInd { local_sap: remote_sap, remote_sap: local_sap });
        DataStatus::Ok
    }

    fn read_data_link_data(
        &mut self,
        local_sap: u8,
        remote_sap: u8,
        max_len: usize,
        out: &mut Vec<u8>,
    ) -> bool {
        let mut rx = self.rx.lock().unwrap();
        let Some(queue) = rx.get_mut(&(local_sap, remote_sap)) else { return false };
        if let Some(mut seg) = queue.pop_front() {
            if seg.len() > max_len {
                let rest = seg.split_off(max_len);
                queue.push_front(rest);
            }
            out.extend_from_slice(&seg);
        }
        !queue.is_empty()
    }

    fn flush_data_link_rx(&mut self, local_sap: u8, remote_sap: u8) {
        self.rx.lock().unwrap().remove(&(local_sap, remote_sap));
    }

    fn link_miu(&self) -> (u16, u16) {
        (128, 128)
    }
}

struct FixedRandom(u16);

impl RandomSource for FixedRandom {
    fn draw_u16(&mut self) -> u16 {
        self.0
    }
}

struct Side {
    handle: ChoHandle,
    events: UnboundedReceiver<ChoAppEvent>,
}

impl Side {
    async fn next(&mut self) -> ChoAppEvent {
        timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for an application event")
            .expect("application event channel closed")
    }

    async fn expect_registered(&mut self) {
        assert!(matches!(self.next().await, ChoAppEvent::Registered { status: Status::Ok }));
        assert!(matches!(self.next().await, ChoAppEvent::Activated { .. }));
    }
}

/// Two sessions joined back-to-back; each side's random number is
/// pinned so collision outcomes are deterministic.
fn link_pair(random_a: u16, random_b: u16) -> (Side, Side) {
    let _ = env_logger::builder().is_test(true).try_init();
    let slot_a: Arc<Mutex<Option<ChoHandle>>> = Arc::default();
    let slot_b: Arc<Mutex<Option<ChoHandle>>> = Arc::default();
    let rx_a: RxMap = Arc::default();
    let rx_b: RxMap = Arc::default();

    let end_a = PipeEnd {
        peer: Arc::clone(&slot_b),
        local: Arc::clone(&slot_a),
        rx: Arc::clone(&rx_a),
        peer_rx: Arc::clone(&rx_b),
    };
    let end_b = PipeEnd { peer: slot_a, local: slot_b, rx: rx_b, peer_rx: rx_a };

    let (handle_a, events_a, _task_a) = spawn(
        ChoConfig::default(),
        Box::new(end_a.clone()),
        TypeRegistry::new_shared(),
        Box::new(FixedRandom(random_a)),
    );
    let (handle_b, events_b, _task_b) = spawn(
        ChoConfig::default(),
        Box::new(end_b.clone()),
        TypeRegistry::new_shared(),
        Box::new(FixedRandom(random_b)),
    );

    *end_a.local.lock().unwrap() = Some(handle_a.clone());
    *end_b.local.lock().unwrap() = Some(handle_b.clone());

    (Side { handle: handle_a, events: events_a }, Side { handle: handle_b, events: events_b })
}

fn bt_carrier() -> (Vec<AcInfo>, Vec<u8>) {
    let mut carriers = Vec::new();
    wkt::add_media_bt_oob(&mut carriers, 512, b"0", &[0x20, 0x00, 0x01, 0x02, 0x03, 0x04])
        .unwrap();
    (vec![AcInfo { cps: Cps::Active, num_aux_data: 0 }], carriers)
}

#[tokio::test]
async fn negotiated_handover_happy_path() {
    let (mut requester, mut selector) = link_pair(0x1234, 0x4321);

    requester.handle.register(true);
    selector.handle.register(true);
    requester.expect_registered().await;
    selector.expect_registered().await;

    requester.handle.connect();
    assert!(matches!(
        selector.next().await,
        ChoAppEvent::Connected { initial_role: Role::Selector }
    ));
    assert!(matches!(
        requester.next().await,
        ChoAppEvent::Connected { initial_role: Role::Requester }
    ));

    let (ac, carriers) = bt_carrier();
    requester.handle.send_hr(ac, carriers);

    match selector.next().await {
        ChoAppEvent::Request { status, ac, ref_ndef } => {
            assert_eq!(status, Status::Ok);
            assert_eq!(ac.len(), 1);
            assert_eq!(ac[0].carrier_data_ref, b"0");
            assert!(!ref_ndef.is_empty());
        }
        other => panic!("expected Request, got {other:?}"),
    }

    let (ac, carriers) = bt_carrier();
    selector.handle.send_hs(ac, carriers);

    match requester.next().await {
        ChoAppEvent::Select { status, ac, ref_ndef } => {
            assert_eq!(status, Status::Ok);
            assert_eq!(ac.len(), 1);
            assert_eq!(ac[0].cps, Cps::Active);
            assert!(!ref_ndef.is_empty());
        }
        other => panic!("expected Select, got {other:?}"),
    }

    requester.handle.disconnect();
    assert!(matches!(
        requester.next().await,
        ChoAppEvent::Disconnected { reason: DiscReason::ApiRequest }
    ));
    assert!(matches!(
        selector.next().await,
        ChoAppEvent::Disconnected { reason: DiscReason::PeerRequest }
    ));
}

#[tokio::test]
async fn simultaneous_requests_resolve_to_complementary_roles() {
    /* LSBs equal: the larger number becomes the selector */
    let (mut side_a, mut side_b) = link_pair(0x1235, 0xabcd);

    side_a.handle.register(true);
    side_b.handle.register(true);
    side_a.expect_registered().await;
    side_b.expect_registered().await;

    /* both dial at the same time and both send an Hr */
    side_a.handle.connect();
    side_b.handle.connect();
    assert!(matches!(side_a.next().await, ChoAppEvent::Connected { .. }));
    assert!(matches!(side_b.next().await, ChoAppEvent::Connected { .. }));

    let (ac, carriers) = bt_carrier();
    side_a.handle.send_hr(ac.clone(), carriers.clone());
    side_b.handle.send_hr(ac, carriers);

    /* side B drew the larger number: it resolves to selector and sees
     * the request; side A stays requester and sees the select */
    match side_b.next().await {
        ChoAppEvent::Request { status, ac, .. } => {
            assert_eq!(status, Status::Ok);
            assert_eq!(ac.len(), 1);
        }
        other => panic!("expected Request on the selector side, got {other:?}"),
    }

    let (ac, carriers) = bt_carrier();
    side_b.handle.send_hs(ac, carriers);

    match side_a.next().await {
        ChoAppEvent::Select { status, ac, .. } => {
            assert_eq!(status, Status::Ok);
            assert_eq!(ac.len(), 1);
        }
        other => panic!("expected Select on the requester side, got {other:?}"),
    }

    side_a.handle.disconnect();
    assert!(matches!(side_a.next().await, ChoAppEvent::Disconnected { .. }));
    assert!(matches!(side_b.next().await, ChoAppEvent::Disconnected { .. }));
}

#[tokio::test]
async fn static_handover_select_via_type_registry() {
    let registry = TypeRegistry::new_shared();
    let (handle, mut events, _task) = spawn(
        ChoConfig::default(),
        Box::new(PipeEnd::default()),
        Arc::clone(&registry),
        Box::new(FixedRandom(1)),
    );
    handle.register(true);
    assert!(matches!(
        timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap(),
        ChoAppEvent::Registered { status: Status::Ok }
    ));
    // the pipe reports the link as up
    assert!(matches!(
        timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap(),
        ChoAppEvent::Activated { .. }
    ));

    /* a tag read produced a simplified Bluetooth OOB message */
    let mut tag_msg = Vec::new();
    wkt::add_media_bt_oob(&mut tag_msg, 512, b"0", &[0x22, 0x11]).unwrap();
    registry.lock().unwrap().dispatch(&tag_msg);

    match timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
        ChoAppEvent::Select { status, ac, ref_ndef } => {
            assert_eq!(status, Status::Ok);
            assert_eq!(ac.len(), 1);
            assert_eq!(ac[0].cps, Cps::Unknown);
            assert_eq!(ref_ndef, tag_msg);
        }
        other => panic!("expected Select, got {other:?}"),
    }
}
