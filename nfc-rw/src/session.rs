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

//! The tag session: one activated tag, strictly serialized operations.
//!
//! Every public operation holds the coarse session mutex for its whole
//! duration and parks on a one-shot completion slot until the matching
//! [`TagEvent`] arrives from the NCI side. The deactivate→reselect
//! sequence is additionally protected by the RF-interface mutex so the
//! presence loop cannot interleave with it.

use crate::presence::PresenceProbe;
use crate::{Result, TagError};
use bytes::BytesMut;
use log::{debug, error, warn};
use nfc_ndef::msg as ndef;
use nfc_ndef::rtd::{self, FriendlyType};
use nfc_ndef::{RecordParts, Tnf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout, Duration};

/// Default key of an unformatted Mifare Classic sector.
const MIFARE_KEY_DEFAULT: [u8; 6] = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
/// NDEF key of a Mifare Classic sector already carrying NDEF data.
const MIFARE_KEY_NDEF: [u8; 6] = [0xd3, 0xf7, 0xd3, 0xf7, 0xd3, 0xf7];

/// NDEF-detection flag: tag is read only.
pub const DETECT_FL_READ_ONLY: u8 = 0x01;
/// NDEF-detection flag: tag is formatted for NDEF.
pub const DETECT_FL_FORMATED: u8 = 0x02;
/// NDEF-detection flag: the tag supports NDEF.
pub const DETECT_FL_SUPPORTED: u8 = 0x04;
/// NDEF-detection flag: nothing could be determined.
pub const DETECT_FL_UNKNOWN: u8 = 0x08;
/// NDEF-detection flag: the tag can be formatted.
pub const DETECT_FL_FORMATABLE: u8 = 0x10;

/// RF protocol of the activated tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// Type 1 (Topaz)
    T1t,
    /// Type 2 (Mifare Ultralight family)
    T2t,
    /// Type 3 (FeliCa)
    T3t,
    /// ISO 14443-4
    IsoDep,
    /// Mifare Classic
    Mifare,
    /// ISO 15693
    Iso15693,
    /// Anything else
    Unknown,
}

/// RF interface the controller uses to talk to the tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RfInterface {
    /// Raw frames
    Frame,
    /// ISO-DEP framing
    IsoDep,
    /// NFC-DEP framing
    NfcDep,
    /// Mifare Classic framing
    Mifare,
}

/// Target state of a deactivate command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeactivateMode {
    /// All the way to idle
    Idle,
    /// To sleep, keeping the tag selectable
    Sleep,
    /// Back to discovery
    Discovery,
}

/// Synchronous outcome of issuing an NCI command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdStatus {
    /// Command sent; a completion event will follow
    Ok,
    /// The stack refused the command
    Rejected,
    /// The command could not be sent
    Failed,
}

/// Everything remembered from tag activation.
#[derive(Clone, Debug)]
pub struct ActivationParams {
    /// RF protocol
    pub protocol: Protocol,
    /// Interface activated by discovery
    pub rf_interface: RfInterface,
    /// Discovery id used for reselection
    pub disc_id: u8,
    /// Protocol-derived NDEF capacity of a Type 1 tag
    pub t1t_max_len: u32,
    /// The tag answered as Type B
    pub type_b: bool,
    /// UID from the activation parameters
    pub uid: Vec<u8>,
}

impl Default for ActivationParams {
    fn default() -> Self {
        ActivationParams {
            protocol: Protocol::Unknown,
            rf_interface: RfInterface::Frame,
            disc_id: 0,
            t1t_max_len: 0,
            type_b: false,
            uid: Vec::new(),
        }
    }
}

/// Result of an NDEF detection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NdefInfo {
    /// The tag holds an NDEF message
    pub is_ndef: bool,
    /// Writing is allowed
    pub is_writable: bool,
    /// Size of the stored message
    pub current_len: u32,
    /// Capacity of the tag
    pub max_len: u32,
}

/// Detection outcome reported by the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectStatus {
    /// An NDEF message is present
    Ok,
    /// No NDEF message on the tag
    Failed,
    /// The tag stopped answering
    Timeout,
}

/// Completion events from the NCI reader/writer layer.
#[derive(Clone, Debug)]
pub enum TagEvent {
    /// NDEF detection finished
    NdefDetected {
        /// Outcome
        status: DetectStatus,
        /// Tag capacity
        max_size: u32,
        /// Stored message size
        current_size: u32,
        /// `DETECT_FL_*` bits
        flags: u8,
    },
    /// A piece of the NDEF message being read
    ReadChunk {
        /// Payload bytes
        data: Vec<u8>,
    },
    /// Read finished
    ReadDone {
        /// Success
        ok: bool,
    },
    /// Write finished
    WriteDone {
        /// Success
        ok: bool,
    },
    /// Format finished
    FormatDone {
        /// Success
        ok: bool,
    },
    /// Make-readonly finished
    ReadonlyDone {
        /// Success
        ok: bool,
    },
    /// Data from a raw frame exchange
    TransceiveData {
        /// Response bytes
        data: Vec<u8>,
        /// Final chunk
        done: bool,
    },
    /// The RF frame timed out
    RfTimeout,
    /// The link reached the given deactivation state
    Deactivated {
        /// Reached state
        mode: DeactivateMode,
    },
    /// Reselection activated an interface
    IntfActivated {
        /// The active interface
        rf_interface: RfInterface,
    },
    /// Standard presence check finished
    PresenceResult {
        /// Tag still present
        ok: bool,
    },
    /// The vendor presence command was accepted
    VendorPresenceRsp {
        /// Accepted
        ok: bool,
    },
    /// The vendor presence notification arrived
    VendorPresenceNtf {
        /// Tag still in the field
        in_field: bool,
    },
}

/// Events delivered to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagAppEvent {
    /// The tag left the field; the session is over
    Departure,
}

/// Command initiators towards the NCI reader/writer layer. Completions
/// arrive via [`TagSession::on_event`].
pub trait RwDriver: Send {
    /// Start NDEF detection.
    fn detect_ndef(&mut self) -> CmdStatus;
    /// Start reading the NDEF message.
    fn read_ndef(&mut self) -> CmdStatus;
    /// Start writing an NDEF message.
    fn write_ndef(&mut self, data: &[u8]) -> CmdStatus;
    /// Start formatting the tag.
    fn format(&mut self) -> CmdStatus;
    /// Start formatting a Mifare Classic tag with the given key.
    fn format_mifare(&mut self, key: &[u8; 6]) -> CmdStatus;
    /// Start locking the tag; `hard_lock` cannot be reverted.
    fn set_readonly(&mut self, hard_lock: bool) -> CmdStatus;
    /// Send one raw RF frame.
    fn send_raw_frame(&mut self, data: &[u8]) -> CmdStatus;
    /// Start the protocol-appropriate presence check.
    fn presence_check(&mut self) -> CmdStatus;
    /// Send the vendor-specific presence probe command.
    fn send_vendor_presence_cmd(&mut self) -> CmdStatus;
    /// Deactivate towards the given state.
    fn deactivate(&mut self, mode: DeactivateMode) -> CmdStatus;
    /// Select the tag again on the given interface.
    fn select(&mut self, disc_id: u8, protocol: Protocol, rf_interface: RfInterface)
        -> CmdStatus;
}

/// Timing knobs of the coordinator.
#[derive(Clone, Debug)]
pub struct RwConfig {
    /// Cadence of the background presence check
    pub presence_check_interval: Duration,
    /// Watchdog for a lost vendor presence notification
    pub presence_watchdog: Duration,
    /// Budget for each step of the deactivate→select sequence
    pub deactivate_timeout: Duration,
    /// Default transceive timeout
    pub transceive_timeout: Duration,
}

impl Default for RwConfig {
    fn default() -> Self {
        RwConfig {
            presence_check_interval: Duration::from_millis(125),
            presence_watchdog: Duration::from_millis(500),
            deactivate_timeout: Duration::from_millis(1000),
            transceive_timeout: Duration::from_millis(1000),
        }
    }
}

/// One-shot completion slot per outstanding operation.
#[derive(Default)]
struct Waiters {
    detect: Mutex<Option<oneshot::Sender<(DetectStatus, u32, u32, u8)>>>,
    read: Mutex<Option<oneshot::Sender<bool>>>,
    write: Mutex<Option<oneshot::Sender<bool>>>,
    format: Mutex<Option<oneshot::Sender<bool>>>,
    readonly: Mutex<Option<oneshot::Sender<bool>>>,
    transceive: Mutex<Option<oneshot::Sender<TransceiveEnd>>>,
    deactivate: Mutex<Option<oneshot::Sender<DeactivateMode>>>,
    activate: Mutex<Option<oneshot::Sender<RfInterface>>>,
    presence: Mutex<Option<oneshot::Sender<bool>>>,
    vendor_rsp: Mutex<Option<oneshot::Sender<bool>>>,
    vendor_ntf: Mutex<Option<oneshot::Sender<bool>>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransceiveEnd {
    Done,
    RfTimeout,
}

fn arm<T>(slot: &Mutex<Option<oneshot::Sender<T>>>) -> oneshot::Receiver<T> {
    let (tx, rx) = oneshot::channel();
    *slot.lock().unwrap() = Some(tx);
    rx
}

fn complete<T>(slot: &Mutex<Option<oneshot::Sender<T>>>, value: T) {
    if let Some(tx) = slot.lock().unwrap().take() {
        let _ = tx.send(value);
    }
}

fn disarm<T>(slot: &Mutex<Option<oneshot::Sender<T>>>) {
    slot.lock().unwrap().take();
}

/// Cached outcome of the last NDEF detection.
#[derive(Clone, Copy, Debug, Default)]
struct CheckCache {
    has_ndef: bool,
    capable: bool,
    read_only: bool,
    max_size: u32,
    current_size: u32,
}

struct TagState {
    params: ActivationParams,
    current_interface: RfInterface,
    check: CheckCache,
    mifare_reconnected: bool,
}

struct RxAccum {
    buf: BytesMut,
    cap: usize,
    overflow: bool,
}

pub(crate) struct Inner {
    pub(crate) config: RwConfig,
    /// Coarse mutex held across each whole tag operation.
    pub(crate) sync: tokio::sync::Mutex<()>,
    /// Protects the deactivate→reselect sequence.
    pub(crate) rf_lock: tokio::sync::Mutex<()>,
    pub(crate) driver: Mutex<Box<dyn RwDriver>>,
    pub(crate) probe: Mutex<Box<dyn PresenceProbe>>,
    waiters: Waiters,
    state: Mutex<TagState>,
    pub(crate) deactivating: AtomicBool,
    pub(crate) pres_check_required: AtomicBool,
    pub(crate) checking_ndef: AtomicBool,
    active: AtomicBool,
    rx: Mutex<Option<RxAccum>>,
    pub(crate) deactivated: Notify,
    pub(crate) app_tx: UnboundedSender<TagAppEvent>,
}

impl Inner {
    pub(crate) fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn params(&self) -> ActivationParams {
        self.state.lock().unwrap().params.clone()
    }

    /// Unblock every pending operation; used on tag loss.
    pub(crate) fn abort_waits(&self) {
        disarm(&self.waiters.detect);
        disarm(&self.waiters.read);
        disarm(&self.waiters.write);
        disarm(&self.waiters.format);
        disarm(&self.waiters.readonly);
        disarm(&self.waiters.transceive);
        disarm(&self.waiters.deactivate);
        disarm(&self.waiters.activate);
        disarm(&self.waiters.presence);
        disarm(&self.waiters.vendor_rsp);
        disarm(&self.waiters.vendor_ntf);
    }

    pub(crate) fn reset_check_cache(&self) {
        self.state.lock().unwrap().check = CheckCache::default();
    }

    pub(crate) fn arm_presence(&self) -> oneshot::Receiver<bool> {
        arm(&self.waiters.presence)
    }

    pub(crate) fn arm_vendor_rsp(&self) -> oneshot::Receiver<bool> {
        arm(&self.waiters.vendor_rsp)
    }

    pub(crate) fn arm_vendor_ntf(&self) -> oneshot::Receiver<bool> {
        arm(&self.waiters.vendor_ntf)
    }

    /// ISO-DEP Type B tags and Type A tags with a random UID do not
    /// answer the standard presence check; those take the vendor probe.
    pub(crate) fn needs_vendor_probe(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.params.protocol == Protocol::IsoDep
            && (state.params.type_b || state.params.uid.first() == Some(&0x08))
    }
}

/// Coordinates all operations on one activated tag.
#[derive(Clone)]
pub struct TagSession {
    inner: Arc<Inner>,
}

impl TagSession {
    /// Create a session around the given driver and presence probe.
    /// Returns the session and the application event stream.
    pub fn new(
        driver: Box<dyn RwDriver>,
        probe: Box<dyn PresenceProbe>,
        config: RwConfig,
    ) -> (TagSession, UnboundedReceiver<TagAppEvent>) {
        let (app_tx, app_rx) = unbounded_channel();
        let inner = Inner {
            config,
            sync: tokio::sync::Mutex::new(()),
            rf_lock: tokio::sync::Mutex::new(()),
            driver: Mutex::new(driver),
            probe: Mutex::new(probe),
            waiters: Waiters::default(),
            state: Mutex::new(TagState {
                params: ActivationParams::default(),
                current_interface: RfInterface::Frame,
                check: CheckCache::default(),
                mifare_reconnected: false,
            }),
            deactivating: AtomicBool::new(false),
            pres_check_required: AtomicBool::new(true),
            checking_ndef: AtomicBool::new(false),
            active: AtomicBool::new(false),
            rx: Mutex::new(None),
            deactivated: Notify::new(),
            app_tx,
        };
        (TagSession { inner: Arc::new(inner) }, app_rx)
    }

    /// Record a freshly activated tag.
    pub fn activate(&self, params: ActivationParams) {
        let mut state = self.inner.state.lock().unwrap();
        state.current_interface = params.rf_interface;
        state.params = params;
        state.check = CheckCache::default();
        state.mifare_reconnected = false;
        drop(state);
        self.inner.active.store(true, Ordering::SeqCst);
        self.inner.pres_check_required.store(true, Ordering::SeqCst);
    }

    /// Start the background presence loop for the activated tag.
    pub fn start_presence_loop(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(crate::presence::presence_loop(Arc::clone(&self.inner)))
    }

    /// The tag is still activated.
    pub fn is_active(&self) -> bool {
        self.inner.active()
    }

    /// Feed one completion event from the NCI layer.
    pub fn on_event(&self, event: TagEvent) {
        let inner = &self.inner;
        match event {
            TagEvent::NdefDetected { status, max_size, current_size, flags } => {
                complete(&inner.waiters.detect, (status, max_size, current_size, flags));
            }
            TagEvent::ReadChunk { data } => self.append_rx(&data),
            TagEvent::ReadDone { ok } => complete(&inner.waiters.read, ok),
            TagEvent::WriteDone { ok } => complete(&inner.waiters.write, ok),
            TagEvent::FormatDone { ok } => complete(&inner.waiters.format, ok),
            TagEvent::ReadonlyDone { ok } => complete(&inner.waiters.readonly, ok),
            TagEvent::TransceiveData { data, done } => {
                /* the tag answered; skip the next scheduled presence
                 * poll */
                inner.pres_check_required.store(false, Ordering::SeqCst);
                self.append_rx(&data);
                if done {
                    complete(&inner.waiters.transceive, TransceiveEnd::Done);
                }
            }
            TagEvent::RfTimeout => complete(&inner.waiters.transceive, TransceiveEnd::RfTimeout),
            TagEvent::Deactivated { mode } => {
                complete(&inner.waiters.deactivate, mode);
                if mode != DeactivateMode::Sleep {
                    inner.active.store(false, Ordering::SeqCst);
                    inner.deactivated.notify_waiters();
                }
            }
            TagEvent::IntfActivated { rf_interface } => {
                inner.state.lock().unwrap().current_interface = rf_interface;
                inner.active.store(true, Ordering::SeqCst);
                complete(&inner.waiters.activate, rf_interface);
            }
            TagEvent::PresenceResult { ok } => complete(&inner.waiters.presence, ok),
            TagEvent::VendorPresenceRsp { ok } => complete(&inner.waiters.vendor_rsp, ok),
            TagEvent::VendorPresenceNtf { in_field } => {
                complete(&inner.waiters.vendor_ntf, in_field);
            }
        }
    }

    fn append_rx(&self, data: &[u8]) {
        let mut slot = self.inner.rx.lock().unwrap();
        if let Some(accum) = slot.as_mut() {
            if accum.buf.len() + data.len() <= accum.cap {
                accum.buf.extend_from_slice(data);
            } else {
                accum.overflow = true;
            }
        } else {
            warn!("dropping unexpected rx data");
        }
    }

    fn arm_rx(&self, cap: usize) {
        *self.inner.rx.lock().unwrap() =
            Some(RxAccum { buf: BytesMut::with_capacity(cap), cap, overflow: false });
    }

    fn take_rx(&self) -> Option<RxAccum> {
        self.inner.rx.lock().unwrap().take()
    }

    /// Does the tag hold an NDEF message, and what are its limits?
    pub async fn check_ndef(&self) -> Result<NdefInfo> {
        let inner = &self.inner;
        inner.checking_ndef.store(true, Ordering::SeqCst);
        let _session = inner.sync.lock().await;

        let result = self.check_ndef_locked().await;
        inner.checking_ndef.store(false, Ordering::SeqCst);
        result
    }

    async fn check_ndef_locked(&self) -> Result<NdefInfo> {
        let inner = &self.inner;
        if !inner.active() {
            error!("tag already deactivated");
            return Err(TagError::TagLost);
        }
        let params = inner.params();
        if params.protocol == Protocol::Mifare {
            /* Mifare needs a fresh select before NDEF detection */
            let _ = self.reconnect_locked().await;
        }
        inner.state.lock().unwrap().mifare_reconnected = false;

        let completion = arm(&inner.waiters.detect);
        if inner.driver.lock().unwrap().detect_ndef() != CmdStatus::Ok {
            error!("NDEF detection could not be started");
            disarm(&inner.waiters.detect);
            return Err(TagError::Failed);
        }
        let (status, max_size, current_size, flags) =
            completion.await.map_err(|_| TagError::TagLost)?;

        let max_size =
            if params.protocol == Protocol::T1t { params.t1t_max_len } else { max_size };
        let read_only = flags & DETECT_FL_READ_ONLY != 0;

        let mut state = inner.state.lock().unwrap();
        match status {
            DetectStatus::Ok => {
                state.check = CheckCache {
                    has_ndef: true,
                    capable: true,
                    read_only,
                    max_size,
                    current_size,
                };
                Ok(NdefInfo {
                    is_ndef: true,
                    is_writable: !read_only,
                    current_len: current_size,
                    max_len: max_size,
                })
            }
            DetectStatus::Failed => {
                /* no message, but the tag may still take one */
                let capable = flags & DETECT_FL_UNKNOWN == 0
                    && flags & (DETECT_FL_SUPPORTED | DETECT_FL_FORMATABLE) != 0;
                state.check = CheckCache {
                    has_ndef: false,
                    capable,
                    read_only,
                    max_size,
                    current_size: 0,
                };
                Ok(NdefInfo {
                    is_ndef: false,
                    is_writable: !read_only,
                    current_len: 0,
                    max_len: max_size,
                })
            }
            DetectStatus::Timeout => {
                drop(state);
                debug!("tag is lost, deactivating");
                self.disconnect_locked();
                Err(TagError::TagLost)
            }
        }
    }

    /// Read the stored NDEF message into `buf`. Returns the byte count
    /// and the friendly type of the first record.
    pub async fn read_ndef(&self, buf: &mut [u8]) -> Result<(usize, FriendlyType)> {
        let inner = &self.inner;
        let _session = inner.sync.lock().await;

        if !inner.active() {
            return Err(TagError::TagLost);
        }
        if inner.state.lock().unwrap().check.current_size == 0 {
            debug!("no NDEF message on the tag");
            return Err(TagError::Failed);
        }

        self.arm_rx(buf.len());
        let completion = arm(&inner.waiters.read);
        if inner.driver.lock().unwrap().read_ndef() != CmdStatus::Ok {
            disarm(&inner.waiters.read);
            self.take_rx();
            return Err(TagError::Failed);
        }
        let ok = completion.await.map_err(|_| TagError::TagLost)?;
        let accum = self.take_rx().ok_or(TagError::Failed)?;

        if !ok {
            return Err(TagError::Failed);
        }
        if accum.overflow {
            return Err(TagError::Overflow);
        }

        let data = accum.buf;
        let rec = ndef::record_by_index(&data, 0).ok_or(TagError::Failed)?;
        let parts = RecordParts::parse(rec).ok_or(TagError::Failed)?;
        let friendly = rtd::friendly_type(parts.tnf, parts.rec_type);

        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), friendly))
    }

    /// Write an NDEF message, formatting a formattable tag first. An
    /// empty `data` erases the tag by writing an empty record.
    pub async fn write_ndef(&self, data: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let _session = inner.sync.lock().await;

        if !inner.active() {
            return Err(TagError::TagLost);
        }
        let check = inner.state.lock().unwrap().check;
        if check.capable && (data.len() as u32) > check.max_size {
            error!("NDEF message is too large");
            return Err(TagError::BadLength);
        }
        if !data.is_empty() {
            ndef::validate(data, false)?;
        }

        if !check.has_ndef {
            /* no message on the tag yet: format a formattable tag
             * before the first write */
            if check.capable {
                debug!("formatting before write");
                self.format_locked().await?;
            }
            self.complete_write(data).await
        } else if data.is_empty() {
            /* erase by writing an empty NDEF message */
            let mut empty = Vec::new();
            ndef::add_record(&mut empty, 16, Tnf::Empty, &[], &[], &[])
                .map_err(|_| TagError::Failed)?;
            self.complete_write(&empty).await
        } else {
            self.complete_write(data).await
        }
    }

    async fn complete_write(&self, data: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let completion = arm(&inner.waiters.write);
        if inner.driver.lock().unwrap().write_ndef(data) != CmdStatus::Ok {
            disarm(&inner.waiters.write);
            return Err(TagError::Failed);
        }
        match completion.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TagError::Failed),
            Err(_) => Err(TagError::TagLost),
        }
    }

    /// Format the tag for NDEF.
    pub async fn format(&self) -> Result<()> {
        let inner = &self.inner;
        let _session = inner.sync.lock().await;
        if !inner.active() {
            debug!("tag already deactivated, no need to format");
            return Err(TagError::TagLost);
        }
        self.format_locked().await?;
        if inner.params().protocol == Protocol::IsoDep {
            let _ = self.reconnect_locked().await;
        }
        Ok(())
    }

    async fn format_locked(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.params().protocol == Protocol::Mifare {
            /* try the transport key first, then the NDEF key */
            let _ = self.reconnect_locked().await;
            if self.format_once(Some(&MIFARE_KEY_DEFAULT)).await? {
                return Ok(());
            }
            debug!("format with first key failed");
            self.reconnect_locked().await?;
            if self.format_once(Some(&MIFARE_KEY_NDEF)).await? {
                return Ok(());
            }
            error!("format with second key failed");
            Err(TagError::Failed)
        } else if self.format_once(None).await? {
            Ok(())
        } else {
            Err(TagError::Failed)
        }
    }

    async fn format_once(&self, mifare_key: Option<&[u8; 6]>) -> Result<bool> {
        let inner = &self.inner;
        let completion = arm(&inner.waiters.format);
        let status = {
            let mut driver = inner.driver.lock().unwrap();
            match mifare_key {
                Some(key) => driver.format_mifare(key),
                None => driver.format(),
            }
        };
        if status != CmdStatus::Ok {
            disarm(&inner.waiters.format);
            return Err(TagError::Failed);
        }
        completion.await.map_err(|_| TagError::TagLost)
    }

    /// Lock the tag against writes; falls back to a soft lock when the
    /// tag cannot be hard-locked.
    pub async fn make_readonly(&self) -> Result<()> {
        let inner = &self.inner;
        let _session = inner.sync.lock().await;
        if !inner.active() {
            return Err(TagError::TagLost);
        }

        let completion = arm(&inner.waiters.readonly);
        let status = {
            let mut driver = inner.driver.lock().unwrap();
            match driver.set_readonly(true) {
                CmdStatus::Rejected => {
                    debug!("hard lock rejected, trying soft lock");
                    driver.set_readonly(false)
                }
                status => status,
            }
        };
        if status != CmdStatus::Ok {
            error!("failed to lock the tag");
            disarm(&inner.waiters.readonly);
            return Err(TagError::Failed);
        }
        match completion.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TagError::Failed),
            Err(_) => Err(TagError::TagLost),
        }
    }

    /// Exchange one raw frame with the tag.
    pub async fn transceive(
        &self,
        tx_data: &[u8],
        rx_buf: &mut [u8],
        frame_timeout: Duration,
    ) -> Result<usize> {
        let inner = &self.inner;
        let _session = inner.sync.lock().await;
        if !inner.active() {
            return Err(TagError::TagLost);
        }

        /* Mifare tags need one reselect before the first raw frame */
        let needs_reconnect = {
            let state = inner.state.lock().unwrap();
            state.params.protocol == Protocol::Mifare && !state.mifare_reconnected
        };
        if needs_reconnect {
            let _ = self.reconnect_locked().await;
            inner.state.lock().unwrap().mifare_reconnected = true;
        }

        self.arm_rx(rx_buf.len());
        let completion = arm(&inner.waiters.transceive);
        if inner.driver.lock().unwrap().send_raw_frame(tx_data) != CmdStatus::Ok {
            disarm(&inner.waiters.transceive);
            self.take_rx();
            return Err(TagError::Failed);
        }

        let budget = Duration::max(frame_timeout, inner.config.transceive_timeout);
        let end = match timeout(budget, completion).await {
            Ok(Ok(end)) => end,
            Ok(Err(_)) => {
                self.take_rx();
                return Err(TagError::TagLost);
            }
            Err(_) => {
                /* no response at all: treat the tag as gone */
                error!("transceive timed out, tag is lost");
                self.take_rx();
                self.disconnect_locked();
                return Err(TagError::TagLost);
            }
        };

        let accum = self.take_rx().ok_or(TagError::Failed)?;
        if end == TransceiveEnd::RfTimeout {
            error!("RF timeout, tag is lost");
            self.disconnect_locked();
            return Err(TagError::TagLost);
        }
        if accum.overflow {
            return Err(TagError::Overflow);
        }

        let data = accum.buf;
        let params = inner.params();
        if params.protocol == Protocol::T2t && is_t2t_nack(&data) {
            /* some tags halt after a NACK; wake them up again */
            debug!("T2T NACK response, reconnecting");
            let _ = self.reconnect_locked().await;
        }

        rx_buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// One immediate presence poll, outside the background cadence.
    pub async fn presence_check(&self) -> bool {
        let inner = &self.inner;
        let _session = inner.sync.lock().await;
        crate::presence::do_presence_check(inner).await
    }

    /// Select the tag again on the interface it was activated with.
    pub async fn reconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let _session = inner.sync.lock().await;
        if !inner.active() {
            return Err(TagError::TagLost);
        }
        self.reconnect_locked().await
    }

    async fn reconnect_locked(&self) -> Result<()> {
        match self.inner.params().protocol {
            Protocol::IsoDep => self.reselect(RfInterface::IsoDep, false).await,
            Protocol::T2t => self.reselect(RfInterface::Frame, false).await,
            Protocol::Mifare => self.reselect(RfInterface::Mifare, false).await,
            _ => Ok(()),
        }
    }

    /// Switch the RF interface of an ISO-DEP tag. A no-op for other
    /// protocols and when the interface is already active.
    pub async fn switch_rf_interface(&self, rf_interface: RfInterface) -> Result<()> {
        let inner = &self.inner;
        let _session = inner.sync.lock().await;
        if !inner.active() {
            return Err(TagError::TagLost);
        }
        if inner.params().protocol != Protocol::IsoDep {
            debug!("not ISO-DEP, nothing to switch");
            return Ok(());
        }
        self.reselect(rf_interface, true).await
    }

    /// The deactivate→sleep→select dance. Holds the RF-interface lock
    /// so the presence loop stays out of the way.
    async fn reselect(&self, rf_interface: RfInterface, switch_if_needed: bool) -> Result<()> {
        let inner = &self.inner;
        let _rf = inner.rf_lock.lock().await;

        if switch_if_needed
            && inner.state.lock().unwrap().current_interface == rf_interface
        {
            return Ok(());
        }
        debug!("reselect to {rf_interface:?}");

        /* step 1: deactivate to sleep */
        inner.deactivating.store(true, Ordering::SeqCst);
        let sleeping = arm(&inner.waiters.deactivate);
        if inner.driver.lock().unwrap().deactivate(DeactivateMode::Sleep) != CmdStatus::Ok {
            inner.deactivating.store(false, Ordering::SeqCst);
            disarm(&inner.waiters.deactivate);
            return Err(TagError::Failed);
        }
        match timeout(inner.config.deactivate_timeout, sleeping).await {
            Ok(Ok(DeactivateMode::Sleep)) => {}
            _ => {
                error!("timeout waiting for deactivate");
                inner.deactivating.store(false, Ordering::SeqCst);
                disarm(&inner.waiters.deactivate);
                let _ = inner.driver.lock().unwrap().deactivate(DeactivateMode::Idle);
                return Err(TagError::SemanticError);
            }
        }
        inner.deactivating.store(false, Ordering::SeqCst);

        /* step 2: select on the requested interface */
        let (disc_id, protocol) = {
            let state = inner.state.lock().unwrap();
            (state.params.disc_id, state.params.protocol)
        };
        let activated = arm(&inner.waiters.activate);
        if inner.driver.lock().unwrap().select(disc_id, protocol, rf_interface) != CmdStatus::Ok
        {
            disarm(&inner.waiters.activate);
            let _ = inner.driver.lock().unwrap().deactivate(DeactivateMode::Idle);
            return Err(TagError::Failed);
        }
        match timeout(inner.config.deactivate_timeout, activated).await {
            Ok(Ok(interface)) => {
                inner.state.lock().unwrap().current_interface = interface;
                Ok(())
            }
            _ => {
                error!("timeout waiting for select");
                disarm(&inner.waiters.activate);
                let _ = inner.driver.lock().unwrap().deactivate(DeactivateMode::Idle);
                Err(TagError::SemanticError)
            }
        }
    }

    /// Tag is unusable: push the RF state back to discovery and clear
    /// the detection cache.
    fn disconnect_locked(&self) {
        let inner = &self.inner;
        inner.reset_check_cache();
        if inner.active() {
            let _ = inner.driver.lock().unwrap().deactivate(DeactivateMode::Discovery);
        } else {
            debug!("tag already deactivated");
        }
    }
}

/// A single-byte response other than the T2T ACK nibble is a NACK.
fn is_t2t_nack(resp: &[u8]) -> bool {
    resp.len() == 1 && resp[0] & 0x0f != 0x0a
}
