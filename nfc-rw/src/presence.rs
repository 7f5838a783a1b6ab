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

//! The background presence check.
//!
//! Polls the activated tag on a fixed cadence, yielding the session
//! mutex between polls. Tags that do not answer the standard RW
//! presence check are probed with a vendor command guarded by a
//! watchdog. A failed poll deactivates back to discovery and reports
//! tag departure.

use crate::session::{CmdStatus, DeactivateMode, Inner, RwDriver, TagAppEvent};
use log::{debug, error};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{sleep, timeout};

/// Strategy for probing a tag that ignores the standard presence
/// check. The default sends the vendor presence command; tests stub it.
pub trait PresenceProbe: Send {
    /// Issue the probe. Returns false when the command was not sent;
    /// the result arrives as a vendor presence notification.
    fn start(&mut self, driver: &mut dyn RwDriver) -> bool;
}

/// Default probe: the vendor-specific presence command whose
/// notification reports in-field/out-of-field.
pub struct VendorPresenceProbe;

impl PresenceProbe for VendorPresenceProbe {
    fn start(&mut self, driver: &mut dyn RwDriver) -> bool {
        driver.send_vendor_presence_cmd() == CmdStatus::Ok
    }
}

/// The presence loop body; one task per activated tag.
pub(crate) async fn presence_loop(inner: Arc<Inner>) {
    debug!("presence loop started");
    loop {
        let present = {
            let _session = inner.sync.lock().await;
            if inner.pres_check_required.load(Ordering::SeqCst) {
                do_presence_check(&inner).await
            } else {
                /* a recent exchange proved the tag is there */
                debug!("presence check rescheduled");
                inner.pres_check_required.store(true, Ordering::SeqCst);
                true
            }
        };

        if !present || !inner.active() {
            debug!("tag absent or deactivated, leaving presence loop");
            break;
        }

        tokio::select! {
            _ = sleep(inner.config.presence_check_interval) => {}
            _ = inner.deactivated.notified() => {
                debug!("deactivated, leaving presence loop");
                break;
            }
        }
    }

    /* tag is gone: push the RF state back to discovery and release
     * anything still waiting on the tag */
    {
        let _session = inner.sync.lock().await;
        inner.reset_check_cache();
        if inner.active() {
            let _ = inner.driver.lock().unwrap().deactivate(DeactivateMode::Discovery);
        }
    }
    inner.abort_waits();
    let _ = inner.app_tx.send(TagAppEvent::Departure);
    debug!("presence loop finished");
}

/// One poll. Runs under the session mutex.
pub(crate) async fn do_presence_check(inner: &Inner) -> bool {
    if inner.checking_ndef.load(Ordering::SeqCst) {
        debug!("NDEF detection in progress, tag assumed present");
        return true;
    }
    /* a reselect is running; the tag is being talked to right now */
    if inner.rf_lock.try_lock().is_err() {
        debug!("tag is being reselected, assumed present");
        return true;
    }
    if !inner.active() {
        debug!("tag already deactivated");
        return false;
    }

    if inner.needs_vendor_probe() {
        let rsp = inner.arm_vendor_rsp();
        let ntf = inner.arm_vendor_ntf();
        let started = {
            let mut probe = inner.probe.lock().unwrap();
            let mut driver = inner.driver.lock().unwrap();
            probe.start(driver.as_mut())
        };
        if !started {
            error!("vendor presence command failed");
            return false;
        }
        match timeout(inner.config.presence_watchdog, rsp).await {
            Ok(Ok(true)) => {}
            _ => return false,
        }
        /* the watchdog short-circuits a lost notification */
        match timeout(inner.config.presence_watchdog, ntf).await {
            Ok(Ok(in_field)) => in_field,
            _ => {
                debug!("presence watchdog expired");
                false
            }
        }
    } else {
        let wait = inner.arm_presence();
        if inner.driver.lock().unwrap().presence_check() != CmdStatus::Ok {
            return false;
        }
        wait.await.unwrap_or(false)
    }
}
