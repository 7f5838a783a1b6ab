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

//! Builders for the Connection Handover well-known records (Hr, Hs, cr,
//! ac, err) and the carrier-configuration media records.

use crate::msg::{self, Tnf};
use crate::{NdefError, Result};

/// Handover Request record type.
pub const HR_TYPE: &[u8] = b"Hr";
/// Handover Select record type.
pub const HS_TYPE: &[u8] = b"Hs";
/// Collision Resolution record type.
pub const CR_TYPE: &[u8] = b"cr";
/// Alternative Carrier record type.
pub const AC_TYPE: &[u8] = b"ac";
/// Handover error record type.
pub const ERR_TYPE: &[u8] = b"err";
/// Bluetooth OOB carrier-configuration media type.
pub const BT_OOB_TYPE: &[u8] = b"application/vnd.bluetooth.ep.oob";
/// WiFi Simple Configuration carrier-configuration media type.
pub const WIFI_WSC_TYPE: &[u8] = b"application/vnd.wfa.wsc";

/// Handover error reason: resend with a shorter message later.
pub const ERR_TEMP_MEM: u8 = 0x01;
/// Handover error reason: message exceeds the receiver's buffer; the
/// datum carries the buffer size.
pub const ERR_PERM_MEM: u8 = 0x02;
/// Handover error reason: carrier refused.
pub const ERR_CARRIER: u8 = 0x03;

/// Append a Handover Request record; the payload starts with the
/// version byte and later receives the embedded cr/ac sub-message.
pub fn create_hr(buf: &mut Vec<u8>, max_size: usize, version: u8) -> Result<()> {
    msg::add_record(buf, max_size, Tnf::WellKnown, HR_TYPE, &[], &[version])
}

/// Append a Handover Select record with the version byte.
pub fn create_hs(buf: &mut Vec<u8>, max_size: usize, version: u8) -> Result<()> {
    msg::add_record(buf, max_size, Tnf::WellKnown, HS_TYPE, &[], &[version])
}

/// Append a Collision Resolution record carrying the random number.
pub fn add_cr(buf: &mut Vec<u8>, max_size: usize, random_number: u16) -> Result<()> {
    msg::add_record(buf, max_size, Tnf::WellKnown, CR_TYPE, &[], &random_number.to_be_bytes())
}

/// Append an Alternative Carrier record: power state, length-prefixed
/// carrier data reference, and the auxiliary data references.
pub fn add_ac(
    buf: &mut Vec<u8>,
    max_size: usize,
    cps: u8,
    carrier_data_ref: &[u8],
    aux_data_refs: &[&[u8]],
) -> Result<()> {
    if carrier_data_ref.len() > 255 || aux_data_refs.len() > 255 {
        return Err(NdefError::LengthMismatch);
    }
    let mut payload = Vec::with_capacity(3 + carrier_data_ref.len());
    payload.push(cps);
    payload.push(carrier_data_ref.len() as u8);
    payload.extend_from_slice(carrier_data_ref);
    payload.push(aux_data_refs.len() as u8);
    for aux in aux_data_refs {
        if aux.len() > 255 {
            return Err(NdefError::LengthMismatch);
        }
        payload.push(aux.len() as u8);
        payload.extend_from_slice(aux);
    }
    msg::add_record(buf, max_size, Tnf::WellKnown, AC_TYPE, &[], &payload)
}

/// Append a handover error record. The reason-specific datum is one
/// byte, except the permanent-memory reason which carries the 4-byte
/// buffer size.
pub fn add_err(buf: &mut Vec<u8>, max_size: usize, reason: u8, data: u32) -> Result<()> {
    let mut payload = vec![reason];
    if reason == ERR_PERM_MEM {
        payload.extend_from_slice(&data.to_be_bytes());
    } else {
        payload.push(data as u8);
    }
    msg::add_record(buf, max_size, Tnf::WellKnown, ERR_TYPE, &[], &payload)
}

/// Append a Bluetooth OOB carrier-configuration record with the given
/// payload id.
pub fn add_media_bt_oob(
    buf: &mut Vec<u8>,
    max_size: usize,
    id: &[u8],
    payload: &[u8],
) -> Result<()> {
    msg::add_record(buf, max_size, Tnf::Media, BT_OOB_TYPE, id, payload)
}

/// Append a WiFi Simple Configuration carrier record with the given
/// payload id.
pub fn add_media_wifi_wsc(
    buf: &mut Vec<u8>,
    max_size: usize,
    id: &[u8],
    payload: &[u8],
) -> Result<()> {
    msg::add_record(buf, max_size, Tnf::Media, WIFI_WSC_TYPE, id, payload)
}
