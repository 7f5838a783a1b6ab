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

//! Handover message assembly and parsing.
//!
//! An Hr message is one outer well-known record whose payload is a
//! version byte followed by an embedded NDEF message (one cr record
//! plus one ac record per alternative carrier), then the referenced
//! carrier-configuration records. Hs mirrors Hr without cr and may
//! carry an err record instead.

use crate::{Status, MAX_AUX_DATA_COUNT, MAX_REF_NAME_LEN};
use log::{debug, error, warn};
use nfc_ndef::msg::{self as ndef, Header, RecordParts, Tnf};
use nfc_ndef::wkt;

/// Carrier Power State of an alternative carrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cps {
    /// Carrier is off
    Inactive = 0,
    /// Carrier is on
    Active = 1,
    /// Carrier is being switched on
    Activating = 2,
    /// Power state unknown
    Unknown = 3,
}

impl Cps {
    /// Decode the 2-bit power state.
    pub fn from_bits(bits: u8) -> Cps {
        match bits & 0x03 {
            0 => Cps::Inactive,
            1 => Cps::Active,
            2 => Cps::Activating,
            _ => Cps::Unknown,
        }
    }
}

/// Build-side description of one alternative carrier. The carrier data
/// reference and auxiliary references are taken from the ids of the
/// caller's carrier-configuration records, in order.
#[derive(Clone, Debug)]
pub struct AcInfo {
    /// Carrier power state advertised in the ac record
    pub cps: Cps,
    /// How many of the following carrier records are auxiliary data
    pub num_aux_data: usize,
}

/// One parsed alternative-carrier record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcRecord {
    /// Carrier power state
    pub cps: Cps,
    /// Id of the carrier-configuration record in the outer message
    pub carrier_data_ref: Vec<u8>,
    /// Ids of the auxiliary data records
    pub aux_data_refs: Vec<Vec<u8>>,
}

/// A parsed handover error record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HsError {
    /// Error reason code
    pub reason: u8,
    /// Reason-specific datum
    pub data: u32,
}

/// Parsed Handover Request message.
#[derive(Clone, Debug)]
pub struct HrInfo {
    /// Version byte, major in the high nibble
    pub version: u8,
    /// Collision-resolution random number
    pub random_number: u16,
    /// Proposed alternative carriers
    pub ac: Vec<AcRecord>,
}

/// Parsed Handover Select message.
#[derive(Clone, Debug)]
pub struct HsInfo {
    /// Version byte
    pub version: u8,
    /// Selected carriers, empty for an empty Hs
    pub ac: Vec<AcRecord>,
    /// Error record, if the peer sent one instead of carriers
    pub error: Option<HsError>,
}

/// Message classification used for collision detection and static
/// handover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    /// Handover Request
    Hr,
    /// Handover Select
    Hs,
    /// Simplified Bluetooth OOB message
    BtOob,
    /// Simplified WiFi configuration message
    Wifi,
    /// None of the above
    Unknown,
}

/// Probe which handover message this NDEF message is.
pub fn msg_type(message: &[u8]) -> MsgType {
    if ndef::find_by_type(message, Tnf::WellKnown, wkt::HR_TYPE).is_some() {
        MsgType::Hr
    } else if ndef::find_by_type(message, Tnf::WellKnown, wkt::HS_TYPE).is_some() {
        MsgType::Hs
    } else if ndef::find_by_type(message, Tnf::Media, wkt::BT_OOB_TYPE).is_some() {
        MsgType::BtOob
    } else if ndef::find_by_type(message, Tnf::Media, wkt::WIFI_WSC_TYPE).is_some() {
        MsgType::Wifi
    } else {
        debug!("no Hr/Hs record found");
        MsgType::Unknown
    }
}

/// Collect (carrier ref, aux refs) for each alternative carrier from
/// the ids of the caller's carrier records.
fn collect_refs(
    ac_info: &[AcInfo],
    carriers: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<Vec<u8>>)>, Status> {
    let mut records = ndef::records(carriers);
    let mut refs = Vec::with_capacity(ac_info.len());
    for info in ac_info {
        let id = record_id(records.next())?;
        let mut aux = Vec::with_capacity(info.num_aux_data);
        for _ in 0..info.num_aux_data {
            aux.push(record_id(records.next())?);
        }
        refs.push((id, aux));
    }
    Ok(refs)
}

fn record_id(rec: Option<&[u8]>) -> Result<Vec<u8>, Status> {
    let parts = rec.and_then(RecordParts::parse).ok_or(Status::Failed)?;
    if parts.id.is_empty() || parts.id.len() > MAX_REF_NAME_LEN {
        error!("carrier record has no usable payload id (len={})", parts.id.len());
        return Err(Status::Failed);
    }
    Ok(parts.id.to_vec())
}

fn add_ac_records(
    sub: &mut Vec<u8>,
    max_size: usize,
    ac_info: &[AcInfo],
    carriers: &[u8],
) -> Result<(), Status> {
    for (info, (carrier_ref, aux)) in ac_info.iter().zip(collect_refs(ac_info, carriers)?) {
        let aux_slices: Vec<&[u8]> = aux.iter().map(|a| a.as_slice()).collect();
        wkt::add_ac(sub, max_size, info.cps as u8, &carrier_ref, &aux_slices)
            .map_err(|_| Status::Failed)?;
    }
    Ok(())
}

/// Build a complete Handover Request message.
pub fn build_hr(
    version: u8,
    random_number: u16,
    ac_info: &[AcInfo],
    carriers: &[u8],
    max_size: usize,
) -> Result<Vec<u8>, Status> {
    /* collision resolution record plus the alternative carrier records */
    let mut sub = Vec::new();
    wkt::add_cr(&mut sub, max_size, random_number).map_err(|_| Status::Failed)?;
    add_ac_records(&mut sub, max_size, ac_info, carriers)?;

    let mut out = Vec::new();
    wkt::create_hr(&mut out, max_size, version).map_err(|_| Status::Failed)?;
    ndef::append_payload(&mut out, max_size, 0, &sub).map_err(|_| Status::Failed)?;
    ndef::append_message(&mut out, max_size, carriers).map_err(|_| Status::Failed)?;
    Ok(out)
}

/// Build a Handover Select message; with no carriers this is the empty
/// Hs used to refuse a request.
pub fn build_hs(
    version: u8,
    ac_info: &[AcInfo],
    carriers: &[u8],
    max_size: usize,
) -> Result<Vec<u8>, Status> {
    let mut out = Vec::new();
    wkt::create_hs(&mut out, max_size, version).map_err(|_| Status::Failed)?;
    if !ac_info.is_empty() {
        let mut sub = Vec::new();
        add_ac_records(&mut sub, max_size, ac_info, carriers)?;
        ndef::append_payload(&mut out, max_size, 0, &sub).map_err(|_| Status::Failed)?;
        ndef::append_message(&mut out, max_size, carriers).map_err(|_| Status::Failed)?;
    }
    Ok(out)
}

/// Build a Handover Select message carrying only an error record.
pub fn build_hs_error(
    version: u8,
    reason: u8,
    data: u32,
    max_size: usize,
) -> Result<Vec<u8>, Status> {
    let mut out = Vec::new();
    wkt::create_hs(&mut out, max_size, version).map_err(|_| Status::Failed)?;
    wkt::add_err(&mut out, max_size, reason, data).map_err(|_| Status::Failed)?;
    Ok(out)
}

/// Offset of the first record with the given type, along with its wire
/// length and payload length.
fn find_offset(message: &[u8], tnf: Tnf, rec_type: &[u8]) -> Option<(usize, usize, usize)> {
    let mut off = 0usize;
    for rec in ndef::records(message) {
        let parts = RecordParts::parse(rec)?;
        if parts.tnf == tnf && parts.rec_type == rec_type {
            return Some((off, rec.len(), parts.payload.len()));
        }
        off += rec.len();
    }
    None
}

/// The payload of the first record with the given type.
fn find_payload<'a>(message: &'a [u8], tnf: Tnf, rec_type: &[u8]) -> Option<&'a [u8]> {
    ndef::find_by_type(message, tnf, rec_type)
        .and_then(RecordParts::parse)
        .map(|p| p.payload)
}

/// Random number in the cr record of a Handover Request message.
pub fn random_number(message: &[u8]) -> Option<u16> {
    let hr_payload = find_payload(message, Tnf::WellKnown, wkt::HR_TYPE)?;
    embedded_random(hr_payload.get(1..)?)
}

fn embedded_random(embedded: &[u8]) -> Option<u16> {
    let cr = find_payload(embedded, Tnf::WellKnown, wkt::CR_TYPE)?;
    if cr.len() != 2 {
        error!("bad cr payload length {}", cr.len());
        return None;
    }
    Some(u16::from_be_bytes([cr[0], cr[1]]))
}

/// Rewrite the random number of an Hr message in place.
pub fn update_random_number(message: &mut [u8], random_number: u16) -> Result<(), Status> {
    let (hr_off, hr_len, hr_payload_len) =
        find_offset(message, Tnf::WellKnown, wkt::HR_TYPE).ok_or(Status::Failed)?;
    if hr_payload_len < 1 {
        return Err(Status::Failed);
    }
    /* the embedded message starts after the version byte */
    let emb_start = hr_off + hr_len - hr_payload_len + 1;
    let emb_end = hr_off + hr_len;

    let (cr_off, cr_len, cr_payload_len) =
        find_offset(&message[emb_start..emb_end], Tnf::WellKnown, wkt::CR_TYPE)
            .ok_or(Status::Failed)?;
    if cr_payload_len != 2 {
        return Err(Status::Failed);
    }
    let at = emb_start + cr_off + cr_len - 2;
    message[at..at + 2].copy_from_slice(&random_number.to_be_bytes());
    Ok(())
}

/// Parse every ac record of an embedded cr/ac message.
pub fn parse_ac_records(embedded: &[u8]) -> Result<Vec<AcRecord>, Status> {
    let mut out = Vec::new();
    for rec in ndef::records(embedded) {
        let parts = RecordParts::parse(rec).ok_or(Status::Failed)?;
        if parts.tnf != Tnf::WellKnown || parts.rec_type != wkt::AC_TYPE {
            continue;
        }
        out.push(parse_one_ac(parts.payload)?);
    }
    Ok(out)
}

fn parse_one_ac(payload: &[u8]) -> Result<AcRecord, Status> {
    if payload.len() < 3 {
        error!("ac payload too short");
        return Err(Status::Failed);
    }
    let cps = Cps::from_bits(payload[0]);
    let mut pos = 1usize;

    let carrier_data_ref = read_ref(payload, &mut pos)?;
    let aux_count = *payload.get(pos).ok_or(Status::Failed)? as usize;
    pos += 1;

    if aux_count > MAX_AUX_DATA_COUNT {
        error!("too many aux data references ({aux_count})");
        return Err(Status::Failed);
    }
    let mut aux_data_refs = Vec::with_capacity(aux_count);
    for _ in 0..aux_count {
        aux_data_refs.push(read_ref(payload, &mut pos)?);
    }

    if pos != payload.len() {
        warn!("extra data in ac record");
    }
    Ok(AcRecord { cps, carrier_data_ref, aux_data_refs })
}

fn read_ref(payload: &[u8], pos: &mut usize) -> Result<Vec<u8>, Status> {
    let len = *payload.get(*pos).ok_or(Status::Failed)? as usize;
    *pos += 1;
    if len == 0 || len > MAX_REF_NAME_LEN {
        error!("bad reference name length {len}");
        return Err(Status::Failed);
    }
    let name = payload.get(*pos..*pos + len).ok_or(Status::Failed)?;
    *pos += len;
    Ok(name.to_vec())
}

/// Check that every carrier-data and auxiliary reference resolves to a
/// record id in the outer message.
pub fn verify_carrier_refs(message: &[u8], ac: &[AcRecord]) -> Result<(), Status> {
    for rec in ac {
        if ndef::find_by_id(message, &rec.carrier_data_ref).is_none() {
            error!("carrier data reference does not resolve");
            return Err(Status::Failed);
        }
        for aux in &rec.aux_data_refs {
            if ndef::find_by_id(message, aux).is_none() {
                error!("aux data reference does not resolve");
                return Err(Status::Failed);
            }
        }
    }
    Ok(())
}

/// Parse a Handover Request message.
pub fn parse_hr(message: &[u8]) -> Result<HrInfo, Status> {
    let payload =
        find_payload(message, Tnf::WellKnown, wkt::HR_TYPE).ok_or(Status::Failed)?;
    /* version plus at least a cr record */
    if payload.len() < 7 {
        error!("Hr payload too short");
        return Err(Status::Failed);
    }
    let version = payload[0];
    let embedded = &payload[1..];
    if ndef::validate(embedded, false).is_err() {
        error!("invalid embedded cr/ac message");
        return Err(Status::Failed);
    }
    let random_number = embedded_random(embedded).unwrap_or(0);
    let ac = parse_ac_records(embedded)?;
    Ok(HrInfo { version, random_number, ac })
}

/// Parse a Handover Select message.
pub fn parse_hs(message: &[u8]) -> Result<HsInfo, Status> {
    let payload =
        find_payload(message, Tnf::WellKnown, wkt::HS_TYPE).ok_or(Status::Failed)?;
    if payload.is_empty() {
        error!("Hs payload too short");
        return Err(Status::Failed);
    }
    let version = payload[0];

    match parse_error_record(message) {
        Ok(Some(error)) => return Ok(HsInfo { version, ac: Vec::new(), error: Some(error) }),
        Ok(None) => {}
        Err(status) => return Err(status),
    }

    let embedded = &payload[1..];
    let ac = if embedded.len() >= 3 {
        if ndef::validate(embedded, false).is_err() {
            error!("invalid embedded ac message");
            return Err(Status::Failed);
        }
        parse_ac_records(embedded)?
    } else {
        debug!("empty handover select message");
        Vec::new()
    };
    Ok(HsInfo { version, ac, error: None })
}

/// Locate and decode an err record, if the message carries one.
fn parse_error_record(message: &[u8]) -> Result<Option<HsError>, Status> {
    let Some(payload) = find_payload(message, Tnf::WellKnown, wkt::ERR_TYPE) else {
        return Ok(None);
    };
    let (&reason, datum) = payload.split_first().ok_or(Status::SyntaxError)?;
    let data = match (payload.len(), reason) {
        (2, wkt::ERR_TEMP_MEM) | (2, wkt::ERR_CARRIER) => datum[0] as u32,
        (5, wkt::ERR_PERM_MEM) => u32::from_be_bytes([datum[0], datum[1], datum[2], datum[3]]),
        _ => {
            error!("unknown error reason {} with payload length {}", reason, payload.len());
            return Err(Status::Failed);
        }
    };
    Ok(Some(HsError { reason, data }))
}

/// The carrier records following the outer Hs record, re-marked as a
/// standalone NDEF message.
pub fn hs_tail(message: &[u8]) -> Option<Vec<u8>> {
    let first = ndef::record_by_index(message, 0)?;
    let tail_off = ndef::record_len(first)?;
    if tail_off >= message.len() {
        return None;
    }
    let mut tail = message[tail_off..].to_vec();
    tail[0] = Header::new(tail[0]).with_mb(true).bits();
    Some(tail)
}

/// The single alternative carrier reported for a simplified (static)
/// BT-OOB or WiFi message.
pub fn simplified_select() -> Vec<AcRecord> {
    vec![AcRecord { cps: Cps::Unknown, carrier_data_ref: Vec::new(), aux_data_refs: Vec::new() }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VERSION;

    fn bt_carrier() -> Vec<u8> {
        let mut carriers = Vec::new();
        wkt::add_media_bt_oob(&mut carriers, 512, b"0", &[0x22, 0x00, 0x01, 0x02]).unwrap();
        carriers
    }

    #[test]
    fn hr_round_trips_random_number() {
        let carriers = bt_carrier();
        let ac = [AcInfo { cps: Cps::Active, num_aux_data: 0 }];
        let hr = build_hr(VERSION, 0x1234, &ac, &carriers, 2048).unwrap();

        assert_eq!(msg_type(&hr), MsgType::Hr);
        let info = parse_hr(&hr).unwrap();
        assert_eq!(info.version, VERSION);
        assert_eq!(info.random_number, 0x1234);
        assert_eq!(info.ac.len(), 1);
        assert_eq!(info.ac[0].cps, Cps::Active);
        assert_eq!(info.ac[0].carrier_data_ref, b"0");
        verify_carrier_refs(&hr, &info.ac).unwrap();
        assert_eq!(random_number(&hr), Some(0x1234));
    }

    #[test]
    fn update_random_number_rewrites_in_place() {
        let carriers = bt_carrier();
        let ac = [AcInfo { cps: Cps::Active, num_aux_data: 0 }];
        let mut hr = build_hr(VERSION, 0x1234, &ac, &carriers, 2048).unwrap();
        let len = hr.len();

        update_random_number(&mut hr, 0x5678).unwrap();
        assert_eq!(hr.len(), len);
        assert_eq!(random_number(&hr), Some(0x5678));
        assert_eq!(parse_hr(&hr).unwrap().random_number, 0x5678);
    }

    #[test]
    fn hs_parses_selected_carrier() {
        let carriers = bt_carrier();
        let ac = [AcInfo { cps: Cps::Active, num_aux_data: 0 }];
        let hs = build_hs(VERSION, &ac, &carriers, 2048).unwrap();

        assert_eq!(msg_type(&hs), MsgType::Hs);
        let info = parse_hs(&hs).unwrap();
        assert_eq!(info.error, None);
        assert_eq!(info.ac.len(), 1);
        verify_carrier_refs(&hs, &info.ac).unwrap();

        let tail = hs_tail(&hs).unwrap();
        assert_eq!(nfc_ndef::msg::validate(&tail, false), Ok(()));
        assert_eq!(msg_type(&tail), MsgType::BtOob);
    }

    #[test]
    fn empty_hs_has_no_carriers() {
        let hs = build_hs(VERSION, &[], &[], 2048).unwrap();
        let info = parse_hs(&hs).unwrap();
        assert!(info.ac.is_empty());
        assert_eq!(info.error, None);
        assert_eq!(hs_tail(&hs), None);
    }

    #[test]
    fn hs_error_round_trip() {
        let hs = build_hs_error(VERSION, wkt::ERR_PERM_MEM, 2048, 256).unwrap();
        let info = parse_hs(&hs).unwrap();
        assert_eq!(info.error, Some(HsError { reason: wkt::ERR_PERM_MEM, data: 2048 }));

        let temp = build_hs_error(VERSION, wkt::ERR_TEMP_MEM, 1, 256).unwrap();
        let info = parse_hs(&temp).unwrap();
        assert_eq!(info.error, Some(HsError { reason: wkt::ERR_TEMP_MEM, data: 1 }));
    }

    #[test]
    fn missing_carrier_reference_fails() {
        let carriers = bt_carrier();
        let ac = [AcInfo { cps: Cps::Active, num_aux_data: 0 }];
        let hr = build_hr(VERSION, 0x1111, &ac, &carriers, 2048).unwrap();
        let info = parse_hr(&hr).unwrap();

        let mut bogus = info.ac.clone();
        bogus[0].carrier_data_ref = b"nope".to_vec();
        assert_eq!(verify_carrier_refs(&hr, &bogus), Err(Status::Failed));
    }

    #[test]
    fn aux_data_references_are_parsed() {
        let mut carriers = Vec::new();
        wkt::add_media_bt_oob(&mut carriers, 512, b"0", &[0x22]).unwrap();
        ndef::add_record(&mut carriers, 512, Tnf::Media, b"text/plain", b"a1", b"aux").unwrap();
        let ac = [AcInfo { cps: Cps::Activating, num_aux_data: 1 }];

        let hr = build_hr(VERSION, 1, &ac, &carriers, 2048).unwrap();
        let info = parse_hr(&hr).unwrap();
        assert_eq!(info.ac[0].aux_data_refs, vec![b"a1".to_vec()]);
        verify_carrier_refs(&hr, &info.ac).unwrap();
    }

    #[test]
    fn simplified_messages_are_probed() {
        let bt = bt_carrier();
        assert_eq!(msg_type(&bt), MsgType::BtOob);

        let mut wifi = Vec::new();
        wkt::add_media_wifi_wsc(&mut wifi, 512, b"w", &[0x10, 0x4a]).unwrap();
        assert_eq!(msg_type(&wifi), MsgType::Wifi);

        let mut text = Vec::new();
        nfc_ndef::rtd::build_text(&mut text, 64, "en", "x").unwrap();
        assert_eq!(msg_type(&text), MsgType::Unknown);
    }
}
