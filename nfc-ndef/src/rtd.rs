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

//! Well-known URI and Text record types.
//!
//! The URI abbreviation table is the canonical NFC Forum set; both the
//! record-type registry and the reader-side helpers consult it so that
//! abbreviated and absolute spellings match either way.

use crate::msg::{self, RecordParts, Tnf};
use crate::{NdefError, Result};

/// URI identifier code for a spelled-out (absolute) URI.
pub const URI_ID_ABSOLUTE: u8 = 0x00;

/// The canonical URI prefix abbreviation table.
pub const URI_PREFIXES: [&str; 36] = [
    "",                           /* 0x00 */
    "http://www.",                /* 0x01 */
    "https://www.",               /* 0x02 */
    "http://",                    /* 0x03 */
    "https://",                   /* 0x04 */
    "tel:",                       /* 0x05 */
    "mailto:",                    /* 0x06 */
    "ftp://anonymous:anonymous@", /* 0x07 */
    "ftp://ftp.",                 /* 0x08 */
    "ftps://",                    /* 0x09 */
    "sftp://",                    /* 0x0A */
    "smb://",                     /* 0x0B */
    "nfs://",                     /* 0x0C */
    "ftp://",                     /* 0x0D */
    "dav://",                     /* 0x0E */
    "news:",                      /* 0x0F */
    "telnet://",                  /* 0x10 */
    "imap:",                      /* 0x11 */
    "rtsp://",                    /* 0x12 */
    "urn:",                       /* 0x13 */
    "pop:",                       /* 0x14 */
    "sip:",                       /* 0x15 */
    "sips:",                      /* 0x16 */
    "tftp:",                      /* 0x17 */
    "btspp://",                   /* 0x18 */
    "btl2cap://",                 /* 0x19 */
    "btgoep://",                  /* 0x1A */
    "tcpobex://",                 /* 0x1B */
    "irdaobex://",                /* 0x1C */
    "file://",                    /* 0x1D */
    "urn:epc:id:",                /* 0x1E */
    "urn:epc:tag:",               /* 0x1F */
    "urn:epc:pat:",               /* 0x20 */
    "urn:epc:raw:",               /* 0x21 */
    "urn:epc:",                   /* 0x22 */
    "urn:nfc:",                   /* 0x23 */
];

/// Expansion of a URI abbreviation code, if the code is known.
pub fn prefix(uri_id: u8) -> Option<&'static str> {
    URI_PREFIXES.get(uri_id as usize).copied()
}

/// Split a URI into its abbreviation code and remainder. Returns the
/// first matching table entry, or the absolute code with the full URI.
pub fn abbreviate(uri: &str) -> (u8, &str) {
    for (code, pfx) in URI_PREFIXES.iter().enumerate().skip(1) {
        if uri.starts_with(pfx) {
            return (code as u8, &uri[pfx.len()..]);
        }
    }
    (URI_ID_ABSOLUTE, uri)
}

/// Coarse classification of a record by TNF and type, as surfaced to
/// applications by the tag read path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FriendlyType {
    /// Well-known Text
    Text,
    /// Well-known URI
    Url,
    /// Handover Request
    HandoverRequest,
    /// Handover Select
    HandoverSelect,
    /// Bluetooth OOB carrier configuration
    BtOob,
    /// WiFi Simple Configuration carrier configuration
    WifiWsc,
    /// Anything else
    Other,
}

/// Classify a record from its TNF and type bytes.
pub fn friendly_type(tnf: Tnf, rec_type: &[u8]) -> FriendlyType {
    match tnf {
        Tnf::WellKnown if rec_type == b"T" => FriendlyType::Text,
        Tnf::WellKnown if rec_type == b"U" => FriendlyType::Url,
        Tnf::WellKnown if rec_type == b"Hr" => FriendlyType::HandoverRequest,
        Tnf::WellKnown if rec_type == b"Hs" => FriendlyType::HandoverSelect,
        Tnf::Media if rec_type == crate::wkt::BT_OOB_TYPE => FriendlyType::BtOob,
        Tnf::Media if rec_type == crate::wkt::WIFI_WSC_TYPE => FriendlyType::WifiWsc,
        _ => FriendlyType::Other,
    }
}

/// Append a well-known URI record, abbreviating the prefix.
pub fn build_uri(buf: &mut Vec<u8>, max_size: usize, uri: &str) -> Result<()> {
    let (code, rest) = abbreviate(uri);
    let mut payload = Vec::with_capacity(1 + rest.len());
    payload.push(code);
    payload.extend_from_slice(rest.as_bytes());
    msg::add_record(buf, max_size, Tnf::WellKnown, b"U", &[], &payload)
}

/// Append a well-known Text record with a UTF-8 payload.
pub fn build_text(buf: &mut Vec<u8>, max_size: usize, lang: &str, text: &str) -> Result<()> {
    if lang.len() > 0x3f {
        return Err(NdefError::LengthMismatch);
    }
    let mut payload = Vec::with_capacity(1 + lang.len() + text.len());
    payload.push(lang.len() as u8);
    payload.extend_from_slice(lang.as_bytes());
    payload.extend_from_slice(text.as_bytes());
    msg::add_record(buf, max_size, Tnf::WellKnown, b"T", &[], &payload)
}

fn first_record_payload(message: &[u8], want: FriendlyType) -> Result<&[u8]> {
    let rec = msg::record_by_index(message, 0).ok_or(NdefError::RecordNotFound)?;
    let parts = RecordParts::parse(rec).ok_or(NdefError::RecordNotFound)?;
    if friendly_type(parts.tnf, parts.rec_type) != want {
        return Err(NdefError::RecordNotFound);
    }
    Ok(parts.payload)
}

/// Read the first record as a URI, expanding the abbreviation.
pub fn read_url(message: &[u8]) -> Result<String> {
    let payload = first_record_payload(message, FriendlyType::Url)?;
    let (&code, rest) = payload.split_first().ok_or(NdefError::LengthMismatch)?;
    let pfx = prefix(code).ok_or(NdefError::InvalidType)?;
    Ok(format!("{}{}", pfx, String::from_utf8_lossy(rest)))
}

fn text_fields(payload: &[u8]) -> Result<(&[u8], &[u8])> {
    let (&status, rest) = payload.split_first().ok_or(NdefError::LengthMismatch)?;
    let lang_len = (status & 0x3f) as usize;
    if rest.len() < lang_len {
        return Err(NdefError::LengthMismatch);
    }
    Ok(rest.split_at(lang_len))
}

/// Read the first record as Text.
pub fn read_text(message: &[u8]) -> Result<String> {
    let payload = first_record_payload(message, FriendlyType::Text)?;
    let (_, text) = text_fields(payload)?;
    Ok(String::from_utf8_lossy(text).into_owned())
}

/// Read the language code of the first Text record.
pub fn read_lang(message: &[u8]) -> Result<String> {
    let payload = first_record_payload(message, FriendlyType::Text)?;
    let (lang, _) = text_fields(payload)?;
    Ok(String::from_utf8_lossy(lang).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL_REC: &[u8] = &[
        0xd1, 0x01, 0x0c, 0x55, 0x04, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2e, 0x63, 0x6f,
        0x6d,
    ];
    const TEXT_REC: &[u8] = &[0xd1, 0x01, 0x05, 0x54, 0x02, 0x65, 0x6e, 0x48, 0x69];

    #[test]
    fn read_url_expands_prefix() {
        assert_eq!(read_url(URL_REC).unwrap(), "https://example.com");
    }

    #[test]
    fn read_text_and_lang() {
        assert_eq!(read_text(TEXT_REC).unwrap(), "Hi");
        assert_eq!(read_lang(TEXT_REC).unwrap(), "en");
    }

    #[test]
    fn build_uri_matches_literal_bytes() {
        let mut buf = Vec::new();
        build_uri(&mut buf, 64, "https://example.com").unwrap();
        assert_eq!(buf, URL_REC);
    }

    #[test]
    fn build_text_matches_literal_bytes() {
        let mut buf = Vec::new();
        build_text(&mut buf, 64, "en", "Hi").unwrap();
        assert_eq!(buf, TEXT_REC);
    }

    #[test]
    fn abbreviate_picks_first_table_entry() {
        assert_eq!(abbreviate("https://www.x.org"), (0x02, "x.org"));
        assert_eq!(abbreviate("https://x.org"), (0x04, "x.org"));
        assert_eq!(abbreviate("tel:123"), (0x05, "123"));
        assert_eq!(abbreviate("weird:thing"), (URI_ID_ABSOLUTE, "weird:thing"));
    }

    #[test]
    fn unknown_prefix_code_is_an_error() {
        let mut buf = Vec::new();
        msg::add_record(&mut buf, 64, Tnf::WellKnown, b"U", &[], &[0x7f, b'x']).unwrap();
        assert_eq!(read_url(&buf), Err(NdefError::InvalidType));
    }
}
