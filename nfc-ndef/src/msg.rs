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

//! NDEF message codec.
//!
//! Pure functions over NDEF message byte buffers: validation, record
//! navigation and in-place editing. Parsing never allocates and never
//! panics on malformed input; all multi-byte lengths are big-endian.
//! Editors operate on an owned `Vec<u8>` whose length is the message
//! cursor, bounded by an explicit `max_size`.

use crate::{NdefError, Result};

const MB_MASK: u8 = 0x80;
const ME_MASK: u8 = 0x40;
const CF_MASK: u8 = 0x20;
const SR_MASK: u8 = 0x10;
const IL_MASK: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

/* Well-Known and External record types must use these characters */
const RTD_VALID_START: u8 = 0x20;
const RTD_VALID_END: u8 = 0x7e;

/// Type Name Format of an NDEF record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tnf {
    /// No type, id or payload
    Empty = 0,
    /// NFC Forum well-known type
    WellKnown = 1,
    /// Media type per RFC 2046
    Media = 2,
    /// Absolute URI per RFC 3986
    AbsoluteUri = 3,
    /// NFC Forum external type
    External = 4,
    /// Unknown payload type
    Unknown = 5,
    /// Continuation chunk of the preceding record
    Unchanged = 6,
    /// Reserved by the NFC Forum
    Reserved = 7,
}

impl Tnf {
    /// Decode the 3-bit TNF field of a header byte.
    pub fn from_bits(bits: u8) -> Tnf {
        match bits & TNF_MASK {
            0 => Tnf::Empty,
            1 => Tnf::WellKnown,
            2 => Tnf::Media,
            3 => Tnf::AbsoluteUri,
            4 => Tnf::External,
            5 => Tnf::Unknown,
            6 => Tnf::Unchanged,
            _ => Tnf::Reserved,
        }
    }

    /// The 3-bit wire encoding.
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// The NDEF record header byte. The only place the flag bits are examined
/// or rewritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header(u8);

impl Header {
    /// Wrap a raw header byte.
    pub fn new(byte: u8) -> Header {
        Header(byte)
    }

    /// Message begin
    pub fn mb(self) -> bool {
        self.0 & MB_MASK != 0
    }

    /// Message end
    pub fn me(self) -> bool {
        self.0 & ME_MASK != 0
    }

    /// Chunk flag
    pub fn cf(self) -> bool {
        self.0 & CF_MASK != 0
    }

    /// Short record (1-byte payload length)
    pub fn sr(self) -> bool {
        self.0 & SR_MASK != 0
    }

    /// Id-length field present
    pub fn il(self) -> bool {
        self.0 & IL_MASK != 0
    }

    /// Type Name Format
    pub fn tnf(self) -> Tnf {
        Tnf::from_bits(self.0)
    }

    /// The raw byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    fn with(self, mask: u8, on: bool) -> Header {
        if on {
            Header(self.0 | mask)
        } else {
            Header(self.0 & !mask)
        }
    }

    pub fn with_mb(self, on: bool) -> Header {
        self.with(MB_MASK, on)
    }

    pub fn with_me(self, on: bool) -> Header {
        self.with(ME_MASK, on)
    }

    pub fn with_sr(self, on: bool) -> Header {
        self.with(SR_MASK, on)
    }

    pub fn with_il(self, on: bool) -> Header {
        self.with(IL_MASK, on)
    }
}

/// Field geometry of one record within a message buffer.
#[derive(Clone, Copy, Debug)]
struct RecView {
    hdr: Header,
    type_off: usize,
    type_len: usize,
    id_off: usize,
    id_len: usize,
    payload_off: usize,
    payload_len: usize,
}

impl RecView {
    fn end(&self) -> usize {
        self.payload_off + self.payload_len
    }
}

/// Parse the record header starting at `off`. Bounds-checks the header
/// fields only; callers check the body extent against the buffer.
fn view(msg: &[u8], off: usize) -> Option<RecView> {
    let hdr = Header::new(*msg.get(off)?);
    let type_len = *msg.get(off + 1)? as usize;
    let mut pos = off + 2;
    let payload_len = if hdr.sr() {
        let len = *msg.get(pos)? as usize;
        pos += 1;
        len
    } else {
        let bytes = msg.get(pos..pos + 4)?;
        pos += 4;
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
    };
    let id_len = if hdr.il() {
        let len = *msg.get(pos)? as usize;
        pos += 1;
        len
    } else {
        0
    };
    let type_off = pos;
    let id_off = type_off.checked_add(type_len)?;
    let payload_off = id_off.checked_add(id_len)?;
    payload_off.checked_add(payload_len)?;
    Some(RecView { hdr, type_off, type_len, id_off, id_len, payload_off, payload_len })
}

/// Validate an NDEF message, enforcing every structural invariant in one
/// scan. Never allocates.
pub fn validate(msg: &[u8], allow_chunks: bool) -> Result<()> {
    if msg.len() < 3 {
        return Err(NdefError::MsgTooShort);
    }

    /* The first record must have the MB bit set and cannot be a chunk
     * continuation */
    let first = Header::new(msg[0]);
    if !first.mb() {
        return Err(NdefError::NoMsgBegin);
    }
    if first.tnf() == Tnf::Unchanged {
        return Err(NdefError::UnexpectedChunk);
    }

    let end = msg.len();
    let mut pos = 0usize;
    let mut count = 0usize;
    let mut in_chunk = false;
    let mut saw_me = false;

    while pos < end {
        if pos + 3 > end {
            return Err(NdefError::MsgTooShort);
        }
        let hdr = Header::new(msg[pos]);
        pos += 1;

        if hdr.tnf() == Tnf::Reserved {
            return Err(NdefError::InvalidChunk);
        }
        if count > 0 && hdr.mb() {
            return Err(NdefError::ExtraMsgBegin);
        }

        let type_len = msg[pos] as usize;
        pos += 1;

        /* The first chunk must carry the real type unless its TNF is Unknown */
        if hdr.cf() && hdr.mb() && type_len == 0 && hdr.tnf() != Tnf::Unknown {
            return Err(NdefError::InvalidChunk);
        }

        let payload_len = if hdr.sr() {
            let len = msg[pos] as usize;
            pos += 1;
            len
        } else {
            if pos + 4 > end {
                return Err(NdefError::MsgTooShort);
            }
            let len = u32::from_be_bytes([msg[pos], msg[pos + 1], msg[pos + 2], msg[pos + 3]]);
            pos += 4;
            len as usize
        };

        let id_len = if hdr.il() {
            if pos + 1 > end {
                return Err(NdefError::MsgTooShort);
            }
            let len = msg[pos] as usize;
            pos += 1;
            len
        } else {
            /* An empty record must carry the id-length field */
            if hdr.tnf() == Tnf::Empty {
                return Err(NdefError::InvalidEmptyRecord);
            }
            0
        };

        if hdr.cf() {
            if !allow_chunks {
                return Err(NdefError::UnexpectedChunk);
            }
            if in_chunk {
                if type_len != 0 || id_len != 0 || hdr.tnf() != Tnf::Unchanged {
                    return Err(NdefError::InvalidChunk);
                }
            } else {
                if hdr.tnf() == Tnf::Unchanged {
                    return Err(NdefError::InvalidChunk);
                }
                in_chunk = true;
            }
        } else if in_chunk {
            /* the terminating chunk */
            if type_len != 0 || id_len != 0 || hdr.tnf() != Tnf::Unchanged {
                return Err(NdefError::InvalidChunk);
            }
            in_chunk = false;
        } else if hdr.tnf() == Tnf::Unchanged {
            return Err(NdefError::InvalidChunk);
        }

        if hdr.tnf() == Tnf::Empty && (type_len != 0 || id_len != 0 || payload_len != 0) {
            return Err(NdefError::InvalidEmptyRecord);
        }
        if hdr.tnf() == Tnf::Unknown && type_len != 0 {
            return Err(NdefError::LengthMismatch);
        }
        if hdr.tnf() == Tnf::External && type_len == 0 {
            return Err(NdefError::LengthMismatch);
        }
        if matches!(hdr.tnf(), Tnf::External | Tnf::WellKnown) {
            if pos + type_len > end {
                return Err(NdefError::MsgTooShort);
            }
            for &byte in &msg[pos..pos + type_len] {
                if !(RTD_VALID_START..=RTD_VALID_END).contains(&byte) {
                    return Err(NdefError::InvalidType);
                }
            }
        }

        let body = payload_len
            .checked_add(type_len)
            .and_then(|len| len.checked_add(id_len))
            .ok_or(NdefError::LengthMismatch)?;
        if body > end {
            return Err(NdefError::LengthMismatch);
        }
        let next = pos.checked_add(body).ok_or(NdefError::LengthMismatch)?;
        if next > end {
            return Err(NdefError::LengthMismatch);
        }
        pos = next;
        count += 1;

        if hdr.me() {
            saw_me = true;
            break;
        }
    }

    if !saw_me {
        return Err(NdefError::NoMsgEnd);
    }
    /* all the length fields must add up to the buffer end */
    if pos != end {
        return Err(NdefError::LengthMismatch);
    }

    Ok(())
}

/// Iterator over the records of a message. Yields the full wire bytes of
/// each record and stops after the record carrying the ME flag, or early
/// when a record does not fit the buffer.
pub struct RecordIter<'a> {
    msg: &'a [u8],
    off: usize,
    done: bool,
}

impl<'a> RecordIter<'a> {
    fn step(&mut self) -> Option<(usize, RecView)> {
        if self.done || self.off >= self.msg.len() {
            return None;
        }
        let v = view(self.msg, self.off)?;
        if v.end() > self.msg.len() {
            self.done = true;
            return None;
        }
        let off = self.off;
        self.off = v.end();
        if v.hdr.me() {
            self.done = true;
        }
        Some((off, v))
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let (off, v) = self.step()?;
        Some(&self.msg[off..v.end()])
    }
}

/// Iterate the records of `msg`.
pub fn records(msg: &[u8]) -> RecordIter<'_> {
    RecordIter { msg, off: 0, done: false }
}

/// Number of records in the message.
pub fn record_count(msg: &[u8]) -> usize {
    records(msg).count()
}

/// Full wire length of the record starting at the head of `rec`.
pub fn record_len(rec: &[u8]) -> Option<usize> {
    let v = view(rec, 0)?;
    (v.end() <= rec.len()).then_some(v.end())
}

/// Byte offset of the record with the given zero-based index.
pub fn record_offset(msg: &[u8], index: usize) -> Option<usize> {
    let mut iter = records(msg);
    let mut seen = 0usize;
    while let Some((off, _)) = iter.step() {
        if seen == index {
            return Some(off);
        }
        seen += 1;
    }
    None
}

/// Offset of the last record in the message.
pub fn last_record_offset(msg: &[u8]) -> Option<usize> {
    let mut iter = records(msg);
    let mut last = None;
    while let Some((off, _)) = iter.step() {
        last = Some(off);
    }
    last
}

/// The record with the given zero-based index.
pub fn record_by_index(msg: &[u8], index: usize) -> Option<&[u8]> {
    records(msg).nth(index)
}

/// First record matching the given TNF and type bytes.
pub fn find_by_type<'a>(msg: &'a [u8], tnf: Tnf, rec_type: &[u8]) -> Option<&'a [u8]> {
    records(msg).find(|rec| {
        RecordParts::parse(rec).is_some_and(|p| p.tnf == tnf && p.rec_type == rec_type)
    })
}

/// First record carrying the given payload id.
pub fn find_by_id<'a>(msg: &'a [u8], id: &[u8]) -> Option<&'a [u8]> {
    records(msg).find(|rec| RecordParts::parse(rec).is_some_and(|p| p.id == id))
}

/// Zero-copy decomposition of one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordParts<'a> {
    /// Type Name Format
    pub tnf: Tnf,
    /// Type bytes
    pub rec_type: &'a [u8],
    /// Payload id bytes (empty when absent)
    pub id: &'a [u8],
    /// Payload bytes
    pub payload: &'a [u8],
}

impl<'a> RecordParts<'a> {
    /// Decompose the record at the head of `rec` into sub-slices.
    pub fn parse(rec: &'a [u8]) -> Option<RecordParts<'a>> {
        let v = view(rec, 0)?;
        if v.end() > rec.len() {
            return None;
        }
        Some(RecordParts {
            tnf: v.hdr.tnf(),
            rec_type: &rec[v.type_off..v.type_off + v.type_len],
            id: &rec[v.id_off..v.id_off + v.id_len],
            payload: &rec[v.payload_off..v.payload_off + v.payload_len],
        })
    }

    /// The record header byte.
    pub fn header(rec: &[u8]) -> Option<Header> {
        rec.first().map(|&b| Header::new(b))
    }
}

/// Reset the buffer to an empty message.
pub fn init(buf: &mut Vec<u8>) {
    buf.clear();
}

/// Append one record to the end of the message. The new record receives
/// the ME flag (plus MB when it is the first); the previous last record
/// loses ME. SR is chosen by the payload length, IL by a non-empty id.
pub fn add_record(
    buf: &mut Vec<u8>,
    max_size: usize,
    tnf: Tnf,
    rec_type: &[u8],
    id: &[u8],
    payload: &[u8],
) -> Result<()> {
    if rec_type.len() > 255 || id.len() > 255 {
        return Err(NdefError::LengthMismatch);
    }

    let plen = if payload.len() < 256 { 1 } else { 4 };
    let ilen = usize::from(!id.is_empty());
    let rec_size = 2 + plen + ilen + rec_type.len() + id.len() + payload.len();
    if buf.len() + rec_size > max_size {
        return Err(NdefError::InsufficientMem);
    }

    let mut hdr = Header::new(tnf.bits()).with_me(true);
    if buf.is_empty() {
        hdr = hdr.with_mb(true);
    } else {
        let last = last_record_offset(buf).ok_or(NdefError::NoMsgEnd)?;
        buf[last] = Header::new(buf[last]).with_me(false).bits();
    }
    if plen == 1 {
        hdr = hdr.with_sr(true);
    }
    if ilen != 0 {
        hdr = hdr.with_il(true);
    }

    buf.push(hdr.bits());
    buf.push(rec_type.len() as u8);
    if plen == 1 {
        buf.push(payload.len() as u8);
    } else {
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    }
    if ilen != 0 {
        buf.push(id.len() as u8);
    }
    buf.extend_from_slice(rec_type);
    buf.extend_from_slice(id);
    buf.extend_from_slice(payload);
    Ok(())
}

/// Append every record of `other` to the end of the message, fixing up
/// the MB/ME flags.
pub fn append_message(buf: &mut Vec<u8>, max_size: usize, other: &[u8]) -> Result<()> {
    for rec in records(other) {
        let p = RecordParts::parse(rec).ok_or(NdefError::RecordNotFound)?;
        add_record(buf, max_size, p.tnf, p.rec_type, p.id, p.payload)?;
    }
    Ok(())
}

fn write_payload_len(buf: &mut [u8], rec_off: usize, len: usize) {
    if Header::new(buf[rec_off]).sr() {
        buf[rec_off + 2] = len as u8;
    } else {
        buf[rec_off + 2..rec_off + 6].copy_from_slice(&(len as u32).to_be_bytes());
    }
}

fn checked_view(buf: &[u8], rec_off: usize) -> Result<RecView> {
    match view(buf, rec_off) {
        Some(v) if v.end() <= buf.len() => Ok(v),
        _ => Err(NdefError::RecordNotFound),
    }
}

/// Grow the payload of the record at `rec_off` by `extra`. Crossing the
/// 255-byte boundary promotes the payload length field from 1 to 4 bytes
/// and clears SR.
pub fn append_payload(
    buf: &mut Vec<u8>,
    max_size: usize,
    rec_off: usize,
    extra: &[u8],
) -> Result<()> {
    let v = checked_view(buf, rec_off)?;
    let prev_len = v.payload_len;
    let new_len = prev_len + extra.len();
    let widen = prev_len < 256 && new_len > 255;

    let grow = extra.len() + if widen { 3 } else { 0 };
    if buf.len() + grow > max_size {
        return Err(NdefError::InsufficientMem);
    }

    let mut payload_off = v.payload_off;
    if widen {
        buf.splice(rec_off + 3..rec_off + 3, [0u8; 3]);
        buf[rec_off] = Header::new(buf[rec_off]).with_sr(false).bits();
        payload_off += 3;
    }
    write_payload_len(buf, rec_off, new_len);

    let insert_at = payload_off + prev_len;
    buf.splice(insert_at..insert_at, extra.iter().copied());
    Ok(())
}

/// Replace the payload of the record at `rec_off`, shifting the rest of
/// the message and promoting or demoting the SR form as needed.
pub fn replace_payload(
    buf: &mut Vec<u8>,
    max_size: usize,
    rec_off: usize,
    new_payload: &[u8],
) -> Result<()> {
    let v = checked_view(buf, rec_off)?;
    let prev_len = v.payload_len;
    let new_len = new_payload.len();
    let mut payload_off = v.payload_off;

    if new_len > prev_len {
        let delta = new_len - prev_len;
        if prev_len < 256 && new_len > 255 {
            if buf.len() + delta + 3 > max_size {
                return Err(NdefError::InsufficientMem);
            }
            buf.splice(rec_off + 3..rec_off + 3, [0u8; 3]);
            buf[rec_off] = Header::new(buf[rec_off]).with_sr(false).bits();
            payload_off += 3;
        } else if buf.len() + delta > max_size {
            return Err(NdefError::InsufficientMem);
        }
        write_payload_len(buf, rec_off, new_len);
        let end = payload_off + prev_len;
        buf.splice(end..end, std::iter::repeat(0u8).take(delta));
    } else if new_len < prev_len {
        let delta = prev_len - new_len;
        if prev_len > 255 && new_len < 256 {
            buf.drain(rec_off + 3..rec_off + 6);
            buf[rec_off] = Header::new(buf[rec_off]).with_sr(true).bits();
            payload_off -= 3;
        }
        write_payload_len(buf, rec_off, new_len);
        let end = payload_off + prev_len;
        buf.drain(end - delta..end);
    }

    buf[payload_off..payload_off + new_len].copy_from_slice(new_payload);
    Ok(())
}

/// Replace the type field of the record at `rec_off`.
pub fn replace_type(
    buf: &mut Vec<u8>,
    max_size: usize,
    rec_off: usize,
    new_type: &[u8],
) -> Result<()> {
    if new_type.len() > 255 {
        return Err(NdefError::LengthMismatch);
    }
    let v = checked_view(buf, rec_off)?;
    let prev_len = v.type_len;
    let new_len = new_type.len();

    if new_len > prev_len {
        let delta = new_len - prev_len;
        if buf.len() + delta > max_size {
            return Err(NdefError::InsufficientMem);
        }
        let end = v.type_off + prev_len;
        buf.splice(end..end, std::iter::repeat(0u8).take(delta));
    } else if new_len < prev_len {
        let delta = prev_len - new_len;
        let end = v.type_off + prev_len;
        buf.drain(end - delta..end);
    }

    buf[rec_off + 1] = new_len as u8;
    buf[v.type_off..v.type_off + new_len].copy_from_slice(new_type);
    Ok(())
}

/// Replace the id field of the record at `rec_off`, inserting or
/// removing the id-length field (and the IL flag) as needed.
pub fn replace_id(buf: &mut Vec<u8>, max_size: usize, rec_off: usize, new_id: &[u8]) -> Result<()> {
    if new_id.len() > 255 {
        return Err(NdefError::LengthMismatch);
    }
    let v = checked_view(buf, rec_off)?;
    let prev_len = v.id_len;
    let new_len = new_id.len();
    let idlen_field = rec_off + 2 + if v.hdr.sr() { 1 } else { 4 };
    let mut id_off = v.id_off;

    if new_len > prev_len {
        let delta = new_len - prev_len;
        if prev_len == 0 {
            if buf.len() + delta + 1 > max_size {
                return Err(NdefError::InsufficientMem);
            }
            buf.splice(idlen_field..idlen_field, [0u8]);
            buf[rec_off] = Header::new(buf[rec_off]).with_il(true).bits();
            id_off += 1;
        } else if buf.len() + delta > max_size {
            return Err(NdefError::InsufficientMem);
        }
        let end = id_off + prev_len;
        buf.splice(end..end, std::iter::repeat(0u8).take(delta));
    } else if new_len < prev_len {
        let delta = prev_len - new_len;
        let end = id_off + prev_len;
        buf.drain(end - delta..end);
        if new_len == 0 {
            buf.drain(idlen_field..idlen_field + 1);
            buf[rec_off] = Header::new(buf[rec_off]).with_il(false).bits();
        }
    }

    if new_len > 0 {
        buf[idlen_field] = new_len as u8;
        buf[id_off..id_off + new_len].copy_from_slice(new_id);
    }
    Ok(())
}

/// Remove the record with the given index, moving the MB/ME flags onto
/// its neighbors and closing the gap.
pub fn remove_record(buf: &mut Vec<u8>, index: usize) -> Result<()> {
    let off = record_offset(buf, index).ok_or(NdefError::RecordNotFound)?;
    let v = checked_view(buf, off)?;

    if v.hdr.mb() {
        match record_offset(buf, 1) {
            Some(second) => {
                buf[second] = Header::new(buf[second]).with_mb(true).bits();
                buf.drain(0..second);
            }
            None => buf.clear(),
        }
        return Ok(());
    }

    if v.hdr.me() {
        if index > 0 {
            let prev = record_offset(buf, index - 1).ok_or(NdefError::RecordNotFound)?;
            buf[prev] = Header::new(buf[prev]).with_me(true).bits();
        }
        buf.truncate(off);
        return Ok(());
    }

    buf.drain(off..v.end());
    Ok(())
}

/// Validate `src` allowing chunks, then re-emit it chunk-free: every
/// `Unchanged` continuation payload is appended to the record it
/// continues.
pub fn copy_and_dechunk(src: &[u8]) -> Result<Vec<u8>> {
    validate(src, true)?;

    let max_out = src.len();
    let mut out = Vec::with_capacity(max_out);
    let mut prev_off = 0usize;

    for rec in records(src) {
        let p = RecordParts::parse(rec).ok_or(NdefError::RecordNotFound)?;
        if p.tnf == Tnf::Unchanged {
            if !p.payload.is_empty() {
                append_payload(&mut out, max_out, prev_off, p.payload)?;
            }
        } else {
            prev_off = out.len();
            add_record(&mut out, max_out, p.tnf, p.rec_type, p.id, p.payload)?;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /* Well-known URI record: "https://example.com" abbreviated with 0x04 */
    const URL_REC: &[u8] = &[
        0xd1, 0x01, 0x0c, 0x55, 0x04, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x2e, 0x63, 0x6f,
        0x6d,
    ];

    /* Well-known Text record: language "en", text "Hi" */
    const TEXT_REC: &[u8] = &[0xd1, 0x01, 0x05, 0x54, 0x02, 0x65, 0x6e, 0x48, 0x69];

    #[test]
    fn validate_minimal_url_record() {
        assert_eq!(validate(URL_REC, false), Ok(()));
        let p = RecordParts::parse(URL_REC).unwrap();
        assert_eq!(p.tnf, Tnf::WellKnown);
        assert_eq!(p.rec_type, b"U");
        assert_eq!(p.payload[0], 0x04);
        assert_eq!(&p.payload[1..], b"example.com");
    }

    #[test]
    fn validate_text_record() {
        assert_eq!(validate(TEXT_REC, false), Ok(()));
        let p = RecordParts::parse(TEXT_REC).unwrap();
        assert_eq!(p.rec_type, b"T");
        assert_eq!(p.payload, &[0x02, 0x65, 0x6e, 0x48, 0x69]);
    }

    #[test]
    fn validate_rejects_short_and_missing_flags() {
        assert_eq!(validate(&[], false), Err(NdefError::MsgTooShort));
        assert_eq!(validate(&[0xd1, 0x01], false), Err(NdefError::MsgTooShort));
        /* no MB on the first record */
        assert_eq!(validate(&[0x51, 0x01, 0x00, 0x55], false), Err(NdefError::NoMsgBegin));
        /* MB but never ME */
        assert_eq!(validate(&[0x91, 0x01, 0x00, 0x55], false), Err(NdefError::NoMsgEnd));
    }

    #[test]
    fn validate_rejects_extra_msg_begin() {
        let mut buf = Vec::new();
        add_record(&mut buf, 64, Tnf::WellKnown, b"T", &[], b"a").unwrap();
        add_record(&mut buf, 64, Tnf::WellKnown, b"T", &[], b"b").unwrap();
        let second = record_offset(&buf, 1).unwrap();
        buf[second] |= 0x80;
        assert_eq!(validate(&buf, false), Err(NdefError::ExtraMsgBegin));
    }

    #[test]
    fn validate_rejects_invalid_empty_record() {
        /* Empty TNF with a payload byte */
        let msg = [0xd0, 0x00, 0x01, 0xaa];
        assert_eq!(validate(&msg, false), Err(NdefError::InvalidEmptyRecord));
    }

    #[test]
    fn validate_rejects_unknown_with_type() {
        /* TNF Unknown with a nonzero type length */
        let msg = [0xd5, 0x01, 0x00, 0x55];
        assert_eq!(validate(&msg, false), Err(NdefError::LengthMismatch));
    }

    #[test]
    fn validate_rejects_declared_length_past_buffer() {
        /* SR payload length of 5 but only 2 payload bytes present */
        let msg = [0xd1, 0x01, 0x05, 0x54, 0xaa, 0xbb];
        assert_eq!(validate(&msg, false), Err(NdefError::LengthMismatch));
    }

    #[test]
    fn validate_rejects_bad_type_characters() {
        let msg = [0xd1, 0x01, 0x00, 0x1f];
        assert_eq!(validate(&msg, false), Err(NdefError::InvalidType));
    }

    #[test]
    fn validate_rejects_chunks_when_not_allowed() {
        let chunked = chunked_message();
        assert_eq!(validate(&chunked, true), Ok(()));
        assert_eq!(validate(&chunked, false), Err(NdefError::UnexpectedChunk));
    }

    #[test]
    fn add_and_iterate_round_trip() {
        let tuples: &[(Tnf, &[u8], &[u8], Vec<u8>)] = &[
            (Tnf::WellKnown, b"T", b"", b"hello".to_vec()),
            (Tnf::Media, b"application/vnd.wfa.wsc", b"0", vec![0x10; 40]),
            (Tnf::External, b"example.com:x", b"id2", vec![0xa5; 300]),
        ];
        let mut buf = Vec::new();
        for (tnf, t, id, pl) in tuples {
            add_record(&mut buf, 1024, *tnf, t, id, pl).unwrap();
        }
        assert_eq!(validate(&buf, false), Ok(()));
        assert_eq!(record_count(&buf), tuples.len());

        let collected: Vec<_> = records(&buf).map(|r| RecordParts::parse(r).unwrap()).collect();
        for (got, (tnf, t, id, pl)) in collected.iter().zip(tuples) {
            assert_eq!(got.tnf, *tnf);
            assert_eq!(got.rec_type, *t);
            assert_eq!(got.id, *id);
            assert_eq!(got.payload, &pl[..]);
        }

        /* first has MB, last has ME, nothing in between */
        let offs: Vec<_> = (0..tuples.len()).map(|i| record_offset(&buf, i).unwrap()).collect();
        assert!(Header::new(buf[offs[0]]).mb());
        assert!(!Header::new(buf[offs[1]]).mb());
        assert!(!Header::new(buf[offs[1]]).me());
        assert!(Header::new(buf[*offs.last().unwrap()]).me());
    }

    #[test]
    fn record_length_sums_to_message_length() {
        let mut buf = Vec::new();
        add_record(&mut buf, 2048, Tnf::WellKnown, b"T", b"a", b"one").unwrap();
        add_record(&mut buf, 2048, Tnf::Media, b"text/plain", &[], &[0u8; 700]).unwrap();
        add_record(&mut buf, 2048, Tnf::WellKnown, b"U", b"b", b"two").unwrap();
        let total: usize = records(&buf).map(|r| record_len(r).unwrap()).sum();
        assert_eq!(total, buf.len());
    }

    #[test]
    fn add_record_fails_when_full() {
        let mut buf = Vec::new();
        assert_eq!(
            add_record(&mut buf, 8, Tnf::WellKnown, b"T", &[], b"too big for eight"),
            Err(NdefError::InsufficientMem)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn append_payload_promotes_short_record() {
        let mut buf = Vec::new();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"T", &[], &[0x11; 255]).unwrap();
        let before = buf.len();
        assert!(Header::new(buf[0]).sr());

        append_payload(&mut buf, 1024, 0, &[0x22]).unwrap();
        /* one payload byte plus the 3-byte length-field widening */
        assert_eq!(buf.len(), before + 4);
        assert!(!Header::new(buf[0]).sr());
        assert_eq!(validate(&buf, false), Ok(()));
        let p = RecordParts::parse(&buf).unwrap();
        assert_eq!(p.payload.len(), 256);
        assert_eq!(p.payload[255], 0x22);
    }

    #[test]
    fn replace_payload_demotes_across_boundary() {
        let mut buf = Vec::new();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"T", &[], &[0x33; 256]).unwrap();
        assert!(!Header::new(buf[0]).sr());
        let long = buf.len();

        replace_payload(&mut buf, 1024, 0, &[0x44; 255]).unwrap();
        assert!(Header::new(buf[0]).sr());
        /* one payload byte and three length-field bytes shorter */
        assert_eq!(buf.len(), long - 4);
        assert_eq!(validate(&buf, false), Ok(()));
        assert_eq!(RecordParts::parse(&buf).unwrap().payload, &[0x44u8; 255][..]);
    }

    #[test]
    fn append_then_replace_back_is_identity() {
        let mut buf = Vec::new();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"T", b"i", b"abc").unwrap();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"U", &[], b"xyz").unwrap();
        let orig = buf.clone();

        append_payload(&mut buf, 1024, 0, b"defgh").unwrap();
        assert_ne!(buf, orig);
        replace_payload(&mut buf, 1024, 0, b"abc").unwrap();
        assert_eq!(buf, orig);
    }

    #[test]
    fn replace_type_and_id_shift_atomically() {
        let mut buf = Vec::new();
        add_record(&mut buf, 1024, Tnf::External, b"a.com:t", b"id", b"payload").unwrap();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"T", &[], b"tail").unwrap();
        let orig = buf.clone();

        replace_type(&mut buf, 1024, 0, b"example.org:longer").unwrap();
        assert_eq!(validate(&buf, false), Ok(()));
        assert_eq!(RecordParts::parse(&buf).unwrap().rec_type, b"example.org:longer");
        replace_type(&mut buf, 1024, 0, b"a.com:t").unwrap();
        assert_eq!(buf, orig);

        replace_id(&mut buf, 1024, 0, b"a-new-longer-id").unwrap();
        assert_eq!(validate(&buf, false), Ok(()));
        assert_eq!(RecordParts::parse(&buf).unwrap().id, b"a-new-longer-id");
        replace_id(&mut buf, 1024, 0, b"id").unwrap();
        assert_eq!(buf, orig);
    }

    #[test]
    fn replace_id_adds_and_removes_il() {
        let mut buf = Vec::new();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"T", &[], b"body").unwrap();
        let orig = buf.clone();
        assert!(!Header::new(buf[0]).il());

        replace_id(&mut buf, 1024, 0, b"name").unwrap();
        assert!(Header::new(buf[0]).il());
        assert_eq!(validate(&buf, false), Ok(()));
        assert_eq!(RecordParts::parse(&buf).unwrap().id, b"name");

        replace_id(&mut buf, 1024, 0, &[]).unwrap();
        assert_eq!(buf, orig);
    }

    #[test]
    fn remove_record_moves_flags() {
        let mut buf = Vec::new();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"T", &[], b"one").unwrap();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"T", &[], b"two").unwrap();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"T", &[], b"three").unwrap();

        /* removing the middle record leaves the flags alone */
        let mut mid = buf.clone();
        remove_record(&mut mid, 1).unwrap();
        assert_eq!(validate(&mid, false), Ok(()));
        assert_eq!(record_count(&mid), 2);

        /* removing the first moves MB onto the next */
        let mut first = buf.clone();
        remove_record(&mut first, 0).unwrap();
        assert_eq!(validate(&first, false), Ok(()));
        assert!(Header::new(first[0]).mb());

        /* removing the last sets ME on the new last */
        let mut last = buf.clone();
        remove_record(&mut last, 2).unwrap();
        assert_eq!(validate(&last, false), Ok(()));
        let new_last = last_record_offset(&last).unwrap();
        assert!(Header::new(last[new_last]).me());
    }

    #[test]
    fn remove_and_re_add_last_restores_bytes() {
        let mut buf = Vec::new();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"T", &[], b"one").unwrap();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"U", b"x", b"two").unwrap();
        let orig = buf.clone();

        remove_record(&mut buf, 1).unwrap();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"U", b"x", b"two").unwrap();
        assert_eq!(buf, orig);
    }

    /// One record split into three chunks: payload "abc" + "def" + "gh".
    fn chunked_message() -> Vec<u8> {
        let mut buf = Vec::new();
        /* MB|CF|SR, WKT "T" */
        buf.extend_from_slice(&[0xb1, 0x01, 0x03, 0x54]);
        buf.extend_from_slice(b"abc");
        /* CF|SR, Unchanged */
        buf.extend_from_slice(&[0x36, 0x00, 0x03]);
        buf.extend_from_slice(b"def");
        /* ME|SR, Unchanged */
        buf.extend_from_slice(&[0x56, 0x00, 0x02]);
        buf.extend_from_slice(b"gh");
        buf
    }

    #[test]
    fn dechunk_produces_chunk_free_equivalent() {
        let chunked = chunked_message();
        let flat = copy_and_dechunk(&chunked).unwrap();
        assert_eq!(validate(&flat, false), Ok(()));
        assert!(records(&flat)
            .all(|r| RecordParts::parse(r).unwrap().tnf != Tnf::Unchanged));

        let p = RecordParts::parse(&flat).unwrap();
        assert_eq!(p.tnf, Tnf::WellKnown);
        assert_eq!(p.rec_type, b"T");
        assert_eq!(p.payload, b"abcdefgh");
    }

    #[test]
    fn dechunk_keeps_surrounding_records() {
        let mut buf = Vec::new();
        add_record(&mut buf, 1024, Tnf::WellKnown, b"U", &[], b"\x04x.com").unwrap();
        /* chunk set followed by a plain record, assembled by hand */
        let mut msg = chunked_message();
        let last_chunk = last_record_offset(&msg).unwrap();
        msg[last_chunk] &= !0x40; /* the chunk set no longer ends the message */
        let tail_off = msg.len();
        msg.extend_from_slice(&buf);
        msg[tail_off] &= !0x80; /* only the first record keeps MB */

        assert_eq!(validate(&msg, true), Ok(()));
        let flat = copy_and_dechunk(&msg).unwrap();
        assert_eq!(validate(&flat, false), Ok(()));
        assert_eq!(record_count(&flat), 2);
        let last = record_by_index(&flat, 1).unwrap();
        assert_eq!(RecordParts::parse(last).unwrap().payload, b"\x04x.com");
    }
}
