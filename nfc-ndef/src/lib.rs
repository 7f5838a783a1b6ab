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

//! NFC Data Exchange Format (NDEF) support.
//! Provides the binary message codec, the record-type handler registry
//! and builders for the well-known record types used by tag I/O and
//! Connection Handover.

pub mod msg;
pub mod registry;
pub mod rtd;
pub mod wkt;

pub use msg::{Header, RecordIter, RecordParts, Tnf};

use thiserror::Error;

/// Errors reported by the NDEF codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum NdefError {
    /// Buffer ends before a complete record header or type field
    #[error("message too short")]
    MsgTooShort,
    /// First record does not carry the message-begin flag
    #[error("no message begin")]
    NoMsgBegin,
    /// No record carries the message-end flag
    #[error("no message end")]
    NoMsgEnd,
    /// A record after the first carries the message-begin flag
    #[error("extra message begin")]
    ExtraMsgBegin,
    /// Chunked record found where chunks are not allowed
    #[error("unexpected chunk")]
    UnexpectedChunk,
    /// Malformed chunk sequence
    #[error("invalid chunk")]
    InvalidChunk,
    /// Empty-TNF record carries type, id or payload bytes
    #[error("invalid empty record")]
    InvalidEmptyRecord,
    /// Declared lengths disagree with the enclosing buffer
    #[error("length mismatch")]
    LengthMismatch,
    /// Invalid characters in a Well-Known or External record type
    #[error("invalid record type")]
    InvalidType,
    /// No record at the requested position
    #[error("record not found")]
    RecordNotFound,
    /// The edit does not fit within the buffer limit
    #[error("insufficient memory")]
    InsufficientMem,
}

/// Result type
pub type Result<T> = std::result::Result<T, NdefError>;
