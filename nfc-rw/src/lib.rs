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

//! Reader/writer tag session coordinator.
//!
//! Serializes NDEF detection, read, write, format, lock and raw
//! transceive over one activated tag, drives the sleep→wake reselect
//! sequence for RF interface switches, and runs the background presence
//! check that reports tag departure.

pub mod presence;
pub mod session;

pub use presence::{PresenceProbe, VendorPresenceProbe};
pub use session::{
    ActivationParams, CmdStatus, DeactivateMode, DetectStatus, NdefInfo, Protocol, RfInterface,
    RwConfig, RwDriver, TagAppEvent, TagEvent, TagSession,
};

use nfc_ndef::NdefError;
use thiserror::Error;

/// Errors surfaced by tag operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TagError {
    /// The operation failed
    #[error("operation failed")]
    Failed,
    /// The message does not fit on the tag
    #[error("message too large for the tag")]
    BadLength,
    /// The message is not valid NDEF
    #[error("invalid NDEF message: {0}")]
    InvalidNdef(#[from] NdefError),
    /// The tag left the field or was deactivated
    #[error("tag lost")]
    TagLost,
    /// The response did not fit the caller's buffer
    #[error("response buffer overflow")]
    Overflow,
    /// The deactivate/reselect sequence did not complete in time
    #[error("semantic error in deactivate/select sequence")]
    SemanticError,
}

/// Result type
pub type Result<T> = std::result::Result<T, TagError>;
