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

//! NDEF record-type handler registry.
//!
//! Incoming NDEF messages are dispatched record by record to handlers
//! registered by TNF and type name. Well-known URI handlers match both
//! the abbreviated and the absolute spelling of their prefix; a default
//! handler in slot 0 receives anything unclaimed.

use crate::msg::{self, RecordParts, Tnf};
use crate::rtd;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Number of handler slots, slot 0 reserved for the default handler.
pub const MAX_HANDLERS: usize = 32;

const DEFAULT_IDX: usize = 0;

/// Returned when every handler slot is occupied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("no free handler slot")]
pub struct RegistryFull;

/// Opaque reference to a registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle(usize);

/// Handler callback: receives the matched record, or the whole message
/// for whole-message registrations.
pub type Handler = Box<dyn FnMut(Handle, &[u8]) + Send>;

/// A registry shared between the stack components that feed it and the
/// components that register handlers with it.
pub type SharedRegistry = Arc<Mutex<TypeRegistry>>;

struct Entry {
    tnf: Tnf,
    /// Type name, or the absolute URI for absolute-URI registrations.
    name: Vec<u8>,
    whole_message: bool,
    wkt_uri: bool,
    uri_id: u8,
    notified: bool,
    handler: Handler,
}

/// Fixed-capacity table of NDEF record-type handlers.
pub struct TypeRegistry {
    entries: Vec<Option<Entry>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> TypeRegistry {
        TypeRegistry { entries: (0..MAX_HANDLERS).map(|_| None).collect() }
    }

    /// Create an empty shared registry.
    pub fn new_shared() -> SharedRegistry {
        Arc::new(Mutex::new(TypeRegistry::new()))
    }

    fn insert(&mut self, entry: Entry) -> Result<Handle, RegistryFull> {
        for idx in DEFAULT_IDX + 1..MAX_HANDLERS {
            if self.entries[idx].is_none() {
                self.entries[idx] = Some(entry);
                return Ok(Handle(idx));
            }
        }
        Err(RegistryFull)
    }

    /// Register a handler for records of the given TNF and type name.
    pub fn register(
        &mut self,
        tnf: Tnf,
        type_name: &[u8],
        whole_message: bool,
        handler: Handler,
    ) -> Result<Handle, RegistryFull> {
        self.insert(Entry {
            tnf,
            name: type_name.to_vec(),
            whole_message,
            wkt_uri: false,
            uri_id: 0,
            notified: false,
            handler,
        })
    }

    /// Register a handler for well-known URI records with the given
    /// abbreviation code, or for an absolute URI when `uri_id` is
    /// [`rtd::URI_ID_ABSOLUTE`] (then `abs_uri` holds the URI).
    pub fn register_wkt_uri(
        &mut self,
        uri_id: u8,
        abs_uri: &[u8],
        whole_message: bool,
        handler: Handler,
    ) -> Result<Handle, RegistryFull> {
        self.insert(Entry {
            tnf: Tnf::WellKnown,
            name: abs_uri.to_vec(),
            whole_message,
            wkt_uri: true,
            uri_id,
            notified: false,
            handler,
        })
    }

    /// Install the default handler; replaces any previous one.
    pub fn register_default(&mut self, handler: Handler) -> Handle {
        if self.entries[DEFAULT_IDX].is_some() {
            warn!("default NDEF handler being changed");
        }
        self.entries[DEFAULT_IDX] = Some(Entry {
            tnf: Tnf::Empty,
            name: Vec::new(),
            whole_message: false,
            wkt_uri: false,
            uri_id: 0,
            notified: false,
            handler,
        });
        Handle(DEFAULT_IDX)
    }

    /// Free a handler slot.
    pub fn deregister(&mut self, handle: Handle) {
        if handle.0 < MAX_HANDLERS {
            self.entries[handle.0] = None;
        }
    }

    /// Free every slot (global shutdown).
    pub fn deregister_all(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
    }

    fn entry_matches(entry: &Entry, parts: &RecordParts) -> bool {
        if entry.tnf != parts.tnf {
            return false;
        }
        if !entry.wkt_uri {
            return entry.name.len() == parts.rec_type.len()
                && (parts.rec_type.is_empty() || entry.name == parts.rec_type);
        }

        /* URI handler: the record must be a well-known "U" record */
        if parts.rec_type != b"U" || parts.payload.is_empty() {
            return false;
        }
        let rec_id = parts.payload[0];

        if parts.payload.len() > 1 && rec_id == entry.uri_id {
            if entry.uri_id != rtd::URI_ID_ABSOLUTE {
                return true;
            }
            /* both absolute: compare the spelled-out URI */
            return parts.payload.len() > entry.name.len()
                && parts.payload[1..].starts_with(&entry.name);
        }

        if entry.uri_id == rtd::URI_ID_ABSOLUTE && rec_id != rtd::URI_ID_ABSOLUTE {
            /* absolute handler, abbreviated record: expand the record's code */
            return rtd::prefix(rec_id)
                .is_some_and(|prefix| prefix.as_bytes().starts_with(&entry.name));
        }

        if entry.uri_id != rtd::URI_ID_ABSOLUTE && rec_id == rtd::URI_ID_ABSOLUTE {
            /* abbreviated handler, absolute record: expand the handler's code */
            return rtd::prefix(entry.uri_id).is_some_and(|prefix| {
                parts.payload.len() > prefix.len()
                    && parts.payload[1..].starts_with(prefix.as_bytes())
            });
        }

        false
    }

    /// Dispatch an incoming NDEF message to the registered handlers.
    /// Each record is delivered to every matching handler in slot order;
    /// whole-message handlers see the complete message exactly once. The
    /// default handler receives records nobody claimed.
    pub fn dispatch(&mut self, message: &[u8]) {
        if message.is_empty() {
            if let Some(entry) = self.entries[DEFAULT_IDX].as_mut() {
                debug!("notifying default handler of zero-length NDEF message");
                (entry.handler)(Handle(DEFAULT_IDX), message);
            }
            return;
        }

        if let Err(e) = msg::validate(message, true) {
            warn!("dropping invalid NDEF message: {e}");
            return;
        }

        for entry in self.entries.iter_mut().flatten() {
            entry.notified = false;
        }

        let mut entire_message_handled = false;
        for (rec_index, rec) in msg::records(message).enumerate() {
            let Some(parts) = RecordParts::parse(rec) else { continue };

            let mut matches: Vec<usize> = (DEFAULT_IDX + 1..MAX_HANDLERS)
                .filter(|&idx| {
                    self.entries[idx].as_ref().is_some_and(|e| Self::entry_matches(e, &parts))
                })
                .collect();
            if matches.is_empty() && self.entries[DEFAULT_IDX].is_some() {
                debug!("no handler found, using default handler");
                matches.push(DEFAULT_IDX);
            }

            let mut record_handled = false;
            for idx in matches {
                let Some(entry) = self.entries[idx].as_mut() else { continue };
                if entry.whole_message {
                    if entry.notified {
                        continue;
                    }
                    entry.notified = true;
                    entire_message_handled = true;
                    (entry.handler)(Handle(idx), message);
                } else {
                    (entry.handler)(Handle(idx), rec);
                }
                record_handled = true;
            }

            if !record_handled && !entire_message_handled {
                warn!("unhandled NDEF record (#{rec_index})");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn collector() -> (Handler, mpsc::Receiver<(Handle, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        let handler: Handler = Box::new(move |handle, data| {
            tx.send((handle, data.to_vec())).unwrap();
        });
        (handler, rx)
    }

    fn two_record_message() -> Vec<u8> {
        let mut buf = Vec::new();
        msg::add_record(&mut buf, 256, Tnf::WellKnown, b"T", &[], b"\x02enHi").unwrap();
        msg::add_record(&mut buf, 256, Tnf::Media, b"text/plain", &[], b"x").unwrap();
        buf
    }

    #[test]
    fn dispatches_matching_record() {
        let mut reg = TypeRegistry::new();
        let (handler, rx) = collector();
        reg.register(Tnf::WellKnown, b"T", false, handler).unwrap();

        let message = two_record_message();
        reg.dispatch(&message);

        let (_, data) = rx.try_recv().unwrap();
        assert_eq!(data, msg::record_by_index(&message, 0).unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn whole_message_handler_notified_once() {
        let mut reg = TypeRegistry::new();
        let (handler, rx) = collector();
        reg.register(Tnf::WellKnown, b"T", true, handler).unwrap();

        let mut message = Vec::new();
        msg::add_record(&mut message, 256, Tnf::WellKnown, b"T", &[], b"a").unwrap();
        msg::add_record(&mut message, 256, Tnf::WellKnown, b"T", &[], b"b").unwrap();
        reg.dispatch(&message);

        let (_, data) = rx.try_recv().unwrap();
        assert_eq!(data, message);
        assert!(rx.try_recv().is_err(), "second matching record must not re-notify");
    }

    #[test]
    fn default_handler_gets_unmatched_records() {
        let mut reg = TypeRegistry::new();
        let (handler, rx) = collector();
        reg.register_default(handler);

        let message = two_record_message();
        reg.dispatch(&message);
        assert_eq!(rx.try_recv().unwrap().1, msg::record_by_index(&message, 0).unwrap());
        assert_eq!(rx.try_recv().unwrap().1, msg::record_by_index(&message, 1).unwrap());
    }

    #[test]
    fn default_handler_gets_zero_length_message() {
        let mut reg = TypeRegistry::new();
        let (handler, rx) = collector();
        reg.register_default(handler);
        reg.dispatch(&[]);
        assert!(rx.try_recv().unwrap().1.is_empty());
    }

    #[test]
    fn abbreviated_handler_matches_absolute_record() {
        let mut reg = TypeRegistry::new();
        let (handler, rx) = collector();
        /* 0x04 = "https://" */
        reg.register_wkt_uri(0x04, &[], false, handler).unwrap();

        let mut message = Vec::new();
        msg::add_record(&mut message, 256, Tnf::WellKnown, b"U", &[], b"\x00https://x.org")
            .unwrap();
        reg.dispatch(&message);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn absolute_handler_matches_abbreviated_record() {
        let mut reg = TypeRegistry::new();
        let (handler, rx) = collector();
        reg.register_wkt_uri(rtd::URI_ID_ABSOLUTE, b"https://", false, handler).unwrap();

        let mut message = Vec::new();
        msg::add_record(&mut message, 256, Tnf::WellKnown, b"U", &[], b"\x04x.org").unwrap();
        reg.dispatch(&message);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn prefix_handler_matches_same_code() {
        let mut reg = TypeRegistry::new();
        let (handler, rx) = collector();
        reg.register_wkt_uri(0x05, &[], false, handler).unwrap(); /* tel: */

        let mut message = Vec::new();
        msg::add_record(&mut message, 256, Tnf::WellKnown, b"U", &[], b"\x05123").unwrap();
        reg.dispatch(&message);
        assert!(rx.try_recv().is_ok());

        let mut other = Vec::new();
        msg::add_record(&mut other, 256, Tnf::WellKnown, b"U", &[], b"\x06a@b").unwrap();
        reg.dispatch(&other);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn registry_fills_up() {
        let mut reg = TypeRegistry::new();
        for _ in 0..MAX_HANDLERS - 1 {
            reg.register(Tnf::WellKnown, b"T", false, Box::new(|_, _| {})).unwrap();
        }
        assert_eq!(
            reg.register(Tnf::WellKnown, b"T", false, Box::new(|_, _| {})).unwrap_err(),
            RegistryFull
        );
    }

    #[test]
    fn deregister_frees_slot() {
        let mut reg = TypeRegistry::new();
        let (handler, rx) = collector();
        let handle = reg.register(Tnf::WellKnown, b"T", false, handler).unwrap();
        reg.deregister(handle);
        reg.dispatch(&two_record_message());
        assert!(rx.try_recv().is_err());
    }
}
