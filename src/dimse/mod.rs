//! DIMSE message framing.
//!
//! A DIMSE message is a command set plus an optional data set,
//! both carried as presentation data values (PDVs) inside P-DATA-TF PDUs.
//! This module splits outgoing messages into PDV fragments
//! within the peer's maximum PDU length,
//! and reassembles incoming fragments back into whole messages.

pub mod commands;

use snafu::{ensure, Backtrace, Snafu};

use crate::pdu::{PDataValue, PDataValueType, DEFAULT_MAX_PDU, PDU_HEADER_SIZE};

/// The fixed per-PDV overhead within a P-DATA-TF PDU:
/// the PDU header (6 bytes), the PDV item length (4 bytes),
/// the presentation context identifier (1 byte)
/// and the message control header (1 byte).
const PDV_OVERHEAD: u32 = PDU_HEADER_SIZE + 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "peer maximum PDU length {} leaves no room for a fragment",
        max_pdu_length
    ))]
    FragmentRoom {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "message fragments mix presentation contexts {} and {}",
        expected,
        got
    ))]
    MixedPresentationContexts {
        expected: u8,
        got: u8,
        backtrace: Backtrace,
    },

    /// received a data set fragment before the command set was complete
    DataBeforeCommand { backtrace: Backtrace },

    /// received a command fragment after the command set was complete
    CommandAfterLastFragment { backtrace: Backtrace },

    #[snafu(display("could not decode command set"))]
    ReadCommandSet {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A whole DIMSE message:
/// the command set bytes and the data set bytes, if any.
///
/// The command set is always encoded in Implicit VR Little Endian;
/// the data set is encoded in the transfer syntax
/// negotiated for the presentation context
/// and is treated as opaque here.
#[derive(Debug, Clone, PartialEq)]
pub struct DimseMessage {
    /// the identifier of the presentation context of this message
    pub presentation_context_id: u8,
    /// the command set bytes
    pub command: Vec<u8>,
    /// the data set bytes, if the command indicates that one follows
    pub dataset: Option<Vec<u8>>,
}

/// Split a DIMSE message into P-DATA-TF PDU payloads,
/// each no larger than the peer's maximum PDU length.
///
/// A `max_pdu_length` of zero means that the peer declared no maximum,
/// in which case a safe default ([`DEFAULT_MAX_PDU`]) is applied.
/// Command fragments always precede data set fragments,
/// and each message half ends with a PDV with its last-fragment bit set.
pub fn fragment_message(
    presentation_context_id: u8,
    command: &[u8],
    dataset: Option<&[u8]>,
    max_pdu_length: u32,
) -> Result<Vec<Vec<PDataValue>>> {
    let max_pdu_length = if max_pdu_length == 0 {
        DEFAULT_MAX_PDU
    } else {
        max_pdu_length
    };
    ensure!(
        max_pdu_length > PDV_OVERHEAD,
        FragmentRoomSnafu { max_pdu_length }
    );
    let max_fragment = (max_pdu_length - PDV_OVERHEAD) as usize;
    // PDVs packed into one PDU may not exceed the PDU's payload room
    let pdu_room = (max_pdu_length - PDU_HEADER_SIZE) as usize;

    let mut pdvs = Vec::new();
    push_fragments(
        &mut pdvs,
        presentation_context_id,
        PDataValueType::Command,
        command,
        max_fragment,
    );
    if let Some(dataset) = dataset {
        push_fragments(
            &mut pdvs,
            presentation_context_id,
            PDataValueType::Data,
            dataset,
            max_fragment,
        );
    }

    // pack fragments into PDUs, greedily
    let mut pdus: Vec<Vec<PDataValue>> = Vec::new();
    let mut current: Vec<PDataValue> = Vec::new();
    let mut current_len = 0;
    for pdv in pdvs {
        let item_len = pdv.data.len() + 6;
        if !current.is_empty() && current_len + item_len > pdu_room {
            pdus.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += item_len;
        current.push(pdv);
    }
    if !current.is_empty() {
        pdus.push(current);
    }

    Ok(pdus)
}

fn push_fragments(
    pdvs: &mut Vec<PDataValue>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    data: &[u8],
    max_fragment: usize,
) {
    if data.is_empty() {
        // an empty half still needs its last-fragment marker
        pdvs.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data: Vec::new(),
        });
        return;
    }

    let mut chunks = data.chunks(max_fragment).peekable();
    while let Some(chunk) = chunks.next() {
        pdvs.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: chunks.peek().is_none(),
            data: chunk.to_vec(),
        });
    }
}

/// Reassembles one DIMSE message at a time from incoming PDV fragments.
///
/// Fragments are accepted through [`offer`][MessageAssembler::offer]
/// in arrival order. Once the command set half is complete,
/// its CommandDataSetType field decides whether a data set half follows;
/// the assembled message is returned as soon as all halves are in.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    presentation_context_id: Option<u8>,
    command: Vec<u8>,
    command_complete: bool,
    dataset: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        MessageAssembler::default()
    }

    /// Whether a partially assembled message is pending.
    pub fn in_progress(&self) -> bool {
        self.presentation_context_id.is_some()
    }

    /// Discard any partially assembled message.
    pub fn reset(&mut self) {
        *self = MessageAssembler::default();
    }

    /// Feed one PDV into the assembler.
    ///
    /// Returns the reassembled message once it is complete.
    /// An error means the peer broke the message framing rules;
    /// the caller is expected to abort the association.
    pub fn offer(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        match self.presentation_context_id {
            None => self.presentation_context_id = Some(pdv.presentation_context_id),
            Some(expected) => {
                ensure!(
                    expected == pdv.presentation_context_id,
                    MixedPresentationContextsSnafu {
                        expected,
                        got: pdv.presentation_context_id,
                    }
                );
            }
        }

        match pdv.value_type {
            PDataValueType::Command => {
                ensure!(!self.command_complete, CommandAfterLastFragmentSnafu);
                self.command.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    self.command_complete = true;
                    let command_set = commands::read_command_set(&self.command)?;
                    if !commands::has_data_set(&command_set) {
                        return Ok(Some(self.take_message(false)));
                    }
                }
                Ok(None)
            }
            PDataValueType::Data => {
                ensure!(self.command_complete, DataBeforeCommandSnafu);
                self.dataset.extend_from_slice(&pdv.data);
                if pdv.is_last {
                    return Ok(Some(self.take_message(true)));
                }
                Ok(None)
            }
        }
    }

    fn take_message(&mut self, with_dataset: bool) -> DimseMessage {
        let message = DimseMessage {
            presentation_context_id: self.presentation_context_id.unwrap_or_default(),
            command: std::mem::take(&mut self.command),
            dataset: if with_dataset {
                Some(std::mem::take(&mut self.dataset))
            } else {
                None
            },
        };
        self.reset();
        message
    }
}

#[cfg(test)]
mod tests {
    use super::commands::{CEchoRq, Command};
    use super::*;

    fn reassemble(pdus: Vec<Vec<PDataValue>>) -> DimseMessage {
        let mut assembler = MessageAssembler::new();
        let mut message = None;
        for pdu in pdus {
            for pdv in pdu {
                if let Some(complete) = assembler.offer(pdv).unwrap() {
                    assert!(message.is_none(), "more than one message reassembled");
                    message = Some(complete);
                }
            }
        }
        message.expect("message was not completed")
    }

    /// build a decodable command set of a few hundred bytes
    /// by attaching a long comment attribute
    fn large_command_set() -> Vec<u8> {
        use dicom_core::{dicom_value, DataElement, Tag, VR};
        use dicom_dictionary_std::tags;
        use dicom_object::InMemDicomObject;

        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ));
        obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ));
        // (0000,0902) ErrorComment, used here as a long filler attribute
        obj.put(DataElement::new(
            Tag(0x0000, 0x0902),
            VR::LO,
            dicom_value!(Str, "x".repeat(360)),
        ));

        let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut data = Vec::new();
        obj.write_dataset_with_ts(&mut data, &ts).unwrap();
        data
    }

    /// a message larger than the maximum PDU length is split into
    /// several PDUs with correct control headers,
    /// and reassembles to the original bytes
    #[test]
    fn fragment_and_reassemble_large_message() {
        let command = large_command_set();
        assert!(command.len() >= 300);
        let dataset: Vec<u8> = (0..900u16).map(|x| x as u8).collect();

        let pdus = fragment_message(1, &command, Some(&dataset), 128).unwrap();
        assert!(pdus.len() >= 4, "expected >= 4 PDUs, got {}", pdus.len());

        for pdu in &pdus {
            let total: usize = pdu.iter().map(|pdv| pdv.data.len() + 6).sum();
            assert!(total + 6 <= 128);
            for pdv in pdu {
                assert_eq!(pdv.presentation_context_id, 1);
                // no fragment may exceed the PDV payload room
                assert!(pdv.data.len() <= 128 - 12);
            }
        }

        // command fragments all come before data set fragments
        let flat: Vec<_> = pdus.iter().flatten().collect();
        let first_data = flat
            .iter()
            .position(|pdv| pdv.value_type == PDataValueType::Data)
            .unwrap();
        assert!(flat[..first_data]
            .iter()
            .all(|pdv| pdv.value_type == PDataValueType::Command));
        assert!(flat[first_data..]
            .iter()
            .all(|pdv| pdv.value_type == PDataValueType::Data));

        // each half ends with exactly one last-fragment marker
        let last_flags: Vec<_> = flat.iter().filter(|pdv| pdv.is_last).collect();
        assert_eq!(last_flags.len(), 2);

        let message = reassemble(pdus);
        assert_eq!(message.presentation_context_id, 1);
        assert_eq!(message.command, command);
        assert_eq!(message.dataset.as_deref(), Some(&dataset[..]));
    }

    /// a command-only message completes without any data set fragment
    #[test]
    fn command_only_message_completes_immediately() {
        let command = CEchoRq { message_id: 5 }.encode(false).unwrap();
        let pdus = fragment_message(3, &command, None, DEFAULT_MAX_PDU).unwrap();
        assert_eq!(pdus.len(), 1);
        assert_eq!(pdus[0].len(), 1);
        assert!(pdus[0][0].is_last);
        assert_eq!(pdus[0][0].value_type, PDataValueType::Command);

        let message = reassemble(pdus);
        assert_eq!(message.presentation_context_id, 3);
        assert_eq!(message.dataset, None);
    }

    /// an unlimited peer maximum falls back to the default PDU size
    #[test]
    fn zero_max_pdu_length_uses_default() {
        let data = vec![0u8; DEFAULT_MAX_PDU as usize];
        let command = CEchoRq { message_id: 1 }.encode(true).unwrap();
        let pdus = fragment_message(1, &command, Some(&data), 0).unwrap();
        assert!(pdus.len() > 1);
        for pdu in &pdus {
            let total: usize = pdu.iter().map(|pdv| pdv.data.len() + 6).sum();
            assert!(total + 6 <= DEFAULT_MAX_PDU as usize);
        }
    }

    /// a data set fragment before the command half is a framing violation
    #[test]
    fn data_before_command_is_rejected() {
        let mut assembler = MessageAssembler::new();
        let result = assembler.offer(PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 4],
        });
        assert!(matches!(result, Err(Error::DataBeforeCommand { .. })));
    }

    /// fragments of one message must share a presentation context
    #[test]
    fn mixed_contexts_are_rejected() {
        let command = CEchoRq { message_id: 1 }.encode(true).unwrap();
        let mut assembler = MessageAssembler::new();
        assembler
            .offer(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: false,
                data: command,
            })
            .unwrap();
        let result = assembler.offer(PDataValue {
            presentation_context_id: 3,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![],
        });
        assert!(matches!(
            result,
            Err(Error::MixedPresentationContexts {
                expected: 1,
                got: 3,
                ..
            })
        ));
    }
}
