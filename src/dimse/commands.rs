//! Construction and interpretation of DIMSE command sets.
//!
//! Command sets are small DICOM data sets
//! always encoded in Implicit VR Little Endian,
//! regardless of the transfer syntax negotiated for the context.
//! The [`Command`] trait builds the element set of a command message
//! and encodes it with the group length and data set type fields filled in;
//! the free functions at the end interpret received command sets.

use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, WriteError};
use dicom_transfer_syntax_registry::entries;

use super::{ReadCommandSetSnafu, Result};
use snafu::ResultExt;

/// The priority of a DIMSE operation request.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

/// The value of the CommandDataSetType field:
/// whether a data set follows the command set.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandDataSetType {
    Present = 0x0001,
    Absent = 0x0101,
}

/// The command field codes of the DIMSE services.
#[allow(non_camel_case_types)]
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandField {
    C_STORE_RQ = 0x0001,
    C_STORE_RSP = 0x8001,
    C_GET_RQ = 0x0010,
    C_GET_RSP = 0x8010,
    C_FIND_RQ = 0x0020,
    C_FIND_RSP = 0x8020,
    C_MOVE_RQ = 0x0021,
    C_MOVE_RSP = 0x8021,
    C_ECHO_RQ = 0x0030,
    C_ECHO_RSP = 0x8030,
    N_EVENT_REPORT_RQ = 0x0100,
    N_EVENT_REPORT_RSP = 0x8100,
    N_GET_RQ = 0x0110,
    N_GET_RSP = 0x8110,
    N_SET_RQ = 0x0120,
    N_SET_RSP = 0x8120,
    N_ACTION_RQ = 0x0130,
    N_ACTION_RSP = 0x8130,
    N_CREATE_RQ = 0x0140,
    N_CREATE_RSP = 0x8140,
    N_DELETE_RQ = 0x0150,
    N_DELETE_RSP = 0x8150,
    C_CANCEL_RQ = 0x0FFF,
}

/// A DIMSE command message that can be encoded into command set bytes.
pub trait Command {
    /// The command field code of this command.
    fn command_field(&self) -> u16;

    /// Build the element set of this command,
    /// without the command field, group length and data set type fields.
    fn command_set(&self) -> InMemDicomObject;

    /// Encode the full command set in Implicit VR Little Endian,
    /// indicating whether a data set accompanies the message.
    fn encode(&self, ds_included: bool) -> Result<Vec<u8>, Box<WriteError>> {
        let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();

        let mut obj = self.command_set();
        obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [self.command_field()]),
        ));
        obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            if ds_included {
                dicom_value!(U16, [CommandDataSetType::Present as u16])
            } else {
                dicom_value!(U16, [CommandDataSetType::Absent as u16])
            },
        ));

        // measure the group, then prepend the group length element
        let mut buffer = Vec::new();
        obj.write_dataset_with_ts(&mut buffer, &ts)
            .map_err(Box::from)?;
        obj.put(DataElement::new(
            tags::COMMAND_GROUP_LENGTH,
            VR::UL,
            PrimitiveValue::from(buffer.len() as u32),
        ));

        let mut buffer = Vec::new();
        obj.write_dataset_with_ts(&mut buffer, &ts)
            .map_err(Box::from)?;
        Ok(buffer)
    }
}

/// Pad a UID value to an even length, as required on the wire.
fn ui(uid: &str) -> String {
    if uid.len() % 2 == 0 {
        uid.to_string()
    } else {
        let mut padded = String::with_capacity(uid.len() + 1);
        padded.push_str(uid);
        padded.push('\0');
        padded
    }
}

/// A C-ECHO request.
#[derive(Debug, Clone, PartialEq)]
pub struct CEchoRq {
    pub message_id: u16,
}

impl Command for CEchoRq {
    fn command_field(&self) -> u16 {
        CommandField::C_ECHO_RQ as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, ui(crate::uids::VERIFICATION)),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
        ])
    }
}

/// A C-ECHO response.
#[derive(Debug, Clone, PartialEq)]
pub struct CEchoRsp {
    pub message_id_being_responded_to: u16,
    pub status: u16,
}

impl Command for CEchoRsp {
    fn command_field(&self) -> u16 {
        CommandField::C_ECHO_RSP as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, ui(crate::uids::VERIFICATION)),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [self.status])),
        ])
    }
}

/// A C-STORE request.
#[derive(Debug, Clone, PartialEq)]
pub struct CStoreRq<'a> {
    pub message_id: u16,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    pub priority: Priority,
    /// set when this store is a sub-operation of a C-MOVE
    pub move_originator_ae_title: Option<&'a str>,
    pub move_originator_message_id: Option<u16>,
}

impl Command for CStoreRq<'_> {
    fn command_field(&self) -> u16 {
        CommandField::C_STORE_RQ as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        let mut obj = InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, ui(self.affected_sop_class_uid)),
            ),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
            DataElement::new(
                tags::PRIORITY,
                VR::US,
                dicom_value!(U16, [self.priority as u16]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, ui(self.affected_sop_instance_uid)),
            ),
        ]);
        if let Some(ae_title) = self.move_originator_ae_title {
            obj.put(DataElement::new(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                VR::AE,
                dicom_value!(Str, ae_title),
            ));
        }
        if let Some(message_id) = self.move_originator_message_id {
            obj.put(DataElement::new(
                tags::MOVE_ORIGINATOR_MESSAGE_ID,
                VR::US,
                dicom_value!(U16, [message_id]),
            ));
        }
        obj
    }
}

/// A C-STORE response.
#[derive(Debug, Clone, PartialEq)]
pub struct CStoreRsp<'a> {
    pub message_id_being_responded_to: u16,
    pub affected_sop_class_uid: &'a str,
    pub affected_sop_instance_uid: &'a str,
    pub status: u16,
}

impl Command for CStoreRsp<'_> {
    fn command_field(&self) -> u16 {
        CommandField::C_STORE_RSP as u16
    }

    fn command_set(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter(vec![
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, ui(self.affected_sop_class_uid)),
            ),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [self.message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, ui(self.affected_sop_instance_uid)),
            ),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [self.status])),
        ])
    }
}

/// Decode a command set from its Implicit VR Little Endian bytes.
pub fn read_command_set(data: &[u8]) -> Result<InMemDicomObject> {
    let ts = entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    InMemDicomObject::read_dataset_with_ts(data, &ts).context(ReadCommandSetSnafu)
}

fn uint16_of(obj: &InMemDicomObject, tag: Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

/// The command field code of a received command set.
pub fn command_field(obj: &InMemDicomObject) -> Option<u16> {
    uint16_of(obj, tags::COMMAND_FIELD)
}

/// The message identifier of a received request.
pub fn message_id(obj: &InMemDicomObject) -> Option<u16> {
    uint16_of(obj, tags::MESSAGE_ID)
}

/// The message identifier a received response refers to.
pub fn message_id_being_responded_to(obj: &InMemDicomObject) -> Option<u16> {
    uint16_of(obj, tags::MESSAGE_ID_BEING_RESPONDED_TO)
}

/// The status code of a received response.
pub fn status(obj: &InMemDicomObject) -> Option<u16> {
    uint16_of(obj, tags::STATUS)
}

/// Whether the command set announces an accompanying data set.
///
/// A missing or unreadable CommandDataSetType field
/// is interpreted as "no data set".
pub fn has_data_set(obj: &InMemDicomObject) -> bool {
    uint16_of(obj, tags::COMMAND_DATA_SET_TYPE)
        .map(|value| value != CommandDataSetType::Absent as u16)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_command_round_trip() {
        let rq = CEchoRq { message_id: 7 };
        let bytes = rq.encode(false).unwrap();

        let obj = read_command_set(&bytes).unwrap();
        assert_eq!(command_field(&obj), Some(CommandField::C_ECHO_RQ as u16));
        assert_eq!(message_id(&obj), Some(7));
        assert!(!has_data_set(&obj));

        let rsp = CEchoRsp {
            message_id_being_responded_to: 7,
            status: 0x0000,
        };
        let bytes = rsp.encode(false).unwrap();
        let obj = read_command_set(&bytes).unwrap();
        assert_eq!(command_field(&obj), Some(CommandField::C_ECHO_RSP as u16));
        assert_eq!(message_id_being_responded_to(&obj), Some(7));
        assert_eq!(status(&obj), Some(0x0000));
    }

    #[test]
    fn store_command_announces_data_set() {
        let rq = CStoreRq {
            message_id: 42,
            affected_sop_class_uid: "1.2.840.10008.5.1.4.1.1.7",
            affected_sop_instance_uid: "2.25.4077",
            priority: Priority::Medium,
            move_originator_ae_title: None,
            move_originator_message_id: None,
        };
        let bytes = rq.encode(true).unwrap();
        let obj = read_command_set(&bytes).unwrap();
        assert_eq!(command_field(&obj), Some(CommandField::C_STORE_RQ as u16));
        assert_eq!(message_id(&obj), Some(42));
        assert!(has_data_set(&obj));
    }

    #[test]
    fn group_length_matches_group_payload() {
        let bytes = CEchoRq { message_id: 1 }.encode(false).unwrap();
        // element (0000,0000) comes first: tag, 4-byte length, UL value
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x00, 0x00]);
        let declared = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(declared as usize, bytes.len() - 12);
    }
}
