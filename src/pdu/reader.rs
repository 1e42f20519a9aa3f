//! PDU reader module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU item"))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32 },

    #[snafu(display("Could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },
    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },
    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },
    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid abort service provider"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },
    #[snafu(display("invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },
    #[snafu(display("unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },
    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },
    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },
    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },
    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read a PDU from the given source.
///
/// `max_pdu_length` is this node's maximum receive size.
/// In `strict` mode, a PDU declaring a larger length is an error;
/// otherwise it is tolerated up to [`MAXIMUM_PDU_SIZE`] with a warning.
///
/// Returns `Ok(None)` when the source was cleanly closed
/// before the start of a new PDU.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // An EOF on the first two bytes means that no PDU was pending;
    // an EOF anywhere later means the PDU was truncated.
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
    }

    let bytes = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    let mut cursor = Cursor::new(bytes);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 | 0x02 => {
            // A-ASSOCIATE-RQ and A-ASSOCIATE-AC share their frame:
            // protocol version, 2 reserved bytes, called and calling AE
            // titles (16 bytes each), 32 reserved bytes, variable items.
            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts_rq = vec![];
            let mut presentation_contexts_ac = vec![];
            let mut user_variables = vec![];

            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            let called_ae_title = read_ae_title(&mut cursor, &codec, "Called-AE-title")?;
            let calling_ae_title = read_ae_title(&mut cursor, &codec, "Calling-AE-title")?;

            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) if pdu_type == 0x01 => {
                        presentation_contexts_rq.push(val);
                    }
                    PduVariableItem::PresentationContextResult(val) if pdu_type == 0x02 => {
                        presentation_contexts_ac.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            let application_context_name =
                application_context_name.context(MissingApplicationContextNameSnafu)?;

            if pdu_type == 0x01 {
                Ok(Some(Pdu::AssociationRQ(AssociationRQ {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: presentation_contexts_rq,
                    user_variables,
                })))
            } else {
                Ok(Some(Pdu::AssociationAC(AssociationAC {
                    protocol_version,
                    calling_ae_title,
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: presentation_contexts_ac,
                    user_variables,
                })))
            }
        }
        0x03 => {
            // A-ASSOCIATE-RJ: 1 reserved byte, result, source, reason
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            let result = AssociationRJResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            let source = AssociationRJSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Some(Pdu::AssociationRJ(AssociationRJ { result, source })))
        }
        0x04 => {
            // P-DATA-TF: one or more presentation data value items
            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                // item length, presentation context ID, message control header
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-Length",
                })?;

                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // bit 0: command (1) or data set (0);
                // bit 1: last fragment of the respective message half
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                })
            }

            Ok(Some(Pdu::PData { data: values }))
        }
        0x05 => {
            // A-RELEASE-RQ: 4 reserved bytes
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Some(Pdu::ReleaseRQ))
        }
        0x06 => {
            // A-RELEASE-RP: 4 reserved bytes
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Some(Pdu::ReleaseRP))
        }
        0x07 => {
            // A-ABORT: 2 reserved bytes, source, reason
            let mut buf = [0u8; 2];
            cursor
                .read_exact(&mut buf)
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Some(Pdu::AbortRQ { source }))
        }
        _ => {
            let data = cursor.into_inner();
            Ok(Some(Pdu::Unknown { pdu_type, data }))
        }
    }
}

/// Read exactly `bytes_to_read` bytes,
/// failing with `UnexpectedEof` when the source runs short.
fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::with_capacity(bytes_to_read.min(MAXIMUM_PDU_SIZE as usize));
    reader
        .take(bytes_to_read as u64)
        .read_to_end(&mut result)?;
    if result.len() != bytes_to_read {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "declared length exceeds available bytes",
        ));
    }
    Ok(result)
}

fn read_ae_title<R>(
    reader: &mut R,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String>
where
    R: Read,
{
    // 16 characters, ISO 646 basic G0 set,
    // leading and trailing spaces non-significant
    let mut ae_bytes = [0; 16];
    reader
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

fn read_uid_field<R>(
    reader: &mut R,
    codec: &dyn TextCodec,
    length: usize,
    field: &'static str,
) -> Result<String>
where
    R: Read,
{
    Ok(codec
        .decode(&read_n(reader, length).context(ReadPduFieldSnafu { field })?)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    reader
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;

    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            // Application Context item: the full payload is the name
            let val = codec
                .decode(&cursor.into_inner())
                .context(DecodeTextSnafu {
                    field: "Application-context-name",
                })?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context item (proposed):
            // context ID, 3 reserved bytes,
            // one abstract syntax sub-item (0x30)
            // and one or more transfer syntax sub-items (0x40)
            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            cursor
                .seek(SeekFrom::Current(3))
                .context(ReadReservedSnafu { bytes: 3_u32 })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x30 => {
                        abstract_syntax = Some(read_uid_field(
                            &mut cursor,
                            codec,
                            item_length as usize,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_uid_field(
                            &mut cursor,
                            codec,
                            item_length as usize,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context item (result):
            // context ID, 1 reserved byte, result/reason, 1 reserved byte,
            // exactly one transfer syntax sub-item (0x40)
            let mut transfer_syntax: Option<String> = None;

            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            let reason = PresentationContextResultReason::from(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;

            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x40 => {
                        if transfer_syntax.is_some() {
                            // only one transfer syntax may be selected
                            return MultipleTransferSyntaxesAcceptedSnafu.fail();
                        }
                        transfer_syntax = Some(read_uid_field(
                            &mut cursor,
                            codec,
                            item_length as usize,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax: transfer_syntax.context(MissingTransferSyntaxSnafu)?,
                },
            ))
        }
        0x50 => {
            // User Information item: a sequence of sub-items 0x51-0x58.
            // Each sub-item is parsed within its declared length,
            // so that a bad nested length cannot leak into its neighbors.
            // Unrecognized sub-items are preserved as raw bytes.
            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                let sub_item = read_n(&mut cursor, item_length as usize)
                    .context(ReadPduItemSnafu)?;
                let mut cursor = Cursor::new(sub_item);

                match item_type {
                    0x51 => {
                        user_variables.push(UserVariableItem::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        let implementation_class_uid = read_uid_field(
                            &mut cursor,
                            codec,
                            item_length as usize,
                            "Implementation-class-uid",
                        )?;
                        user_variables.push(UserVariableItem::ImplementationClassUID(
                            implementation_class_uid,
                        ));
                    }
                    0x53 => {
                        let invoked =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        let performed =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;
                        user_variables.push(UserVariableItem::AsynchronousOperationsWindow(
                            invoked, performed,
                        ));
                    }
                    0x54 => {
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        let sop_class_uid = read_uid_field(
                            &mut cursor,
                            codec,
                            uid_length as usize,
                            "SOP-class-uid",
                        )?;
                        let scu_role = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "SCU-role",
                        })?;
                        let scp_role = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "SCP-role",
                        })?;
                        user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                            sop_class_uid,
                            scu_role: scu_role == 1,
                            scp_role: scp_role == 1,
                        }));
                    }
                    0x55 => {
                        let implementation_version_name = read_uid_field(
                            &mut cursor,
                            codec,
                            item_length as usize,
                            "Implementation-version-name",
                        )?;
                        user_variables.push(UserVariableItem::ImplementationVersionName(
                            implementation_version_name,
                        ));
                    }
                    0x56 => {
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        let sop_class_uid = read_uid_field(
                            &mut cursor,
                            codec,
                            sop_class_uid_length as usize,
                            "SOP-class-uid",
                        )?;

                        let data_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Service-class-application-information-length",
                            })?;
                        let data = read_n(&mut cursor, data_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Service-class-application-information",
                            },
                        )?;

                        user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                            sop_class_uid,
                            data,
                        ));
                    }
                    0x57 => {
                        // sub-item version 0 layout
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        let sop_class_uid = read_uid_field(
                            &mut cursor,
                            codec,
                            sop_class_uid_length as usize,
                            "SOP-class-uid",
                        )?;

                        let service_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Service-class-uid-length",
                            })?;
                        let service_class_uid = read_uid_field(
                            &mut cursor,
                            codec,
                            service_class_uid_length as usize,
                            "Service-class-uid",
                        )?;

                        let related_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Related-general-sop-class-identification-length",
                            })?;
                        let related_bytes = read_n(&mut cursor, related_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Related-general-sop-class-identification",
                            },
                        )?;

                        let mut related_general_sop_classes = vec![];
                        let mut related_cursor = Cursor::new(related_bytes);
                        while related_cursor.position()
                            < related_cursor.get_ref().len() as u64
                        {
                            let uid_length = related_cursor.read_u16::<BigEndian>().context(
                                ReadPduFieldSnafu {
                                    field: "Related-general-sop-class-uid-length",
                                },
                            )?;
                            related_general_sop_classes.push(read_uid_field(
                                &mut related_cursor,
                                codec,
                                uid_length as usize,
                                "Related-general-sop-class-uid",
                            )?);
                        }

                        user_variables.push(
                            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                                CommonExtendedNegotiation {
                                    sop_class_uid,
                                    service_class_uid,
                                    related_general_sop_classes,
                                },
                            ),
                        );
                    }
                    0x58 => {
                        let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "User-Identity-type",
                        })?;

                        let positive_response_requested =
                            cursor.read_u8().context(ReadPduFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;

                        let primary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;
                        let primary_field = read_n(&mut cursor, primary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field",
                            })?;

                        // only non-zero for username-passcode identification
                        let secondary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;
                        let secondary_field = read_n(&mut cursor, secondary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field",
                            })?;

                        match UserIdentityType::from(user_identity_type) {
                            Some(user_identity_type) => {
                                user_variables.push(UserVariableItem::UserIdentityItem(
                                    UserIdentity::new(
                                        positive_response_requested == 1,
                                        user_identity_type,
                                        primary_field,
                                        secondary_field,
                                    ),
                                ));
                            }
                            None => {
                                warn!("Unknown User Identity Type code {}", user_identity_type);
                            }
                        }
                    }
                    _ => {
                        user_variables.push(UserVariableItem::Unknown(
                            item_type,
                            read_n(&mut cursor, item_length as usize)
                                .context(ReadPduFieldSnafu { field: "Unknown" })?,
                        ));
                    }
                }
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}
