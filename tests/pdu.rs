use dicom_dul::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
    AssociationRQ, CommonExtendedNegotiation, PDataValue, PDataValueType, Pdu,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    RoleSelection, UserIdentity, UserIdentityType, UserVariableItem, DEFAULT_MAX_PDU,
};
use matches::matches;
use std::io::Cursor;

fn round_trip(pdu: Pdu) -> Pdu {
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdu).expect("encoding should succeed");
    read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .expect("decoding should succeed")
        .expect("a whole PDU was available")
}

#[test]
fn can_read_write_associate_rq() {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-FOR-TESTS".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.1".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUID("2.25.137".to_string()),
            UserVariableItem::ImplementationVersionName("TEST-0.1".to_string()),
            UserVariableItem::AsynchronousOperationsWindow(2, 1),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                scu_role: true,
                scp_role: true,
            }),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.1.7".to_string(),
                vec![1, 1, 0, 1, 1, 0, 1],
            ),
            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(
                CommonExtendedNegotiation {
                    sop_class_uid: "1.2.840.10008.5.1.4.1.1.88.22".to_string(),
                    service_class_uid: "1.2.840.10008.4.2".to_string(),
                    related_general_sop_classes: vec![
                        "1.2.840.10008.5.1.4.1.1.88.11".to_string(),
                        "1.2.840.10008.5.1.4.1.1.88.33".to_string(),
                    ],
                },
            ),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                UserIdentityType::UsernamePassword,
                b"MyUsername".to_vec(),
                b"MyPassword".to_vec(),
            )),
        ],
    };

    let result = round_trip(association_rq.clone().into());

    assert_eq!(result, Pdu::AssociationRQ(association_rq));
}

#[test]
fn can_read_write_jwt_user_identity() {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![UserVariableItem::UserIdentityItem(UserIdentity::new(
            false,
            UserIdentityType::Jwt,
            b"eyJhbGciOiJIUzI1NiJ9.e30.signature".to_vec(),
            vec![],
        ))],
    };

    let result = round_trip(association_rq.into());

    if let Pdu::AssociationRQ(AssociationRQ { user_variables, .. }) = result {
        assert!(matches!(&user_variables[0],
            UserVariableItem::UserIdentityItem(user_identity)
            if user_identity.identity_type() == UserIdentityType::Jwt &&
            !user_identity.positive_response_requested() &&
            user_identity.secondary_field().is_empty()
        ));
    } else {
        panic!("invalid pdu type");
    }
}

#[test]
fn can_read_write_associate_ac() {
    let association_ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: "SCU-FOR-TESTS".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(8192),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.1.1".to_string(),
                scu_role: true,
                scp_role: false,
            }),
        ],
    };

    let result = round_trip(association_ac.clone().into());

    assert_eq!(result, Pdu::AssociationAC(association_ac));
}

#[test]
fn can_read_write_associate_rj() {
    let association_rj = AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CallingAETitleNotRecognized,
        ),
    };

    let result = round_trip(association_rj.clone().into());

    assert_eq!(result, Pdu::AssociationRJ(association_rj));
}

#[test]
fn can_read_write_pdata() {
    let pdata = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0, 1, 2, 3],
            },
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![9; 32],
            },
        ],
    };

    assert_eq!(round_trip(pdata.clone()), pdata);
}

#[test]
fn can_read_write_release_and_abort() {
    assert_eq!(round_trip(Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(round_trip(Pdu::ReleaseRP), Pdu::ReleaseRP);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    };
    assert_eq!(round_trip(abort.clone()), abort);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(round_trip(abort.clone()), abort);
}

/// unknown user information sub-items survive a round trip untouched
#[test]
fn unknown_user_sub_items_are_preserved() {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::Unknown(0x77, vec![1, 2, 3, 4, 5]),
        ],
    };

    let result = round_trip(association_rq.clone().into());
    assert_eq!(result, Pdu::AssociationRQ(association_rq));
}

/// a PDU of an unrecognized type is preserved as raw bytes
#[test]
fn unknown_pdu_type_is_captured() {
    let bytes = vec![
        // type 0x42, reserved, length 3
        0x42, 0x00, 0x00, 0x00, 0x00, 0x03, //
        0xAA, 0xBB, 0xCC,
    ];
    let pdu = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .unwrap()
        .unwrap();
    assert_eq!(
        pdu,
        Pdu::Unknown {
            pdu_type: 0x42,
            data: vec![0xAA, 0xBB, 0xCC],
        }
    );
}

/// a PDU whose declared length exceeds the available bytes
/// must not decode successfully
#[test]
fn truncated_pdu_is_an_error() {
    let mut bytes = vec![0u8; 0];
    write_pdu(
        &mut bytes,
        &Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0; 64],
            }],
        },
    )
    .unwrap();

    // truncate the body: the declared length now exceeds the bytes
    bytes.truncate(bytes.len() - 10);
    let result = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true);
    assert!(result.is_err());
}

/// an invalid reject reason must not decode successfully
#[test]
fn invalid_reject_reason_is_an_error() {
    let bytes = vec![
        // type 0x03, reserved, length 4
        0x03, 0x00, 0x00, 0x00, 0x00, 0x04, //
        // reserved, result 9 (invalid), source 1, reason 1
        0x00, 0x09, 0x01, 0x01,
    ];
    assert!(read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).is_err());
}

/// a clean end of stream before a new PDU yields no PDU at all
#[test]
fn end_of_stream_yields_none() {
    let bytes: Vec<u8> = vec![];
    let outcome = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).unwrap();
    assert!(outcome.is_none());
}

/// PDUs above the advertised maximum are refused in strict mode
/// and tolerated otherwise
#[test]
fn oversized_pdu_strictness() {
    let pdata = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 5000],
        }],
    };
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdata).unwrap();

    assert!(read_pdu(&mut Cursor::new(&bytes), 4096, true).is_err());
    let tolerated = read_pdu(&mut Cursor::new(&bytes), 4096, false)
        .unwrap()
        .unwrap();
    assert_eq!(tolerated, pdata);
}
