//! Protocol Data Unit (PDU) data structures and codec.
//!
//! This module provides typed representations of the seven PDUs of the
//! DICOM Upper Layer protocol together with a bit-exact [reader][read_pdu]
//! and [writer][write_pdu]. PDUs are passed around as part of the DICOM
//! network communication support; the [`crate::provider`] module classifies
//! them into state machine events.

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// A presentation context as proposed by the association requestor:
/// one abstract syntax with one or more candidate transfer syntaxes.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd number between 1 and 255
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome for a single presentation context,
/// as announced by the association acceptor.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier, matching the proposed context
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the selected transfer syntax
    /// (only significant when the reason is acceptance)
    pub transfer_syntax: String,
}

/// The reason field of a presentation context result.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    /// 0 - acceptance
    Acceptance = 0,
    /// 1 - user-rejection
    UserRejection = 1,
    /// 2 - no-reason (provider rejection)
    NoReason = 2,
    /// 3 - abstract-syntax-not-supported (provider rejection)
    AbstractSyntaxNotSupported = 3,
    /// 4 - transfer-syntaxes-not-supported (provider rejection)
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(reason: u8) -> Option<PresentationContextResultReason> {
        let result = match reason {
            0 => PresentationContextResultReason::Acceptance,
            1 => PresentationContextResultReason::UserRejection,
            2 => PresentationContextResultReason::NoReason,
            3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
            4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
            _ => {
                return None;
            }
        };

        Some(result)
    }
}

/// The result field of an association rejection.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    /// 1 - rejected-permanent
    Permanent,
    /// 2 - rejected-transient
    Transient,
}

impl AssociationRJResult {
    fn from(value: u8) -> Option<AssociationRJResult> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source (and source dependent reason) of an association rejection.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    /// 1 - DICOM UL service-user
    ServiceUser(AssociationRJServiceUserReason),
    /// 2 - DICOM UL service-provider (ACSE related function)
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    /// 3 - DICOM UL service-provider (presentation related function)
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from(source: u8, reason: u8) -> Option<AssociationRJSource> {
        let result = match (source, reason) {
            (1, 1) => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven)
            }
            (1, 2) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
            (1, 3) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ),
            (1, x) if x == 4 || x == 5 || x == 6 => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::Reserved(x))
            }
            (1, 7) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
            (1, x) if x == 8 || x == 9 || x == 10 => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::Reserved(x))
            }
            (1, _) => return None,
            (2, 1) => AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::NoReasonGiven,
            ),
            (2, 2) => AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            ),
            (2, _) => return None,
            (3, 0) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(0),
            ),
            (3, 1) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            ),
            (3, 2) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
            (3, x) if (3..=7).contains(&x) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            ),
            (3, _) => return None,
            _ => return None,
        };
        Some(result)
    }
}

/// A rejection reason attributed to the DICOM UL service-user.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    /// 1 - no-reason-given
    NoReasonGiven,
    /// 2 - application-context-name-not-supported
    ApplicationContextNameNotSupported,
    /// 3 - calling-AE-title-not-recognized
    CallingAETitleNotRecognized,
    /// 7 - called-AE-title-not-recognized
    CalledAETitleNotRecognized,
    /// 4-6, 8-10 - reserved
    Reserved(u8),
}

/// A rejection reason attributed to the service-provider's
/// ACSE related function.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderAcseReason {
    /// 1 - no-reason-given
    NoReasonGiven,
    /// 2 - protocol-version-not-supported
    ProtocolVersionNotSupported,
}

/// A rejection reason attributed to the service-provider's
/// presentation related function.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    /// 1 - temporary-congestion
    TemporaryCongestion,
    /// 2 - local-limit-exceeded
    LocalLimitExceeded,
    /// 0, 3-7 - reserved
    Reserved(u8),
}

/// A presentation data value: one fragment of a DIMSE message
/// inside a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    /// the identifier of the presentation context of this fragment
    pub presentation_context_id: u8,
    /// whether the fragment is part of a command set or a data set
    pub value_type: PDataValueType,
    /// whether this is the last fragment of the respective message half
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// Whether a presentation data value carries
/// command set or data set bytes.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    /// message command information
    Command,
    /// message data set information
    Data,
}

/// The source (and provider reason) of an A-ABORT.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    /// 0 - DICOM UL service-user initiated abort
    ServiceUser,
    /// 2 - DICOM UL service-provider initiated abort
    ServiceProvider(AbortRQServiceProviderReason),
    /// 1 - reserved
    Reserved,
}

impl AbortRQSource {
    fn from(source: u8, reason: u8) -> Option<AbortRQSource> {
        let result = match (source, reason) {
            (0, _) => AbortRQSource::ServiceUser,
            (1, _) => AbortRQSource::Reserved,
            (2, 0) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::ReasonNotSpecified)
            }
            (2, 1) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnrecognizedPdu)
            }
            (2, 2) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
            (2, 3) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::Reserved),
            (2, 4) => AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            ),
            (2, 5) => AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            ),
            (2, 6) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::InvalidPduParameter)
            }
            _ => return None,
        };
        Some(result)
    }
}

/// A provider initiated abort reason.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// 0 - reason-not-specified
    ReasonNotSpecified,
    /// 1 - unrecognized-PDU
    UnrecognizedPdu,
    /// 2 - unexpected-PDU
    UnexpectedPdu,
    /// 3 - reserved
    Reserved,
    /// 4 - unrecognized-PDU-parameter
    UnrecognizedPduParameter,
    /// 5 - unexpected-PDU-parameter
    UnexpectedPduParameter,
    /// 6 - invalid-PDU-parameter value
    InvalidPduParameter,
}

/// The form of identification carried in a user identity negotiation item.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserIdentityType {
    /// 1 - username as a UTF-8 string
    Username,
    /// 2 - username as a UTF-8 string and passcode
    UsernamePassword,
    /// 3 - Kerberos service ticket
    KerberosServiceTicket,
    /// 4 - SAML assertion
    SamlAssertion,
    /// 5 - JSON web token
    Jwt,
}

impl UserIdentityType {
    pub(crate) fn from(value: u8) -> Option<UserIdentityType> {
        match value {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernamePassword),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            5 => Some(UserIdentityType::Jwt),
            _ => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            UserIdentityType::Username => 1,
            UserIdentityType::UsernamePassword => 2,
            UserIdentityType::KerberosServiceTicket => 3,
            UserIdentityType::SamlAssertion => 4,
            UserIdentityType::Jwt => 5,
        }
    }
}

/// A user identity negotiation sub-item,
/// as sent by the association requestor.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    /// whether a positive server response is requested
    positive_response_requested: bool,
    /// the form of user identity being provided
    identity_type: UserIdentityType,
    /// the identity payload: username, ticket, assertion, or token
    primary_field: Vec<u8>,
    /// the passcode, only non-empty for username-passcode identification
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    /// Whether a positive server response has been requested.
    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    /// Retrieve the form of user identity.
    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    /// Retrieve the primary identity field.
    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    /// Retrieve the secondary identity field.
    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// An SCP/SCU role selection sub-item for one SOP class.
///
/// A `true` role means that the sender proposes (in an A-ASSOCIATE-RQ)
/// or accepts (in an A-ASSOCIATE-AC) performing that role
/// for the identified SOP class.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    /// the SOP class UID to which the role selection applies
    pub sop_class_uid: String,
    /// the SCU role
    pub scu_role: bool,
    /// the SCP role
    pub scp_role: bool,
}

/// A SOP class common extended negotiation sub-item (version 0),
/// only present in A-ASSOCIATE-RQ PDUs.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct CommonExtendedNegotiation {
    /// the SOP class UID
    pub sop_class_uid: String,
    /// the service class UID
    pub service_class_uid: String,
    /// the related general SOP class UIDs
    pub related_general_sop_classes: Vec<String>,
}

/// A variable item at the top level of an A-ASSOCIATE PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// an unrecognized sub-item, kept as raw bytes
    Unknown(u8, Vec<u8>),
    /// 0x51 - the maximum PDU length the sender is willing to receive
    /// (0 means no maximum is specified)
    MaxLength(u32),
    /// 0x52 - the implementation class UID of the sender
    ImplementationClassUID(String),
    /// 0x53 - the asynchronous operations window
    /// (maximum number invoked, maximum number performed)
    AsynchronousOperationsWindow(u16, u16),
    /// 0x54 - an SCP/SCU role selection for one SOP class
    RoleSelection(RoleSelection),
    /// 0x55 - the implementation version name of the sender
    ImplementationVersionName(String),
    /// 0x56 - SOP class extended negotiation:
    /// the SOP class UID and the raw service class application information
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    /// 0x57 - SOP class common extended negotiation
    SopClassCommonExtendedNegotiationSubItem(CommonExtendedNegotiation),
    /// 0x58 - user identity negotiation
    UserIdentityItem(UserIdentity),
}

/// The parameters of an A-ASSOCIATE-RQ PDU.
///
/// Also used as the A-ASSOCIATE request and indication primitive,
/// since the two carry the same parameters.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

/// The parameters of an A-ASSOCIATE-AC PDU.
///
/// The AE titles are echoes of the request
/// and are not semantically significant on receipt.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

/// The parameters of an A-ASSOCIATE-RJ PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

/// A DICOM Upper Layer protocol data unit.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum Pdu {
    /// 0x01 - an association request
    AssociationRQ(AssociationRQ),
    /// 0x02 - an association acknowledgement
    AssociationAC(AssociationAC),
    /// 0x03 - an association rejection
    AssociationRJ(AssociationRJ),
    /// 0x04 - a presentation data transfer
    PData { data: Vec<PDataValue> },
    /// 0x05 - a release request
    ReleaseRQ,
    /// 0x06 - a release response
    ReleaseRP,
    /// 0x07 - an abort
    AbortRQ { source: AbortRQSource },
    /// a PDU of an unrecognized type, kept as raw bytes
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// A short name of the PDU type for log messages.
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::AbortRQ { .. } => "A-ABORT",
            Pdu::Unknown { .. } => "Unknown",
        }
    }
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}
