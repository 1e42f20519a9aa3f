//! Well known unique identifiers used by the upper layer protocol.

/// The DICOM application context name,
/// carried in every association request and acknowledgement.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// The Verification SOP class ("C-ECHO").
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// The Implicit VR Little Endian transfer syntax,
/// the default transfer syntax of the standard.
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

/// The Explicit VR Little Endian transfer syntax.
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
