//! Service primitives exchanged between the association user
//! and the upper layer service provider.
//!
//! Primitives travel through queues in both directions:
//! requests and responses from the user down to the provider,
//! indications and confirmations from the provider up to the user.
//! The associate class primitives carry the same parameters as their
//! PDU counterparts and therefore reuse the PDU parameter structs.

use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRQ,
    PDataValue,
};

/// A service primitive of the upper layer provider.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Primitive {
    /// A-ASSOCIATE request (outbound)
    /// or A-ASSOCIATE indication (inbound).
    AssociateRq(AssociationRQ),
    /// A-ASSOCIATE acceptance response (outbound)
    /// or acceptance confirmation (inbound).
    AssociateAc(AssociationAC),
    /// A-ASSOCIATE rejection response (outbound)
    /// or rejection confirmation (inbound).
    AssociateRj(AssociationRJ),
    /// A-RELEASE request (outbound)
    /// or A-RELEASE indication (inbound).
    ReleaseRq,
    /// A-RELEASE response (outbound)
    /// or A-RELEASE confirmation (inbound).
    ReleaseRp,
    /// A-ABORT request (outbound)
    /// or A-ABORT indication (inbound).
    Abort { source: AbortRQSource },
    /// A-P-ABORT indication: a provider detected problem,
    /// such as a transport failure or a protocol error.
    /// Inbound only.
    ProviderAbort {
        reason: AbortRQServiceProviderReason,
    },
    /// P-DATA request (outbound) or P-DATA indication (inbound).
    PData { data: Vec<PDataValue> },
}

impl Primitive {
    /// A short name of the primitive for log messages.
    pub fn short_description(&self) -> &'static str {
        match self {
            Primitive::AssociateRq(_) => "A-ASSOCIATE (rq)",
            Primitive::AssociateAc(_) => "A-ASSOCIATE (ac)",
            Primitive::AssociateRj(_) => "A-ASSOCIATE (rj)",
            Primitive::ReleaseRq => "A-RELEASE (rq)",
            Primitive::ReleaseRp => "A-RELEASE (rp)",
            Primitive::Abort { .. } => "A-ABORT",
            Primitive::ProviderAbort { .. } => "A-P-ABORT",
            Primitive::PData { .. } => "P-DATA",
        }
    }
}
