//! Association control services.
//!
//! This module carries the negotiation logic on both sides of an
//! association: building and classifying the association request round-trip
//! on the requestor side, and the policy checks, presentation context
//! negotiation and role selection on the acceptor side.
//! It drives the [provider][crate::provider] exclusively through
//! service primitives and never touches the transport itself.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::{debug, warn};

use crate::association::{
    AbortedSnafu, Error, Result, TerminatedSnafu, TimeoutSnafu, UnexpectedPrimitiveSnafu,
};
use crate::fsm::State;
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceProviderAcseReason,
    AssociationRJServiceProviderPresentationReason, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserVariableItem,
    DEFAULT_MAX_PDU,
};
use crate::primitive::Primitive;
use crate::provider::{self, ProviderHandle};
use crate::uids;

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association
    /// request based on the recorded application entity titles.
    ///
    /// Returns `Ok(())` if the requesting node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// whose called AE title matches the node's own AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// Verification hook for user identity negotiation items.
///
/// The default implementation ([`AcceptAnyIdentity`]) accepts everything.
/// A custom verifier may inspect the identity type and fields
/// (including JSON web tokens) and deny the association,
/// which is then rejected as transient by the ACSE function.
pub trait UserIdentityVerifier: Send + Sync + std::fmt::Debug {
    /// Decide whether an association with this user identity may proceed.
    fn verify(&self, user_identity: &UserIdentity) -> bool;
}

/// A user identity verifier which accepts any identity.
#[derive(Debug, Default, Copy, Clone)]
pub struct AcceptAnyIdentity;

impl UserIdentityVerifier for AcceptAnyIdentity {
    fn verify(&self, _user_identity: &UserIdentity) -> bool {
        true
    }
}

/// A presentation context after negotiation,
/// as recorded by either side of the association.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextNegotiated {
    /// the presentation context identifier
    pub id: u8,
    /// the outcome of the negotiation for this context
    pub reason: PresentationContextResultReason,
    /// the selected transfer syntax (significant only on acceptance)
    pub transfer_syntax: String,
    /// the abstract syntax from the proposed context
    pub abstract_syntax: String,
    /// the negotiated SCU role; unset means the default (SCU)
    pub scu_role: Option<bool>,
    /// the negotiated SCP role; unset means the default (not SCP)
    pub scp_role: Option<bool>,
}

impl PresentationContextNegotiated {
    /// Whether this context may carry messages.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }

    /// Whether this node may act as a service class user on this context.
    pub fn scu(&self) -> bool {
        self.scu_role.unwrap_or(true)
    }

    /// Whether this node may act as a service class provider on this context.
    pub fn scp(&self) -> bool {
        self.scp_role.unwrap_or(false)
    }
}

/// The outcome of a successful negotiation, as seen by one side.
#[derive(Debug, Clone)]
pub(crate) struct NegotiatedOptions {
    /// the maximum PDU length the peer is willing to receive
    /// (0 means the peer declared no limit)
    pub peer_max_pdu_length: u32,
    /// the peer's application entity title
    pub peer_ae_title: String,
    /// the negotiated presentation contexts
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    /// the user information items received from the peer
    pub user_variables: Vec<UserVariableItem>,
}

/// The local parameters which govern an acceptor side negotiation.
pub(crate) struct AcceptorPolicy<'a> {
    pub ae_title: &'a str,
    pub application_context_name: &'a str,
    pub calling_ae_allowlist: &'a [String],
    pub abstract_syntaxes: &'a [String],
    pub transfer_syntaxes: &'a [String],
    pub role_config: &'a HashMap<String, (bool, bool)>,
    pub promiscuous: bool,
    pub max_pdu_length: u32,
    /// whether the node has reached its cap of concurrent associations
    pub at_capacity: bool,
}

/// Apply the acceptor policy checks and negotiate the presentation contexts
/// for an incoming association request.
///
/// Returns the A-ASSOCIATE-AC parameters to respond with on success,
/// or the A-ASSOCIATE-RJ parameters on refusal.
pub(crate) fn negotiate_as_acceptor<A, V>(
    policy: &AcceptorPolicy<'_>,
    access_control: &A,
    identity_verifier: &V,
    rq: &AssociationRQ,
) -> Result<(AssociationAC, NegotiatedOptions), AssociationRJ>
where
    A: AccessControl + ?Sized,
    V: UserIdentityVerifier + ?Sized,
{
    // only protocol version 1 exists; test bit 0 alone
    if rq.protocol_version & 0x0001 == 0 {
        return Err(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceProviderAcse(
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            ),
        });
    }

    if rq.application_context_name != policy.application_context_name {
        return Err(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
        });
    }

    if !policy.calling_ae_allowlist.is_empty()
        && !policy
            .calling_ae_allowlist
            .iter()
            .any(|title| title.trim() == rq.calling_ae_title.trim())
    {
        return Err(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ),
        });
    }

    if let Err(reason) = access_control.check_access(
        policy.ae_title,
        rq.calling_ae_title.trim(),
        rq.called_ae_title.trim(),
    ) {
        return Err(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(reason),
        });
    }

    if let Some(user_identity) = user_identity(&rq.user_variables) {
        if !identity_verifier.verify(user_identity) {
            return Err(AssociationRJ {
                result: AssociationRJResult::Transient,
                source: AssociationRJSource::ServiceProviderAcse(
                    AssociationRJServiceProviderAcseReason::NoReasonGiven,
                ),
            });
        }
    }

    if policy.at_capacity {
        return Err(AssociationRJ {
            result: AssociationRJResult::Transient,
            source: AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
        });
    }

    let mut presentation_contexts = negotiate_contexts(
        &rq.presentation_contexts,
        policy.abstract_syntaxes,
        policy.transfer_syntaxes,
        policy.promiscuous,
    );

    let role_replies = negotiate_roles(
        &rq.user_variables,
        policy.role_config,
        &mut presentation_contexts,
    );

    let mut user_variables = vec![
        UserVariableItem::MaxLength(policy.max_pdu_length),
        UserVariableItem::ImplementationClassUID(crate::IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(
            crate::IMPLEMENTATION_VERSION_NAME.to_string(),
        ),
    ];
    user_variables.extend(role_replies.into_iter().map(UserVariableItem::RoleSelection));

    let ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        application_context_name: rq.application_context_name.clone(),
        presentation_contexts: presentation_contexts
            .iter()
            .map(|pc| PresentationContextResult {
                id: pc.id,
                reason: pc.reason.clone(),
                transfer_syntax: pc.transfer_syntax.clone(),
            })
            .collect(),
        user_variables,
    };

    let options = NegotiatedOptions {
        peer_max_pdu_length: max_length(&rq.user_variables).unwrap_or(DEFAULT_MAX_PDU),
        peer_ae_title: rq.calling_ae_title.trim().to_string(),
        presentation_contexts,
        user_variables: rq.user_variables.clone(),
    };

    Ok((ac, options))
}

/// Negotiate each proposed presentation context against
/// the supported abstract and transfer syntaxes.
///
/// The acceptor's transfer syntax preference list wins;
/// the proposer's ordering only breaks ties within one abstract syntax.
fn negotiate_contexts(
    proposed: &[PresentationContextProposed],
    abstract_syntaxes: &[String],
    transfer_syntaxes: &[String],
    promiscuous: bool,
) -> Vec<PresentationContextNegotiated> {
    let mut seen_ids = Vec::new();

    proposed
        .iter()
        .map(|pc| {
            let abstract_syntax = pc.abstract_syntax.trim().to_string();

            // context identifiers must be odd and unique in the association
            if pc.id % 2 == 0 || seen_ids.contains(&pc.id) {
                warn!("refusing presentation context with bad id {}", pc.id);
                return PresentationContextNegotiated {
                    id: pc.id,
                    reason: PresentationContextResultReason::NoReason,
                    transfer_syntax: uids::IMPLICIT_VR_LE.to_string(),
                    abstract_syntax,
                    scu_role: None,
                    scp_role: None,
                };
            }
            seen_ids.push(pc.id);

            if !abstract_syntaxes.iter().any(|uid| *uid == abstract_syntax) && !promiscuous {
                return PresentationContextNegotiated {
                    id: pc.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: uids::IMPLICIT_VR_LE.to_string(),
                    abstract_syntax,
                    scu_role: None,
                    scp_role: None,
                };
            }

            let (transfer_syntax, reason) = choose_ts(transfer_syntaxes, &pc.transfer_syntaxes)
                .map(|ts| (ts, PresentationContextResultReason::Acceptance))
                .unwrap_or_else(|| {
                    (
                        uids::IMPLICIT_VR_LE.to_string(),
                        PresentationContextResultReason::TransferSyntaxesNotSupported,
                    )
                });

            PresentationContextNegotiated {
                id: pc.id,
                reason,
                transfer_syntax,
                abstract_syntax,
                scu_role: None,
                scp_role: None,
            }
        })
        .collect()
}

/// From the proposed transfer syntaxes of one presentation context,
/// choose the first which is both on the supported list
/// and decodable by the main transfer syntax registry.
///
/// An empty supported list admits any registry supported transfer syntax.
fn choose_ts(supported: &[String], proposed: &[String]) -> Option<String> {
    if supported.is_empty() {
        return choose_supported(proposed.iter().map(|ts| ts.trim().to_string()));
    }

    proposed
        .iter()
        .map(|ts| ts.trim().to_string())
        .find(|ts| supported.iter().any(|uid| uid == ts) && is_supported(ts))
}

/// Compute the role selection replies for an acceptor,
/// updating the negotiated contexts with the agreed roles.
///
/// A proposal is intersected with the configured support for its SOP class;
/// SOP classes without explicit configuration support the defaults only
/// (the peer acts as SCU, this node as SCP of the context).
fn negotiate_roles(
    rq_items: &[UserVariableItem],
    role_config: &HashMap<String, (bool, bool)>,
    contexts: &mut [PresentationContextNegotiated],
) -> Vec<RoleSelection> {
    let mut replies = Vec::new();

    for item in rq_items {
        let proposal = match item {
            UserVariableItem::RoleSelection(proposal) => proposal,
            _ => continue,
        };

        let (scu_supported, scp_supported) = role_config
            .get(proposal.sop_class_uid.trim())
            .copied()
            .unwrap_or((true, false));
        let scu_role = proposal.scu_role && scu_supported;
        let scp_role = proposal.scp_role && scp_supported;

        let mut applied = false;
        for context in contexts.iter_mut() {
            if context.is_accepted() && context.abstract_syntax == proposal.sop_class_uid.trim() {
                context.scu_role = Some(scu_role);
                context.scp_role = Some(scp_role);
                applied = true;
            }
        }

        if applied {
            replies.push(RoleSelection {
                sop_class_uid: proposal.sop_class_uid.trim().to_string(),
                scu_role,
                scp_role,
            });
        }
    }

    replies
}

/// Combine the acknowledged presentation contexts with the proposal,
/// as done by the requestor after a successful association round-trip.
pub(crate) fn combine_contexts(
    proposed: &[PresentationContextProposed],
    results: &[PresentationContextResult],
    ac_items: &[UserVariableItem],
) -> Vec<PresentationContextNegotiated> {
    results
        .iter()
        .filter_map(|result| {
            let proposal = match proposed.iter().find(|pc| pc.id == result.id) {
                Some(proposal) => proposal,
                None => {
                    warn!(
                        "peer acknowledged unknown presentation context {}",
                        result.id
                    );
                    return None;
                }
            };

            let roles = ac_items.iter().find_map(|item| match item {
                UserVariableItem::RoleSelection(role)
                    if role.sop_class_uid.trim() == proposal.abstract_syntax.trim() =>
                {
                    Some((role.scu_role, role.scp_role))
                }
                _ => None,
            });

            Some(PresentationContextNegotiated {
                id: result.id,
                reason: result.reason.clone(),
                transfer_syntax: result.transfer_syntax.trim().to_string(),
                abstract_syntax: proposal.abstract_syntax.trim().to_string(),
                scu_role: roles.map(|(scu, _)| scu),
                scp_role: roles.map(|(_, scp)| scp),
            })
        })
        .collect()
}

/// Submit an association request and classify the first reply.
///
/// Anything other than an acknowledgement, a rejection or an abort
/// makes this node abort the association itself.
pub(crate) fn request_association(
    handle: &ProviderHandle,
    rq: AssociationRQ,
    timeout: Option<Duration>,
) -> Result<AssociationAC, Error> {
    handle
        .send(Primitive::AssociateRq(rq))
        .map_err(|_| TerminatedSnafu.build())?;

    match handle.receive(timeout) {
        Ok(Primitive::AssociateAc(ac)) => Ok(ac),
        Ok(Primitive::AssociateRj(association_rj)) => {
            Err(Error::Rejected { association_rj })
        }
        Ok(Primitive::Abort { source }) => AbortedSnafu {
            abort_source: source,
        }
        .fail(),
        Ok(Primitive::ProviderAbort { reason }) => AbortedSnafu {
            abort_source: AbortRQSource::ServiceProvider(reason),
        }
        .fail(),
        Ok(other) => {
            debug!(
                "aborting: unexpected {} while establishing",
                other.short_description()
            );
            let _ = handle.send(Primitive::Abort {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ),
            });
            UnexpectedPrimitiveSnafu {
                description: other.short_description(),
            }
            .fail()
        }
        Err(provider::Error::TimedOut) => {
            let _ = handle.send(Primitive::Abort {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::ReasonNotSpecified,
                ),
            });
            TimeoutSnafu.fail()
        }
        Err(provider::Error::ProviderGone) => AbortedSnafu {
            abort_source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ),
        }
        .fail(),
    }
}

/// Run the release handshake from the requesting side,
/// including both branches of a release collision.
///
/// On a collision, the association requestor answers the peer's release
/// request right away, while the acceptor side defers its response until
/// the peer's release confirmation has arrived.
/// When the peer's own release request overtook ours,
/// it is acknowledged and the release counts as complete.
pub(crate) fn release(handle: &ProviderHandle, timeout: Option<Duration>) -> Result<(), Error> {
    handle
        .send(Primitive::ReleaseRq)
        .map_err(|_| TerminatedSnafu.build())?;

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut respond_after_confirmation = false;

    loop {
        let remaining = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    abort_quietly(handle);
                    return TimeoutSnafu.fail();
                }
                Some(remaining)
            }
            None => None,
        };

        match handle.receive(remaining) {
            Ok(Primitive::ReleaseRp) => {
                if respond_after_confirmation {
                    let _ = handle.send(Primitive::ReleaseRp);
                }
                return Ok(());
            }
            Ok(Primitive::ReleaseRq) => match handle.machine_state() {
                State::Sta9 => {
                    // collision, requestor side: answer immediately
                    debug!("release collision detected (requestor side)");
                    handle
                        .send(Primitive::ReleaseRp)
                        .map_err(|_| TerminatedSnafu.build())?;
                }
                State::Sta10 => {
                    // collision, acceptor side: answer after the
                    // peer's release confirmation has arrived
                    debug!("release collision detected (acceptor side)");
                    respond_after_confirmation = true;
                }
                _ => {
                    // the peer's release request arrived first;
                    // acknowledge it and count the release as done
                    debug!("peer requested release first");
                    let _ = handle.send(Primitive::ReleaseRp);
                    return Ok(());
                }
            },
            Ok(Primitive::PData { .. }) => {
                // pending data from before the peer saw our release request
                debug!("discarding P-DATA received while releasing");
            }
            Ok(Primitive::Abort { source }) => {
                return AbortedSnafu {
                    abort_source: source,
                }
                .fail();
            }
            Ok(Primitive::ProviderAbort { reason }) => {
                return AbortedSnafu {
                    abort_source: AbortRQSource::ServiceProvider(reason),
                }
                .fail();
            }
            Ok(other) => {
                warn!(
                    "ignoring unexpected {} while releasing",
                    other.short_description()
                );
            }
            Err(provider::Error::TimedOut) => {
                abort_quietly(handle);
                return TimeoutSnafu.fail();
            }
            Err(provider::Error::ProviderGone) => {
                return TerminatedSnafu.fail();
            }
        }
    }
}

fn abort_quietly(handle: &ProviderHandle) {
    let _ = handle.send(Primitive::Abort {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::ReasonNotSpecified),
    });
}

/// The maximum length announced in a set of user information items.
pub(crate) fn max_length(items: &[UserVariableItem]) -> Option<u32> {
    items.iter().find_map(|item| match item {
        UserVariableItem::MaxLength(max_length) => Some(*max_length),
        _ => None,
    })
}

/// The user identity negotiation item, if present.
pub(crate) fn user_identity(items: &[UserVariableItem]) -> Option<&UserIdentity> {
    items.iter().find_map(|item| match item {
        UserVariableItem::UserIdentityItem(user_identity) => Some(user_identity),
        _ => None,
    })
}

/// Check that a transfer syntax repository supports the given
/// transfer syntax, meaning that it can decode its data sets.
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// Check that the main transfer syntax registry supports the given
/// transfer syntax, meaning that it can decode its data sets.
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}

/// From a sequence of transfer syntaxes, choose the first
/// supported by the main transfer syntax registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

/// Validate an application entity title for local configuration:
/// non-empty, at most 16 bytes, ASCII without control characters.
pub(crate) fn validate_ae_title(title: &str) -> Result<(), Error> {
    let trimmed = title.trim();
    if trimmed.is_empty()
        || title.len() > 16
        || !title
            .bytes()
            .all(|c| c.is_ascii_graphic() || c == b' ')
    {
        return Err(Error::InvalidAeTitle {
            title: title.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with<'a>(
        abstract_syntaxes: &'a [String],
        transfer_syntaxes: &'a [String],
        allowlist: &'a [String],
        role_config: &'a HashMap<String, (bool, bool)>,
    ) -> AcceptorPolicy<'a> {
        AcceptorPolicy {
            ae_title: "THIS-SCP",
            application_context_name: uids::APPLICATION_CONTEXT_NAME,
            calling_ae_allowlist: allowlist,
            abstract_syntaxes,
            transfer_syntaxes,
            role_config,
            promiscuous: false,
            max_pdu_length: DEFAULT_MAX_PDU,
            at_capacity: false,
        }
    }

    fn verification_rq() -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "THIS-SCU".to_string(),
            called_ae_title: "THIS-SCP".to_string(),
            application_context_name: uids::APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: uids::VERIFICATION.to_string(),
                transfer_syntaxes: vec![uids::IMPLICIT_VR_LE.to_string()],
            }],
            user_variables: vec![UserVariableItem::MaxLength(DEFAULT_MAX_PDU)],
        }
    }

    #[test]
    fn acceptor_accepts_supported_context() {
        let abstract_syntaxes = vec![uids::VERIFICATION.to_string()];
        let transfer_syntaxes = vec![uids::IMPLICIT_VR_LE.to_string()];
        let roles = HashMap::new();
        let policy = policy_with(&abstract_syntaxes, &transfer_syntaxes, &[], &roles);

        let (ac, options) =
            negotiate_as_acceptor(&policy, &AcceptAny, &AcceptAnyIdentity, &verification_rq())
                .expect("association should be accepted");

        assert_eq!(ac.presentation_contexts.len(), 1);
        assert_eq!(ac.presentation_contexts[0].id, 1);
        assert_eq!(
            ac.presentation_contexts[0].reason,
            PresentationContextResultReason::Acceptance
        );
        assert_eq!(
            ac.presentation_contexts[0].transfer_syntax,
            uids::IMPLICIT_VR_LE
        );
        assert_eq!(options.peer_max_pdu_length, DEFAULT_MAX_PDU);
        assert_eq!(options.peer_ae_title, "THIS-SCU");
        assert!(options.presentation_contexts[0].is_accepted());
        // role defaults: the peer is the SCU, not an SCP
        assert!(options.presentation_contexts[0].scu());
        assert!(!options.presentation_contexts[0].scp());
    }

    #[test]
    fn acceptor_refuses_unknown_abstract_syntax() {
        let abstract_syntaxes = vec![uids::VERIFICATION.to_string()];
        let transfer_syntaxes = vec![uids::IMPLICIT_VR_LE.to_string()];
        let roles = HashMap::new();
        let policy = policy_with(&abstract_syntaxes, &transfer_syntaxes, &[], &roles);

        let mut rq = verification_rq();
        rq.presentation_contexts.insert(
            0,
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.3.4".to_string(),
                transfer_syntaxes: vec![uids::IMPLICIT_VR_LE.to_string()],
            },
        );

        let (ac, _) =
            negotiate_as_acceptor(&policy, &AcceptAny, &AcceptAnyIdentity, &rq).unwrap();

        assert_eq!(ac.presentation_contexts.len(), 2);
        let refused = ac
            .presentation_contexts
            .iter()
            .find(|pc| pc.id == 3)
            .unwrap();
        assert_eq!(
            refused.reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        let accepted = ac
            .presentation_contexts
            .iter()
            .find(|pc| pc.id == 1)
            .unwrap();
        assert_eq!(accepted.reason, PresentationContextResultReason::Acceptance);
    }

    #[test]
    fn acceptor_refuses_unsupported_transfer_syntaxes() {
        let abstract_syntaxes = vec![uids::VERIFICATION.to_string()];
        let transfer_syntaxes = vec![uids::EXPLICIT_VR_LE.to_string()];
        let roles = HashMap::new();
        let policy = policy_with(&abstract_syntaxes, &transfer_syntaxes, &[], &roles);

        let (ac, _) = negotiate_as_acceptor(
            &policy,
            &AcceptAny,
            &AcceptAnyIdentity,
            &verification_rq(),
        )
        .unwrap();

        assert_eq!(
            ac.presentation_contexts[0].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
    }

    #[test]
    fn acceptor_rejects_unknown_calling_ae_title() {
        let abstract_syntaxes = vec![uids::VERIFICATION.to_string()];
        let transfer_syntaxes = vec![uids::IMPLICIT_VR_LE.to_string()];
        let allowlist = vec!["EXPECTED".to_string()];
        let roles = HashMap::new();
        let policy = policy_with(&abstract_syntaxes, &transfer_syntaxes, &allowlist, &roles);

        let mut rq = verification_rq();
        rq.calling_ae_title = "OTHER".to_string();

        let rj = negotiate_as_acceptor(&policy, &AcceptAny, &AcceptAnyIdentity, &rq)
            .expect_err("association should be rejected");
        assert_eq!(rj.result, AssociationRJResult::Permanent);
        assert_eq!(
            rj.source,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized
            )
        );
    }

    #[test]
    fn acceptor_rejects_when_at_capacity() {
        let abstract_syntaxes = vec![uids::VERIFICATION.to_string()];
        let transfer_syntaxes = vec![uids::IMPLICIT_VR_LE.to_string()];
        let roles = HashMap::new();
        let mut policy = policy_with(&abstract_syntaxes, &transfer_syntaxes, &[], &roles);
        policy.at_capacity = true;

        let rj = negotiate_as_acceptor(
            &policy,
            &AcceptAny,
            &AcceptAnyIdentity,
            &verification_rq(),
        )
        .expect_err("association should be rejected");
        assert_eq!(rj.result, AssociationRJResult::Transient);
        assert_eq!(
            rj.source,
            AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded
            )
        );
    }

    #[test]
    fn acceptor_refuses_even_context_ids() {
        let abstract_syntaxes = vec![uids::VERIFICATION.to_string()];
        let transfer_syntaxes = vec![uids::IMPLICIT_VR_LE.to_string()];
        let roles = HashMap::new();
        let policy = policy_with(&abstract_syntaxes, &transfer_syntaxes, &[], &roles);

        let mut rq = verification_rq();
        rq.presentation_contexts[0].id = 2;

        let (ac, _) =
            negotiate_as_acceptor(&policy, &AcceptAny, &AcceptAnyIdentity, &rq).unwrap();
        assert_eq!(
            ac.presentation_contexts[0].reason,
            PresentationContextResultReason::NoReason
        );
    }

    #[test]
    fn role_selection_is_intersected_with_support() {
        let abstract_syntaxes = vec![uids::VERIFICATION.to_string()];
        let transfer_syntaxes = vec![uids::IMPLICIT_VR_LE.to_string()];
        let mut roles = HashMap::new();
        roles.insert(uids::VERIFICATION.to_string(), (true, true));
        let policy = policy_with(&abstract_syntaxes, &transfer_syntaxes, &[], &roles);

        let mut rq = verification_rq();
        rq.user_variables
            .push(UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: uids::VERIFICATION.to_string(),
                scu_role: true,
                scp_role: true,
            }));

        let (ac, options) =
            negotiate_as_acceptor(&policy, &AcceptAny, &AcceptAnyIdentity, &rq).unwrap();

        let reply = ac
            .user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::RoleSelection(role) => Some(role),
                _ => None,
            })
            .expect("a role selection reply is expected");
        assert!(reply.scu_role);
        assert!(reply.scp_role);
        assert_eq!(options.presentation_contexts[0].scu_role, Some(true));
        assert_eq!(options.presentation_contexts[0].scp_role, Some(true));

        // without configured support, the SCP role is denied
        let roles = HashMap::new();
        let policy = policy_with(&abstract_syntaxes, &transfer_syntaxes, &[], &roles);
        let (ac, _) =
            negotiate_as_acceptor(&policy, &AcceptAny, &AcceptAnyIdentity, &rq).unwrap();
        let reply = ac
            .user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::RoleSelection(role) => Some(role),
                _ => None,
            })
            .unwrap();
        assert!(reply.scu_role);
        assert!(!reply.scp_role);
    }

    #[test]
    fn ae_title_validation() {
        assert!(validate_ae_title("STORE-SCP").is_ok());
        assert!(validate_ae_title("").is_err());
        assert!(validate_ae_title("   ").is_err());
        assert!(validate_ae_title("TITLE-LONGER-THAN-16-BYTES").is_err());
        assert!(validate_ae_title("BAD\u{7}TITLE").is_err());
    }
}
