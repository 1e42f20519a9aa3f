//! DICOM association module
//!
//! This module contains the abstractions for establishing associations
//! between DICOM nodes via TCP and for exchanging DIMSE messages on them.
//!
//! - [`ClientAssociationOptions`] requests an association
//!   with another node (usually a service class provider);
//! - [`ServerAssociationOptions`] accepts an association request
//!   arriving on a listening socket;
//! - both produce an established [`Association`].

pub mod client;
pub mod server;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use snafu::Snafu;
use tracing::{debug, warn};

use crate::acse::{self, PresentationContextNegotiated};
use crate::dimse::{self, DimseMessage, MessageAssembler};
use crate::fsm::Mode;
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationRJ, UserVariableItem,
};
use crate::primitive::Primitive;
use crate::provider::{self, ProviderHandle};

pub use crate::acse::{
    AcceptAny, AcceptAnyIdentity, AcceptCalledAeTitle, AccessControl, UserIdentityVerifier,
};
pub use client::ClientAssociationOptions;
pub use server::ServerAssociationOptions;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax,

    #[snafu(display("invalid application entity title `{}`", title))]
    InvalidAeTitle { title: String },

    /// could not resolve the peer address
    ResolveAddress { source: std::io::Error },

    #[snafu(display("association rejected ({:?})", association_rj))]
    Rejected { association_rj: AssociationRJ },

    #[snafu(display("association aborted ({:?})", abort_source))]
    Aborted { abort_source: AbortRQSource },

    /// the peer requested the release of the association
    PeerReleased,

    /// the operation did not complete within the configured time
    Timeout,

    /// the association is not established
    NotEstablished,

    /// the association has already terminated
    Terminated,

    #[snafu(display("presentation context {} is not accepted", id))]
    NoSuchPresentationContext { id: u8 },

    /// no presentation contexts accepted by the peer
    NoAcceptedPresentationContexts,

    #[snafu(display("unexpected primitive `{}`", description))]
    UnexpectedPrimitive { description: &'static str },

    /// broken DIMSE message framing
    MessageFraming {
        #[snafu(backtrace)]
        source: dimse::Error,
    },

    /// TLS was requested but no TLS configuration was provided
    #[cfg(feature = "sync-tls")]
    TlsConfigMissing,

    /// could not establish the TLS session
    #[cfg(feature = "sync-tls")]
    Tls { source: rustls::Error },

    /// the server name for TLS verification is invalid
    #[cfg(feature = "sync-tls")]
    InvalidServerName {
        source: rustls::pki_types::InvalidDnsNameError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The lifecycle state of an association.
///
/// The terminal states (`Released` and `Aborted`) are absorbing:
/// no operation can resume a terminated association.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum AssociationState {
    /// negotiation is in progress
    Establishing,
    /// data transfer is allowed
    Established,
    /// a release handshake is in progress
    Releasing,
    /// the association was released in an orderly fashion
    Released,
    /// the association ended with an abort
    Aborted,
}

/// An established association between two DICOM application entities.
///
/// The association exchanges whole DIMSE messages
/// ([`send_message`][Association::send_message] /
/// [`receive_message`][Association::receive_message]),
/// hiding the PDV fragmentation and the protocol state machine,
/// which runs on a dedicated worker thread for as long as
/// the association lives.
///
/// When the value falls out of scope without a prior
/// [`release`][Association::release],
/// the association is aborted.
#[derive(Debug)]
pub struct Association {
    handle: ProviderHandle,
    mode: Mode,
    state: AssociationState,
    presentation_contexts: Vec<PresentationContextNegotiated>,
    peer_ae_title: String,
    /// the maximum PDU length the peer accepts (bounds our sends)
    peer_max_pdu_length: u32,
    /// the maximum PDU length this node accepts
    max_pdu_length: u32,
    peer_user_variables: Vec<UserVariableItem>,
    acse_timeout: Option<Duration>,
    dimse_timeout: Option<Duration>,
    assembler: MessageAssembler,
    completed: VecDeque<DimseMessage>,
    /// keeps one slot of the acceptor's concurrency cap, if any
    _slot: Option<server::AssociationSlot>,
}

impl Association {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: ProviderHandle,
        mode: Mode,
        presentation_contexts: Vec<PresentationContextNegotiated>,
        peer_ae_title: String,
        peer_max_pdu_length: u32,
        max_pdu_length: u32,
        peer_user_variables: Vec<UserVariableItem>,
        acse_timeout: Option<Duration>,
        dimse_timeout: Option<Duration>,
        slot: Option<server::AssociationSlot>,
    ) -> Self {
        Association {
            handle,
            mode,
            state: AssociationState::Established,
            presentation_contexts,
            peer_ae_title,
            peer_max_pdu_length,
            max_pdu_length,
            peer_user_variables,
            acse_timeout,
            dimse_timeout,
            assembler: MessageAssembler::new(),
            completed: VecDeque::new(),
            _slot: slot,
        }
    }

    /// Obtain a view of the negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    /// Obtain the presentation contexts which may carry messages.
    pub fn accepted_presentation_contexts(
        &self,
    ) -> impl Iterator<Item = &PresentationContextNegotiated> {
        self.presentation_contexts
            .iter()
            .filter(|pc| pc.is_accepted())
    }

    /// Obtain the presentation contexts refused by the acceptor.
    pub fn rejected_presentation_contexts(
        &self,
    ) -> impl Iterator<Item = &PresentationContextNegotiated> {
        self.presentation_contexts
            .iter()
            .filter(|pc| !pc.is_accepted())
    }

    /// Obtain the remote DICOM node's application entity title.
    pub fn peer_ae_title(&self) -> &str {
        &self.peer_ae_title
    }

    /// Retrieve the maximum PDU length that the peer accepts,
    /// which bounds the size of the P-DATA PDUs sent by this node.
    /// A value of 0 means that the peer declared no maximum.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.peer_max_pdu_length
    }

    /// Retrieve the maximum PDU length admitted by this node.
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// Obtain the user information items received from the peer.
    pub fn peer_user_variables(&self) -> &[UserVariableItem] {
        &self.peer_user_variables
    }

    /// The lifecycle state of this association.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// Whether this node requested or accepted the association.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Observe the current state of the underlying protocol machine.
    pub fn machine_state(&self) -> crate::fsm::State {
        self.handle.machine_state()
    }

    fn ensure_established(&self) -> Result<()> {
        match self.state {
            AssociationState::Established => Ok(()),
            AssociationState::Establishing | AssociationState::Releasing => {
                NotEstablishedSnafu.fail()
            }
            AssociationState::Released | AssociationState::Aborted => TerminatedSnafu.fail(),
        }
    }

    /// Send one DIMSE message on the given presentation context.
    ///
    /// The command set bytes and the optional data set bytes
    /// are fragmented into as many P-DATA PDUs as necessary
    /// to honor the peer's maximum PDU length.
    pub fn send_message(
        &mut self,
        presentation_context_id: u8,
        command: &[u8],
        dataset: Option<&[u8]>,
    ) -> Result<()> {
        self.ensure_established()?;

        self.presentation_contexts
            .iter()
            .find(|pc| pc.id == presentation_context_id && pc.is_accepted())
            .ok_or_else(|| {
                NoSuchPresentationContextSnafu {
                    id: presentation_context_id,
                }
                .build()
            })?;

        let payloads = dimse::fragment_message(
            presentation_context_id,
            command,
            dataset,
            self.peer_max_pdu_length,
        )
        .map_err(|source| Error::MessageFraming { source })?;

        for data in payloads {
            if self.handle.send(Primitive::PData { data }).is_err() {
                self.state = AssociationState::Aborted;
                return TerminatedSnafu.fail();
            }
        }
        Ok(())
    }

    /// Receive one whole DIMSE message,
    /// waiting at most the configured DIMSE timeout.
    ///
    /// If the peer releases the association while waiting,
    /// the release is acknowledged and [`Error::PeerReleased`] is returned.
    /// A timeout aborts the association.
    pub fn receive_message(&mut self) -> Result<DimseMessage> {
        self.receive_message_timeout(self.dimse_timeout)
    }

    /// Receive one whole DIMSE message with an explicit timeout.
    pub fn receive_message_timeout(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<DimseMessage> {
        self.ensure_established()?;

        if let Some(message) = self.completed.pop_front() {
            return Ok(message);
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.abort_as_provider(AbortRQServiceProviderReason::ReasonNotSpecified);
                        return TimeoutSnafu.fail();
                    }
                    Some(remaining)
                }
                None => None,
            };

            match self.handle.receive(remaining) {
                Ok(Primitive::PData { data }) => {
                    for pdv in data {
                        match self.assembler.offer(pdv) {
                            Ok(Some(message)) => self.completed.push_back(message),
                            Ok(None) => {}
                            Err(source) => {
                                self.abort_as_provider(
                                    AbortRQServiceProviderReason::UnexpectedPdu,
                                );
                                return Err(Error::MessageFraming { source });
                            }
                        }
                    }
                    if let Some(message) = self.completed.pop_front() {
                        return Ok(message);
                    }
                }
                Ok(Primitive::ReleaseRq) => {
                    // answer the peer's release and wind down
                    debug!("peer requested release");
                    let _ = self.handle.send(Primitive::ReleaseRp);
                    self.state = AssociationState::Released;
                    return PeerReleasedSnafu.fail();
                }
                Ok(Primitive::Abort { source }) => {
                    self.state = AssociationState::Aborted;
                    return AbortedSnafu {
                        abort_source: source,
                    }
                    .fail();
                }
                Ok(Primitive::ProviderAbort { reason }) => {
                    self.state = AssociationState::Aborted;
                    return AbortedSnafu {
                        abort_source: AbortRQSource::ServiceProvider(reason),
                    }
                    .fail();
                }
                Ok(other) => {
                    warn!(
                        "ignoring unexpected {} while receiving",
                        other.short_description()
                    );
                }
                Err(provider::Error::TimedOut) => {
                    self.abort_as_provider(AbortRQServiceProviderReason::ReasonNotSpecified);
                    return TimeoutSnafu.fail();
                }
                Err(provider::Error::ProviderGone) => {
                    self.state = AssociationState::Aborted;
                    return TerminatedSnafu.fail();
                }
            }
        }
    }

    /// Gracefully release the association.
    ///
    /// Suspends until the peer confirms the release
    /// (also through a release collision) or the ACSE timeout fires,
    /// in which case the association is aborted instead.
    pub fn release(&mut self) -> Result<()> {
        self.ensure_established()?;
        self.state = AssociationState::Releasing;
        // partially assembled messages do not survive the release
        self.assembler.reset();
        match acse::release(&self.handle, self.acse_timeout) {
            Ok(()) => {
                self.state = AssociationState::Released;
                Ok(())
            }
            Err(e) => {
                self.state = AssociationState::Aborted;
                Err(e)
            }
        }
    }

    /// Abort the association on behalf of the service user.
    ///
    /// Abort always succeeds locally;
    /// no confirmation is expected from the peer.
    pub fn abort(mut self) {
        self.send_abort(AbortRQSource::ServiceUser);
    }

    /// Abort the association with an explicit abort source.
    pub fn abort_with(mut self, source: AbortRQSource) {
        self.send_abort(source);
    }

    fn abort_as_provider(&mut self, reason: AbortRQServiceProviderReason) {
        self.send_abort(AbortRQSource::ServiceProvider(reason));
    }

    fn send_abort(&mut self, source: AbortRQSource) {
        if !matches!(
            self.state,
            AssociationState::Released | AssociationState::Aborted
        ) {
            let _ = self.handle.send(Primitive::Abort { source });
        }
        self.state = AssociationState::Aborted;
        self.assembler.reset();
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        if !matches!(
            self.state,
            AssociationState::Released | AssociationState::Aborted
        ) {
            self.send_abort(AbortRQSource::ServiceUser);
        }
    }
}
