//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association
//! requests. See [`ServerAssociationOptions`]
//! for details and examples on how to accept an association.

use std::borrow::Cow;
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use snafu::ensure;
use tracing::debug;

use crate::acse::{
    self, AcceptAny, AcceptAnyIdentity, AcceptCalledAeTitle, AcceptorPolicy, AccessControl,
    UserIdentityVerifier,
};
use crate::association::{
    AbortedSnafu, Association, Error, MissingAbstractSyntaxSnafu, Result, TimeoutSnafu,
    UnexpectedPrimitiveSnafu,
};
use crate::fsm::Mode;
use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource, DEFAULT_MAX_PDU};
use crate::primitive::Primitive;
use crate::provider::{self, NetworkStream, ProviderOptions};
use crate::uids;

#[cfg(feature = "sync-tls")]
pub type TlsStream = rustls::StreamOwned<rustls::ServerConnection, TcpStream>;

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// The outcome of a successful negotiation is an [`Association`].
/// Unlike [`ClientAssociationOptions`],
/// a value of this type can be reused for multiple connections.
///
/// [`ClientAssociationOptions`]: crate::association::ClientAssociationOptions
///
/// Access control logic is available,
/// enabling application entities to decide on
/// whether to accept or reject the association request
/// based on the _called_ and _calling_ AE titles:
///
/// - By default, the application will accept requests from anyone
///   ([`AcceptAny`]).
/// - To only accept requests with a matching _called_ AE title,
///   add a call to [`accept_called_ae_title`][Self::accept_called_ae_title]
///   ([`AcceptCalledAeTitle`]).
/// - To only admit specific peers,
///   list them with [`require_calling_ae_title`][Self::require_calling_ae_title].
/// - Any other policy can be implemented through the [`AccessControl`] trait.
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use dicom_dul::association::server::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("0.0.0.0:11112")?;
/// let scp_options = ServerAssociationOptions::new()
///    .ae_title("ECHO-SCP")
///    .with_abstract_syntax("1.2.840.10008.1.1");
///
/// let (stream, _address) = listener.accept()?;
/// let association = scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the expected application context name
    application_context_name: Cow<'a, str>,
    /// the supported abstract syntaxes
    abstract_syntax_uids: Vec<String>,
    /// the supported transfer syntaxes, in order of preference
    transfer_syntax_uids: Vec<String>,
    /// the supported SCU/SCP roles per SOP class
    role_config: HashMap<String, (bool, bool)>,
    /// the calling AE titles admitted (empty admits any)
    calling_ae_allowlist: Vec<String>,
    /// the user identity verification hook
    identity_verifier: Arc<dyn UserIdentityVerifier>,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// the maximum PDU length to admit on receipt
    max_pdu_length: u32,
    /// the ARTIM timeout
    artim_timeout: Duration,
    /// the interval between polls of the provider's event sources
    poll_interval: Duration,
    /// the bound on association and release round-trips
    acse_timeout: Option<Duration>,
    /// the bound on waiting for a DIMSE message
    dimse_timeout: Option<Duration>,
    /// the maximum idle time between PDUs on the association
    network_timeout: Option<Duration>,
    /// the cap on concurrently established associations
    maximum_associations: usize,
    /// the number of currently established associations
    active_associations: Arc<AtomicUsize>,
    /// TLS configuration for the underlying TCP socket
    #[cfg(feature = "sync-tls")]
    tls_config: Option<Arc<rustls::ServerConfig>>,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            application_context_name: uids::APPLICATION_CONTEXT_NAME.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            role_config: HashMap::new(),
            calling_ae_allowlist: Vec::new(),
            identity_verifier: Arc::new(AcceptAnyIdentity),
            promiscuous: false,
            strict: true,
            max_pdu_length: DEFAULT_MAX_PDU,
            artim_timeout: provider::DEFAULT_ARTIM_TIMEOUT,
            poll_interval: provider::DEFAULT_POLL_INTERVAL,
            acse_timeout: Some(Duration::from_secs(30)),
            dimse_timeout: None,
            network_timeout: None,
            maximum_associations: 10,
            active_associations: Arc::new(AtomicUsize::new(0)),
            #[cfg(feature = "sync-tls")]
            tls_config: None,
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for accepting associations.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// only if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_access_control: _,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_config,
            calling_ae_allowlist,
            identity_verifier,
            promiscuous,
            strict,
            max_pdu_length,
            artim_timeout,
            poll_interval,
            acse_timeout,
            dimse_timeout,
            network_timeout,
            maximum_associations,
            active_associations,
            #[cfg(feature = "sync-tls")]
            tls_config,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            role_config,
            calling_ae_allowlist,
            identity_verifier,
            promiscuous,
            strict,
            max_pdu_length,
            artim_timeout,
            poll_interval,
            acse_timeout,
            dimse_timeout,
            network_timeout,
            maximum_associations,
            active_associations,
            #[cfg(feature = "sync-tls")]
            tls_config,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Admit only the given calling AE title.
    /// May be called multiple times to admit several peers.
    pub fn require_calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<String>,
    {
        self.calling_ae_allowlist
            .push(calling_ae_title.into().trim().to_string());
        self
    }

    /// Include this abstract syntax
    /// in the set of supported abstract syntaxes.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<String>,
    {
        self.abstract_syntax_uids
            .push(abstract_syntax_uid.into().trim().to_string());
        self
    }

    /// Include this abstract syntax with explicit SCU/SCP role support,
    /// applied when the peer proposes a role selection for it.
    pub fn with_abstract_syntax_roles<T>(
        mut self,
        abstract_syntax_uid: T,
        scu: bool,
        scp: bool,
    ) -> Self
    where
        T: Into<String>,
    {
        let uid = abstract_syntax_uid.into().trim().to_string();
        self.role_config.insert(uid.clone(), (scu, scp));
        self.abstract_syntax_uids.push(uid);
        self
    }

    /// Include this transfer syntax
    /// in the list of supported transfer syntaxes.
    ///
    /// When no transfer syntax is configured,
    /// any transfer syntax supported by the main registry is admitted.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<String>,
    {
        self.transfer_syntax_uids
            .push(transfer_syntax_uid.into().trim().to_string());
        self
    }

    /// Change the user identity verification hook.
    pub fn identity_verifier<V>(mut self, verifier: V) -> Self
    where
        V: UserIdentityVerifier + 'static,
    {
        self.identity_verifier = Arc::new(verifier);
        self
    }

    /// Override the maximum expected PDU length.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Cap the number of concurrently established associations.
    /// Requests beyond the cap are rejected as transient.
    pub fn maximum_associations(mut self, maximum: usize) -> Self {
        self.maximum_associations = maximum.max(1);
        self
    }

    /// Override the ARTIM timeout.
    pub fn artim_timeout(mut self, timeout: Duration) -> Self {
        self.artim_timeout = timeout;
        self
    }

    /// Override the interval between polls of the event sources.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound association and release round-trips.
    /// `None` waits indefinitely.
    pub fn acse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acse_timeout = timeout;
        self
    }

    /// Bound the wait for incoming DIMSE messages.
    /// `None` waits indefinitely.
    pub fn dimse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dimse_timeout = timeout;
        self
    }

    /// Bound the idle time between any two PDUs on the association.
    /// `None` admits arbitrarily long pauses.
    pub fn network_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.network_timeout = timeout;
        self
    }

    /// Set the TLS configuration for the underlying TCP socket.
    #[cfg(feature = "sync-tls")]
    pub fn tls_config(mut self, config: impl Into<Arc<rustls::ServerConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Negotiate an association over the given TCP stream.
    pub fn establish(&self, socket: TcpStream) -> Result<Association> {
        self.establish_impl(socket)
    }

    /// Wrap the given TCP stream in a TLS session
    /// and negotiate an association over it.
    #[cfg(feature = "sync-tls")]
    pub fn establish_tls(&self, socket: TcpStream) -> Result<Association> {
        use crate::association::TlsConfigMissingSnafu;
        use snafu::OptionExt;

        let tls_config = self.tls_config.as_ref().context(TlsConfigMissingSnafu)?;
        let conn = rustls::ServerConnection::new(Arc::clone(tls_config))
            .map_err(|source| Error::Tls { source })?;
        self.establish_impl(rustls::StreamOwned::new(conn, socket))
    }

    fn establish_impl<S>(&self, socket: S) -> Result<Association>
    where
        S: NetworkStream + 'static,
    {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );
        acse::validate_ae_title(&self.ae_title)?;

        let handle = provider::spawn_acceptor(
            ProviderOptions {
                mode: Mode::Acceptor,
                max_pdu_length: self.max_pdu_length,
                strict: self.strict,
                artim_timeout: self.artim_timeout,
                network_timeout: self.network_timeout,
                poll_interval: self.poll_interval,
            },
            socket,
        );

        // the association request indication comes up
        // once the provider has received and decoded the RQ PDU
        let rq = match handle.receive(self.acse_timeout) {
            Ok(Primitive::AssociateRq(rq)) => rq,
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
                let _ = handle.send(Primitive::Abort {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ),
                });
                return UnexpectedPrimitiveSnafu {
                    description: other.short_description(),
                }
                .fail();
            }
            Err(provider::Error::TimedOut) => {
                return TimeoutSnafu.fail();
            }
            Err(provider::Error::ProviderGone) => {
                // the ARTIM timer closed the connection before a request came
                return AbortedSnafu {
                    abort_source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::ReasonNotSpecified,
                    ),
                }
                .fail();
            }
        };

        let at_capacity =
            self.active_associations.load(Ordering::Acquire) >= self.maximum_associations;

        let policy = AcceptorPolicy {
            ae_title: self.ae_title.trim(),
            application_context_name: self.application_context_name.as_ref(),
            calling_ae_allowlist: &self.calling_ae_allowlist,
            abstract_syntaxes: &self.abstract_syntax_uids,
            transfer_syntaxes: &self.transfer_syntax_uids,
            role_config: &self.role_config,
            promiscuous: self.promiscuous,
            max_pdu_length: self.max_pdu_length,
            at_capacity,
        };

        match acse::negotiate_as_acceptor(
            &policy,
            &self.ae_access_control,
            self.identity_verifier.as_ref(),
            &rq,
        ) {
            Ok((ac, negotiated)) => {
                handle
                    .send(Primitive::AssociateAc(ac))
                    .map_err(|_| crate::association::TerminatedSnafu.build())?;

                debug!(
                    "association with {} established",
                    negotiated.peer_ae_title
                );
                let slot = AssociationSlot::claim(&self.active_associations);
                Ok(Association::new(
                    handle,
                    Mode::Acceptor,
                    negotiated.presentation_contexts,
                    negotiated.peer_ae_title,
                    negotiated.peer_max_pdu_length,
                    self.max_pdu_length,
                    negotiated.user_variables,
                    self.acse_timeout,
                    self.dimse_timeout,
                    Some(slot),
                ))
            }
            Err(association_rj) => {
                debug!("rejecting association request: {:?}", association_rj);
                let _ = handle.send(Primitive::AssociateRj(association_rj.clone()));
                Err(Error::Rejected { association_rj })
            }
        }
    }
}

/// One occupied slot of an acceptor's association cap.
/// Dropping it releases the slot.
#[derive(Debug)]
pub(crate) struct AssociationSlot(Arc<AtomicUsize>);

impl AssociationSlot {
    fn claim(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        AssociationSlot(Arc::clone(counter))
    }
}

impl Drop for AssociationSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
