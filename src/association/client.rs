//! Association requestor module
//!
//! The module provides an abstraction for requesting a DICOM association
//! with another node, usually a service class provider (SCP).
//! See [`ClientAssociationOptions`] for details and examples.

use std::borrow::Cow;
use std::convert::TryFrom;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use snafu::{ensure, ResultExt};

use crate::acse;
use crate::address::FullAeAddr;
use crate::association::{
    Association, Error, MissingAbstractSyntaxSnafu, NoAcceptedPresentationContextsSnafu,
    ResolveAddressSnafu, Result,
};
use crate::fsm::Mode;
use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationRQ, CommonExtendedNegotiation,
    PresentationContextProposed, RoleSelection, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::primitive::Primitive;
use crate::provider::{self, NetworkStream, ProviderOptions};
use crate::uids;

/// A DICOM association builder for a client node.
/// The outcome of a successful negotiation is an [`Association`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use dicom_dul::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .calling_ae_title("ECHO-SCU")
///    .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2"])
///    .establish("192.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// A presentation context proposed without transfer syntaxes
/// admits _Explicit VR Little Endian_ and _Implicit VR Little Endian_
/// by default.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    /// the calling AE title
    calling_ae_title: Cow<'static, str>,
    /// the called AE title
    called_ae_title: Cow<'static, str>,
    /// the requested application context name
    application_context_name: Cow<'static, str>,
    /// the presentation contexts to propose
    presentation_contexts: Vec<(String, Vec<String>)>,
    /// the SCP/SCU role selections to propose
    role_selections: Vec<RoleSelection>,
    /// SOP class extended negotiation items to attach
    extended_negotiations: Vec<(String, Vec<u8>)>,
    /// SOP class common extended negotiation items to attach
    common_extended_negotiations: Vec<CommonExtendedNegotiation>,
    /// the user identity to provide, if any
    user_identity: Option<UserIdentity>,
    /// the asynchronous operations window to announce, if any
    asynchronous_operations_window: Option<(u16, u16)>,
    /// the protocol version to announce
    protocol_version: u16,
    /// the maximum PDU length to admit on receipt
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
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
    /// TLS configuration for the underlying TCP socket
    #[cfg(feature = "sync-tls")]
    tls_config: Option<std::sync::Arc<rustls::ClientConfig>>,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: uids::APPLICATION_CONTEXT_NAME.into(),
            presentation_contexts: Vec::new(),
            role_selections: Vec::new(),
            extended_negotiations: Vec::new(),
            common_extended_negotiations: Vec::new(),
            user_identity: None,
            asynchronous_operations_window: None,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            artim_timeout: provider::DEFAULT_ARTIM_TIMEOUT,
            poll_interval: provider::DEFAULT_POLL_INTERVAL,
            acse_timeout: Some(Duration::from_secs(30)),
            dimse_timeout: None,
            network_timeout: None,
            #[cfg(feature = "sync-tls")]
            tls_config: None,
        }
    }
}

impl ClientAssociationOptions {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Propose a presentation context with the given abstract syntax
    /// and candidate transfer syntaxes, in order of preference.
    ///
    /// An empty transfer syntax list admits the defaults
    /// (_Explicit VR Little Endian_ and _Implicit VR Little Endian_).
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<String>,
    {
        self.presentation_contexts.push((
            trim_uid_string(abstract_syntax_uid.into()),
            transfer_syntax_uids
                .into_iter()
                .map(|uid| trim_uid_string(uid.into()))
                .collect(),
        ));
        self
    }

    /// Propose a presentation context with the given abstract syntax
    /// and the default transfer syntaxes.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<String>,
    {
        self.with_presentation_context(abstract_syntax_uid.into(), Vec::new())
    }

    /// Propose an SCP/SCU role selection for one SOP class.
    pub fn with_role_selection<T>(mut self, sop_class_uid: T, scu: bool, scp: bool) -> Self
    where
        T: Into<String>,
    {
        self.role_selections.push(RoleSelection {
            sop_class_uid: trim_uid_string(sop_class_uid.into()),
            scu_role: scu,
            scp_role: scp,
        });
        self
    }

    /// Attach a SOP class extended negotiation item
    /// with raw service class application information.
    pub fn with_extended_negotiation<T>(mut self, sop_class_uid: T, data: Vec<u8>) -> Self
    where
        T: Into<String>,
    {
        self.extended_negotiations
            .push((trim_uid_string(sop_class_uid.into()), data));
        self
    }

    /// Attach a SOP class common extended negotiation item.
    pub fn with_common_extended_negotiation(
        mut self,
        negotiation: CommonExtendedNegotiation,
    ) -> Self {
        self.common_extended_negotiations.push(negotiation);
        self
    }

    /// Provide a user identity for the association request.
    pub fn user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Announce an asynchronous operations window
    /// (maximum operations invoked, maximum operations performed).
    ///
    /// The window is negotiated and reported,
    /// but operations are not scheduled asynchronously by this crate.
    pub fn asynchronous_operations_window(mut self, invoked: u16, performed: u16) -> Self {
        self.asynchronous_operations_window = Some((invoked, performed));
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

    /// Set the TLS configuration to use when establishing
    /// the association over a secure transport.
    #[cfg(feature = "sync-tls")]
    pub fn tls_config(mut self, config: impl Into<std::sync::Arc<rustls::ClientConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Initiate the TCP connection and negotiate the association.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<Association> {
        let address = resolve_address(address)?;
        let connect_timeout = self.network_timeout;
        self.establish_impl(move || match connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&address, timeout),
            None => TcpStream::connect(address),
        })
    }

    /// Negotiate the association with a node
    /// addressed as `{ae_title}@{socket_address}`.
    ///
    /// A plain socket address leaves the called AE title unchanged.
    pub fn establish_with(self, ae_address: &str) -> Result<Association> {
        match ae_address.parse::<FullAeAddr>() {
            Ok(ae_address) => self
                .called_ae_title(ae_address.ae_title().to_string())
                .establish(ae_address.socket_addr()),
            Err(_) => self.establish(ae_address),
        }
    }

    /// Initiate the TCP connection, wrap it in a TLS session
    /// and negotiate the association over it.
    ///
    /// `domain` is the server name presented for certificate validation.
    #[cfg(feature = "sync-tls")]
    pub fn establish_tls<A: ToSocketAddrs>(self, domain: &str, address: A) -> Result<Association> {
        use crate::association::{InvalidServerNameSnafu, TlsConfigMissingSnafu};
        use snafu::OptionExt;

        let tls_config = self.tls_config.clone().context(TlsConfigMissingSnafu)?;
        let server_name = rustls::pki_types::ServerName::try_from(domain.to_string())
            .context(InvalidServerNameSnafu)?;
        let address = resolve_address(address)?;
        let connect_timeout = self.network_timeout;

        self.establish_impl(move || {
            let socket = match connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&address, timeout)?,
                None => TcpStream::connect(address)?,
            };
            let conn = rustls::ClientConnection::new(tls_config, server_name)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            Ok(rustls::StreamOwned::new(conn, socket))
        })
    }

    fn establish_impl<S, C>(self, connector: C) -> Result<Association>
    where
        S: NetworkStream + 'static,
        C: FnOnce() -> std::io::Result<S> + Send + 'static,
    {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            role_selections,
            extended_negotiations,
            common_extended_negotiations,
            user_identity,
            asynchronous_operations_window,
            protocol_version,
            max_pdu_length,
            strict,
            artim_timeout,
            poll_interval,
            acse_timeout,
            dimse_timeout,
            network_timeout,
            ..
        } = self;

        // proposing no abstract syntaxes would negotiate an unusable
        // association; refuse it before touching the network
        ensure!(!presentation_contexts.is_empty(), MissingAbstractSyntaxSnafu);
        acse::validate_ae_title(&calling_ae_title)?;
        acse::validate_ae_title(&called_ae_title)?;

        let proposed: Vec<_> = presentation_contexts
            .into_iter()
            .enumerate()
            .map(|(i, (abstract_syntax, mut transfer_syntaxes))| {
                if transfer_syntaxes.is_empty() {
                    transfer_syntaxes.push(uids::EXPLICIT_VR_LE.to_string());
                    transfer_syntaxes.push(uids::IMPLICIT_VR_LE.to_string());
                }
                PresentationContextProposed {
                    // presentation context identifiers are odd numbers
                    id: (i as u8) * 2 + 1,
                    abstract_syntax,
                    transfer_syntaxes,
                }
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(max_pdu_length),
            UserVariableItem::ImplementationClassUID(
                crate::IMPLEMENTATION_CLASS_UID.to_string(),
            ),
            UserVariableItem::ImplementationVersionName(
                crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            ),
        ];
        if let Some((invoked, performed)) = asynchronous_operations_window {
            user_variables.push(UserVariableItem::AsynchronousOperationsWindow(
                invoked, performed,
            ));
        }
        user_variables.extend(role_selections.into_iter().map(UserVariableItem::RoleSelection));
        user_variables.extend(
            extended_negotiations
                .into_iter()
                .map(|(uid, data)| UserVariableItem::SopClassExtendedNegotiationSubItem(uid, data)),
        );
        user_variables.extend(
            common_extended_negotiations
                .into_iter()
                .map(UserVariableItem::SopClassCommonExtendedNegotiationSubItem),
        );
        if let Some(user_identity) = user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(user_identity));
        }

        let rq = AssociationRQ {
            protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.trim().to_string(),
            application_context_name: application_context_name.to_string(),
            presentation_contexts: proposed.clone(),
            user_variables,
        };

        let handle = provider::spawn_requestor(
            ProviderOptions {
                mode: Mode::Requestor,
                max_pdu_length,
                strict,
                artim_timeout,
                network_timeout,
                poll_interval,
            },
            connector,
        );

        let ac = acse::request_association(&handle, rq, acse_timeout)?;

        let presentation_contexts =
            acse::combine_contexts(&proposed, &ac.presentation_contexts, &ac.user_variables);

        if !presentation_contexts.iter().any(|pc| pc.is_accepted()) {
            // an association without usable contexts is of no use; abort it
            let _ = handle.send(Primitive::Abort {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::ReasonNotSpecified,
                ),
            });
            return NoAcceptedPresentationContextsSnafu.fail();
        }

        let peer_max_pdu_length =
            acse::max_length(&ac.user_variables).unwrap_or(DEFAULT_MAX_PDU);

        Ok(Association::new(
            handle,
            Mode::Requestor,
            presentation_contexts,
            called_ae_title.trim().to_string(),
            peer_max_pdu_length,
            max_pdu_length,
            ac.user_variables,
            acse_timeout,
            dimse_timeout,
            None,
        ))
    }
}

fn resolve_address<A: ToSocketAddrs>(address: A) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .context(ResolveAddressSnafu)?
        .next()
        .ok_or_else(|| Error::ResolveAddress {
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no socket address resolved",
            ),
        })
}

fn trim_uid_string(uid: String) -> String {
    if uid
        .ends_with(|c: char| c.is_whitespace() || c == '\0')
    {
        uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string()
    } else {
        uid
    }
}
