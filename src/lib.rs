//! This crate contains a full implementation of the DICOM upper layer
//! protocol, enabling a process to exchange DIMSE messages with other
//! DICOM nodes over TCP as an association requestor, an acceptor, or both.
//!
//! Each association is driven by the protocol state machine of the standard
//! (13 states, 19 events), hosted on a dedicated worker thread which owns
//! the transport connection, the protocol timers and the PDU codec.
//! Application code works at the level of service primitives and whole
//! DIMSE messages instead.
//!
//! - The [`association`] module
//!   comprises the abstractions for establishing, using and ending
//!   associations between application entities:
//!   start with [`ClientAssociationOptions`] or [`ServerAssociationOptions`].
//! - The [`dimse`] module
//!   assembles and fragments DIMSE messages
//!   and builds and interprets command sets.
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   and their bit-exact reader and writer.
//! - The [`fsm`], [`provider`] and [`acse`] modules
//!   hold the state machine, its hosting service provider,
//!   and the association control services;
//!   most applications never use them directly.
//! - The [`address`] module
//!   provides an abstraction for compound addresses
//!   referring to application entities in a network.
//!
//! ## Example: verification as a service class user
//!
//! ```no_run
//! use dicom_dul::association::ClientAssociationOptions;
//! use dicom_dul::dimse::commands::{self, CEchoRq, Command};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut association = ClientAssociationOptions::new()
//!     .calling_ae_title("ECHO-SCU")
//!     .called_ae_title("MAIN-STORAGE")
//!     .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2"])
//!     .establish("192.168.0.5:104")?;
//!
//! let pc_id = association
//!     .accepted_presentation_contexts()
//!     .next()
//!     .expect("no presentation context accepted")
//!     .id;
//!
//! let command = CEchoRq { message_id: 1 }.encode(false)?;
//! association.send_message(pc_id, &command, None)?;
//!
//! let response = association.receive_message()?;
//! let command_set = commands::read_command_set(&response.command)?;
//! assert_eq!(commands::status(&command_set), Some(0x0000));
//!
//! association.release()?;
//! # Ok(())
//! # }
//! ```

pub mod acse;
pub mod address;
pub mod association;
pub mod dimse;
pub mod fsm;
pub mod pdu;
pub mod primitive;
pub mod provider;
pub mod timer;
pub mod uids;

/// The implementation class UID generically referring to this crate.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// This UID may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.130984950029899771041107395941696634962";

/// The implementation version name generically referring to this crate.
///
/// This name may change in future versions,
/// even between patch versions.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-DUL 0.1.0";

// re-exports

pub use address::FullAeAddr;
pub use association::client::ClientAssociationOptions;
pub use association::server::ServerAssociationOptions;
pub use association::{Association, AssociationState};
pub use dimse::DimseMessage;
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
