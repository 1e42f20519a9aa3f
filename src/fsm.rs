//! The upper layer protocol state machine.
//!
//! This module defines the thirteen protocol [states][State],
//! the nineteen [events][Event] which drive them,
//! and the closed [transition table][transition]
//! mapping each (event, state) pair to exactly one [action][Action].
//! The table reproduces PS3.8 Table 9-10 cell for cell.
//!
//! The state machine itself is pure:
//! action side effects (PDU writes, primitive deliveries,
//! timer operations and socket shutdown)
//! are carried out by the [provider][crate::provider].

use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRQ,
    PDataValue,
};

/// A state of the upper layer protocol machine,
/// labelled `Sta1` through `Sta13` as in the standard.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum State {
    /// idle, no transport connection
    Sta1,
    /// transport connection open, awaiting A-ASSOCIATE-RQ PDU
    Sta2,
    /// awaiting local A-ASSOCIATE response primitive
    Sta3,
    /// awaiting transport connection opening to complete
    Sta4,
    /// awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ PDU
    Sta5,
    /// association established and ready for data transfer
    Sta6,
    /// awaiting A-RELEASE-RP PDU
    Sta7,
    /// awaiting local A-RELEASE response primitive
    Sta8,
    /// release collision requestor side: awaiting A-RELEASE response primitive
    Sta9,
    /// release collision acceptor side: awaiting A-RELEASE-RP PDU
    Sta10,
    /// release collision requestor side: awaiting A-RELEASE-RP PDU
    Sta11,
    /// release collision acceptor side: awaiting A-RELEASE response primitive
    Sta12,
    /// awaiting transport connection close; the association no longer exists
    Sta13,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Whether this node requested or accepted the association.
///
/// The distinction only matters for the release collision walk:
/// the association requestor traverses Sta9 and Sta11,
/// the acceptor Sta10 and Sta12.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum Mode {
    Requestor,
    Acceptor,
}

/// An event driving the state machine, with its payload.
///
/// Events originate from three sources:
/// service user primitives, PDUs received from the peer,
/// and transport or timer signals.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `Evt1`: A-ASSOCIATE request primitive from the local user
    AssociateRequest(AssociationRQ),
    /// `Evt2`: transport connection established (requestor side)
    TransportConnected,
    /// `Evt3`: A-ASSOCIATE-AC PDU received
    AssociateAcPdu(AssociationAC),
    /// `Evt4`: A-ASSOCIATE-RJ PDU received
    AssociateRjPdu(AssociationRJ),
    /// `Evt5`: transport connection accepted (acceptor side)
    TransportAccepted,
    /// `Evt6`: A-ASSOCIATE-RQ PDU received
    AssociateRqPdu(AssociationRQ),
    /// `Evt7`: A-ASSOCIATE response primitive (accept) from the local user
    AssociateAccept(AssociationAC),
    /// `Evt8`: A-ASSOCIATE response primitive (reject) from the local user
    AssociateReject(AssociationRJ),
    /// `Evt9`: P-DATA request primitive from the local user
    PDataRequest(Vec<PDataValue>),
    /// `Evt10`: P-DATA-TF PDU received
    PDataPdu(Vec<PDataValue>),
    /// `Evt11`: A-RELEASE request primitive from the local user
    ReleaseRequest,
    /// `Evt12`: A-RELEASE-RQ PDU received
    ReleaseRqPdu,
    /// `Evt13`: A-RELEASE-RP PDU received
    ReleaseRpPdu,
    /// `Evt14`: A-RELEASE response primitive from the local user
    ReleaseResponse,
    /// `Evt15`: A-ABORT request primitive from the local user
    AbortRequest(AbortRQSource),
    /// `Evt16`: A-ABORT PDU received
    AbortPdu(AbortRQSource),
    /// `Evt17`: transport connection closed
    TransportClosed,
    /// `Evt18`: ARTIM timer expired
    ArtimExpired,
    /// `Evt19`: unrecognized or invalid PDU received,
    /// with the provider abort reason to report
    InvalidPdu(AbortRQServiceProviderReason),
}

impl Event {
    /// The event code of this event, without its payload.
    pub fn code(&self) -> EventCode {
        match self {
            Event::AssociateRequest(_) => EventCode::Evt1,
            Event::TransportConnected => EventCode::Evt2,
            Event::AssociateAcPdu(_) => EventCode::Evt3,
            Event::AssociateRjPdu(_) => EventCode::Evt4,
            Event::TransportAccepted => EventCode::Evt5,
            Event::AssociateRqPdu(_) => EventCode::Evt6,
            Event::AssociateAccept(_) => EventCode::Evt7,
            Event::AssociateReject(_) => EventCode::Evt8,
            Event::PDataRequest(_) => EventCode::Evt9,
            Event::PDataPdu(_) => EventCode::Evt10,
            Event::ReleaseRequest => EventCode::Evt11,
            Event::ReleaseRqPdu => EventCode::Evt12,
            Event::ReleaseRpPdu => EventCode::Evt13,
            Event::ReleaseResponse => EventCode::Evt14,
            Event::AbortRequest(_) => EventCode::Evt15,
            Event::AbortPdu(_) => EventCode::Evt16,
            Event::TransportClosed => EventCode::Evt17,
            Event::ArtimExpired => EventCode::Evt18,
            Event::InvalidPdu(_) => EventCode::Evt19,
        }
    }
}

/// The bare code of an [`Event`], `Evt1` through `Evt19`.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum EventCode {
    Evt1,
    Evt2,
    Evt3,
    Evt4,
    Evt5,
    Evt6,
    Evt7,
    Evt8,
    Evt9,
    Evt10,
    Evt11,
    Evt12,
    Evt13,
    Evt14,
    Evt15,
    Evt16,
    Evt17,
    Evt18,
    Evt19,
}

impl std::fmt::Display for EventCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// An action of the state machine,
/// named after its identifier in the standard.
///
/// Association establishment (AE), data transfer (DT),
/// association release (AR) and association abort (AA) actions
/// each combine a fixed set of side effects with one next state;
/// the side effects are documented on each variant
/// and implemented by the provider.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub enum Action {
    /// `AE-1`: issue a transport connect request; next state Sta4
    Ae1,
    /// `AE-2`: send A-ASSOCIATE-RQ PDU; next state Sta5
    Ae2,
    /// `AE-3`: issue A-ASSOCIATE confirmation (accept) primitive; next state Sta6
    Ae3,
    /// `AE-4`: issue A-ASSOCIATE confirmation (reject) primitive
    /// and close the transport connection; next state Sta1
    Ae4,
    /// `AE-5`: issue a transport connect response and start ARTIM; next state Sta2
    Ae5,
    /// `AE-6`: stop ARTIM and issue the A-ASSOCIATE indication primitive;
    /// next state Sta3
    Ae6,
    /// `AE-7`: send A-ASSOCIATE-AC PDU; next state Sta6
    Ae7,
    /// `AE-8`: send A-ASSOCIATE-RJ PDU and start ARTIM; next state Sta13
    Ae8,
    /// `DT-1`: send P-DATA-TF PDU; next state Sta6
    Dt1,
    /// `DT-2`: issue P-DATA indication primitive; next state Sta6
    Dt2,
    /// `AR-1`: send A-RELEASE-RQ PDU; next state Sta7
    Ar1,
    /// `AR-2`: issue A-RELEASE indication primitive; next state Sta8
    Ar2,
    /// `AR-3`: issue A-RELEASE confirmation primitive
    /// and close the transport connection; next state Sta1
    Ar3,
    /// `AR-4`: send A-RELEASE-RP PDU and start ARTIM; next state Sta13
    Ar4,
    /// `AR-5`: stop ARTIM; next state Sta1
    Ar5,
    /// `AR-6`: issue P-DATA indication primitive; next state Sta7
    Ar6,
    /// `AR-7`: send P-DATA-TF PDU; next state Sta8
    Ar7,
    /// `AR-8`: issue A-RELEASE indication primitive (release collision);
    /// next state Sta9 on the requestor side, Sta10 on the acceptor side
    Ar8,
    /// `AR-9`: send A-RELEASE-RP PDU; next state Sta11
    Ar9,
    /// `AR-10`: issue A-RELEASE confirmation primitive; next state Sta12
    Ar10,
    /// `AA-1`: send A-ABORT PDU and restart ARTIM; next state Sta13
    Aa1,
    /// `AA-2`: stop ARTIM and close the transport connection; next state Sta1
    Aa2,
    /// `AA-3`: issue the A-ABORT (or A-P-ABORT) indication primitive
    /// and close the transport connection; next state Sta1
    Aa3,
    /// `AA-4`: issue the A-P-ABORT indication primitive; next state Sta1
    Aa4,
    /// `AA-5`: stop ARTIM; next state Sta1
    Aa5,
    /// `AA-6`: ignore the PDU; next state Sta13
    Aa6,
    /// `AA-7`: send A-ABORT PDU; next state Sta13
    Aa7,
    /// `AA-8`: send A-ABORT PDU (service-provider source),
    /// issue the A-P-ABORT indication primitive and start ARTIM;
    /// next state Sta13
    Aa8,
}

/// Resolve the action for an event arriving in the given state.
///
/// Returns `None` for cells which the standard leaves undefined;
/// the provider treats those as protocol errors.
pub fn transition(state: State, event: EventCode) -> Option<Action> {
    use Action::*;
    use EventCode::*;
    use State::*;

    let action = match (event, state) {
        (Evt1, Sta1) => Ae1,

        (Evt2, Sta4) => Ae2,

        (Evt3, Sta2) => Aa1,
        (Evt3, Sta5) => Ae3,
        (Evt3, Sta3 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Aa8,
        (Evt3, Sta13) => Aa6,

        (Evt4, Sta2) => Aa1,
        (Evt4, Sta5) => Ae4,
        (Evt4, Sta3 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Aa8,
        (Evt4, Sta13) => Aa6,

        (Evt5, Sta1) => Ae5,

        (Evt6, Sta2) => Ae6,
        (Evt6, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Aa8,
        (Evt6, Sta13) => Aa7,

        (Evt7, Sta3) => Ae7,

        (Evt8, Sta3) => Ae8,

        (Evt9, Sta6) => Dt1,
        (Evt9, Sta8) => Ar7,

        (Evt10, Sta2) => Aa1,
        (Evt10, Sta6) => Dt2,
        (Evt10, Sta7) => Ar6,
        (Evt10, Sta3 | Sta5 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Aa8,
        (Evt10, Sta13) => Aa6,

        (Evt11, Sta6) => Ar1,

        (Evt12, Sta2) => Aa1,
        (Evt12, Sta6) => Ar2,
        (Evt12, Sta7) => Ar8,
        (Evt12, Sta3 | Sta5 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Aa8,
        (Evt12, Sta13) => Aa6,

        (Evt13, Sta2) => Aa1,
        (Evt13, Sta7 | Sta11) => Ar3,
        (Evt13, Sta10) => Ar10,
        (Evt13, Sta3 | Sta5 | Sta6 | Sta8 | Sta9 | Sta12) => Aa8,
        (Evt13, Sta13) => Aa6,

        (Evt14, Sta8 | Sta12) => Ar4,
        (Evt14, Sta9) => Ar9,

        (Evt15, Sta4) => Aa2,
        (Evt15, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Aa1,

        (Evt16, Sta2 | Sta13) => Aa2,
        (Evt16, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Aa3,

        (Evt17, Sta2) => Aa5,
        (
            Evt17,
            Sta3 | Sta4 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
        ) => Aa4,
        (Evt17, Sta13) => Ar5,

        (Evt18, Sta2 | Sta13) => Aa2,

        (Evt19, Sta2) => Aa1,
        (Evt19, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => Aa8,
        (Evt19, Sta13) => Aa7,

        _ => return None,
    };

    Some(action)
}

impl Action {
    /// The next state after this action completes.
    ///
    /// `AR-8` branches on the association mode;
    /// every other action has a fixed successor.
    pub fn next_state(self, mode: Mode) -> State {
        match self {
            Action::Ae1 => State::Sta4,
            Action::Ae2 => State::Sta5,
            Action::Ae3 => State::Sta6,
            Action::Ae4 => State::Sta1,
            Action::Ae5 => State::Sta2,
            Action::Ae6 => State::Sta3,
            Action::Ae7 => State::Sta6,
            Action::Ae8 => State::Sta13,
            Action::Dt1 => State::Sta6,
            Action::Dt2 => State::Sta6,
            Action::Ar1 => State::Sta7,
            Action::Ar2 => State::Sta8,
            Action::Ar3 => State::Sta1,
            Action::Ar4 => State::Sta13,
            Action::Ar5 => State::Sta1,
            Action::Ar6 => State::Sta7,
            Action::Ar7 => State::Sta8,
            Action::Ar8 => match mode {
                Mode::Requestor => State::Sta9,
                Mode::Acceptor => State::Sta10,
            },
            Action::Ar9 => State::Sta11,
            Action::Ar10 => State::Sta12,
            Action::Aa1 => State::Sta13,
            Action::Aa2 => State::Sta1,
            Action::Aa3 => State::Sta1,
            Action::Aa4 => State::Sta1,
            Action::Aa5 => State::Sta1,
            Action::Aa6 => State::Sta13,
            Action::Aa7 => State::Sta13,
            Action::Aa8 => State::Sta13,
        }
    }
}
