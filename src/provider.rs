//! The upper layer service provider.
//!
//! The provider runs one worker thread per association.
//! The worker owns the transport stream, the event queue,
//! the ARTIM and network idle timers, and the state machine;
//! the service user talks to it exclusively through primitive queues.
//! Incoming PDUs, outbound primitives and timer expiries are classified
//! into [events][Event] and drained one at a time into the machine.

use std::collections::VecDeque;
use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use snafu::{ResultExt, Snafu};
use tracing::{debug, trace, warn};

use crate::fsm::{transition, Action, Event, Mode, State};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRQ, Pdu,
    MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
use crate::primitive::Primitive;
use crate::timer::Timer;

/// The default interval between polls of the event sources.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The default ARTIM (association request/release timer) timeout.
pub const DEFAULT_ARTIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations required of a transport stream
/// for it to carry an association.
///
/// Implemented for plain TCP streams
/// and, with the `sync-tls` feature, for TLS wrapped TCP streams.
pub trait NetworkStream: Read + Write + Send {
    /// Set the timeout for blocking reads on this stream.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Shut down the stream in both directions.
    fn close(&mut self) -> std::io::Result<()>;
}

impl NetworkStream for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }
}

#[cfg(feature = "sync-tls")]
impl NetworkStream for rustls::StreamOwned<rustls::ClientConnection, TcpStream> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.conn.send_close_notify();
        let _ = self.flush();
        self.sock.shutdown(std::net::Shutdown::Both)
    }
}

#[cfg(feature = "sync-tls")]
impl NetworkStream for rustls::StreamOwned<rustls::ServerConnection, TcpStream> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.conn.send_close_notify();
        let _ = self.flush();
        self.sock.shutdown(std::net::Shutdown::Both)
    }
}

/// Configuration of one service provider instance.
#[derive(Debug, Clone)]
pub(crate) struct ProviderOptions {
    /// whether this node requests or accepts the association
    pub mode: Mode,
    /// the maximum PDU length this node is willing to receive
    pub max_pdu_length: u32,
    /// whether to reject PDUs longer than the advertised maximum
    pub strict: bool,
    /// the ARTIM timeout
    pub artim_timeout: Duration,
    /// the maximum idle time between two PDUs on an established association
    pub network_timeout: Option<Duration>,
    /// the interval between polls of the event sources
    pub poll_interval: Duration,
}

/// The service user's handle to a running provider.
///
/// Dropping the handle eventually brings the worker down:
/// once its primitive queue disconnects,
/// the worker aborts whatever is left of the association.
#[derive(Debug)]
pub(crate) struct ProviderHandle {
    to_provider: Sender<Primitive>,
    from_provider: Receiver<Primitive>,
    state: Arc<Mutex<State>>,
}

impl ProviderHandle {
    /// Hand a primitive to the provider.
    ///
    /// Fails when the worker has already terminated.
    pub fn send(&self, primitive: Primitive) -> Result<(), Error> {
        self.to_provider
            .send(primitive)
            .map_err(|_| ProviderGoneSnafu.build())
    }

    /// Take the next primitive from the provider,
    /// waiting at most `timeout` (or indefinitely if `None`).
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Primitive, Error> {
        match timeout {
            Some(timeout) => match self.from_provider.recv_timeout(timeout) {
                Ok(primitive) => Ok(primitive),
                Err(RecvTimeoutError::Timeout) => TimedOutSnafu.fail(),
                Err(RecvTimeoutError::Disconnected) => ProviderGoneSnafu.fail(),
            },
            None => self
                .from_provider
                .recv()
                .map_err(|_| ProviderGoneSnafu.build()),
        }
    }

    /// Observe the current state of the protocol machine.
    pub fn machine_state(&self) -> State {
        self.state.lock().map(|state| *state).unwrap_or(State::Sta1)
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub(crate) enum Error {
    /// the provider worker has terminated
    ProviderGone,

    /// timed out waiting for a primitive from the provider
    TimedOut,
}

/// Spawn a provider for the requestor side of an association.
///
/// The transport connection is only opened
/// once the A-ASSOCIATE request primitive arrives (action AE-1),
/// by invoking the given connector.
pub(crate) fn spawn_requestor<S, C>(options: ProviderOptions, connector: C) -> ProviderHandle
where
    S: NetworkStream + 'static,
    C: FnOnce() -> std::io::Result<S> + Send + 'static,
{
    spawn(options, None, Some(Box::new(connector)), VecDeque::new())
}

/// Spawn a provider for the acceptor side of an association,
/// over an already accepted transport stream.
pub(crate) fn spawn_acceptor<S>(options: ProviderOptions, socket: S) -> ProviderHandle
where
    S: NetworkStream + 'static,
{
    let mut events = VecDeque::new();
    events.push_back(Event::TransportAccepted);
    spawn(options, Some(socket), None, events)
}

type Connector<S> = Box<dyn FnOnce() -> std::io::Result<S> + Send>;

fn spawn<S>(
    options: ProviderOptions,
    mut socket: Option<S>,
    connector: Option<Connector<S>>,
    events: VecDeque<Event>,
) -> ProviderHandle
where
    S: NetworkStream + 'static,
{
    let (to_provider, from_user) = std::sync::mpsc::channel();
    let (to_user, from_provider) = std::sync::mpsc::channel();
    let state = Arc::new(Mutex::new(State::Sta1));

    if let Some(socket) = socket.as_mut() {
        // a failed timeout setup degrades polling, nothing more
        if let Err(e) = socket.set_read_timeout(Some(options.poll_interval)) {
            warn!("could not set read timeout on socket: {}", e);
        }
    }

    let worker = Worker {
        mode: options.mode,
        max_pdu_length: options.max_pdu_length,
        strict: options.strict,
        poll_interval: options.poll_interval,
        socket,
        connector,
        events,
        from_user,
        to_user,
        artim: Timer::new(Some(options.artim_timeout)),
        idle: Timer::new(options.network_timeout),
        state: State::Sta1,
        shared_state: Arc::clone(&state),
        read_buffer: BytesMut::with_capacity(
            (options.max_pdu_length.min(MAXIMUM_PDU_SIZE) + PDU_HEADER_SIZE) as usize,
        ),
        write_buffer: Vec::new(),
        association_rq: None,
        started: false,
        user_gone: false,
    };

    std::thread::spawn(move || worker.run());

    ProviderHandle {
        to_provider,
        from_provider,
        state,
    }
}

#[derive(Debug, Snafu)]
enum ActionError {
    /// no transport connection to write to
    NoSocket,

    /// failed to encode PDU
    Encode {
        #[snafu(source(from(crate::pdu::writer::Error, Box::from)))]
        source: Box<crate::pdu::writer::Error>,
    },

    /// failed to write PDU to the transport
    WriteWire { source: std::io::Error },
}

struct Worker<S> {
    mode: Mode,
    max_pdu_length: u32,
    strict: bool,
    poll_interval: Duration,
    socket: Option<S>,
    connector: Option<Connector<S>>,
    events: VecDeque<Event>,
    from_user: Receiver<Primitive>,
    to_user: Sender<Primitive>,
    artim: Timer,
    idle: Timer,
    state: State,
    shared_state: Arc<Mutex<State>>,
    read_buffer: BytesMut,
    write_buffer: Vec<u8>,
    /// the pending association request parameters,
    /// kept between actions AE-1 and AE-2
    association_rq: Option<AssociationRQ>,
    /// whether the machine has left the idle state at least once
    started: bool,
    /// whether the user side of the primitive queues is gone
    user_gone: bool,
}

impl<S> Worker<S>
where
    S: NetworkStream,
{
    fn run(mut self) {
        let span = tracing::debug_span!("dul", mode = ?self.mode);
        let _enter = span.enter();
        debug!("provider loop started");
        loop {
            if self.events.is_empty() {
                self.poll_sources();
            }

            let event = match self.events.pop_front() {
                Some(event) => event,
                None => {
                    if self.user_gone && !self.started {
                        // never used; nothing to wind down
                        break;
                    }
                    continue;
                }
            };

            let code = event.code();
            match transition(self.state, code) {
                Some(action) => {
                    trace!("{} in {}: performing {:?}", code, self.state, action);
                    // commit the successor state before the side effects,
                    // so that primitives delivered by the action are
                    // observed together with the state they produced
                    self.set_state(action.next_state(self.mode));
                    if let Err(e) = self.perform(action, event) {
                        warn!("action {:?} failed: {}", action, e);
                        self.fail_terminally();
                    }
                }
                None if is_user_event(code) => {
                    // a primitive the current state cannot take;
                    // the user layer resolves the situation from the
                    // indications it has already been given
                    warn!("discarding {} with no transition from {}", code, self.state);
                }
                None => {
                    warn!("no transition for {} in state {}", code, self.state);
                    self.fail_terminally();
                }
            }

            if self.started && self.state == State::Sta1 {
                break;
            }
            if self.state != State::Sta1 {
                self.started = true;
            }
        }
        debug!("provider loop ended");
    }

    /// Check the event sources:
    /// the network, the user primitive queue, then the timers.
    ///
    /// Primitives already submitted by the user are queued ahead of a
    /// PDU taken off the wire in the same poll. A release request
    /// crossing paths with the peer's release request must reach the
    /// machine first, so that the exchange resolves as a release
    /// collision rather than as an unexpected PDU.
    fn poll_sources(&mut self) {
        if self.socket.is_some() {
            let network_event = self.check_network();
            self.drain_user_primitives();
            if let Some(event) = network_event {
                self.events.push_back(event);
            }
            if !self.events.is_empty() {
                return;
            }
        } else {
            // no transport connection yet:
            // the user primitive queue is the only live source
            match self.from_user.recv_timeout(self.poll_interval) {
                Ok(primitive) => {
                    self.events.push_back(primitive_to_event(primitive));
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.on_user_gone(),
            }
        }

        if self.artim.expired() {
            debug!("ARTIM timer expired in state {}", self.state);
            self.artim.stop();
            self.events.push_back(Event::ArtimExpired);
            return;
        }

        if self.state == State::Sta6 && self.idle.expired() {
            debug!("association idle for too long, aborting");
            self.idle.stop();
            let reason = AbortRQServiceProviderReason::ReasonNotSpecified;
            self.deliver(Primitive::ProviderAbort { reason });
            self.events
                .push_back(Event::AbortRequest(AbortRQSource::ServiceProvider(reason)));
        }
    }

    /// Move every pending user primitive into the event queue.
    fn drain_user_primitives(&mut self) {
        loop {
            match self.from_user.try_recv() {
                Ok(primitive) => {
                    self.events.push_back(primitive_to_event(primitive));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.on_user_gone();
                    break;
                }
            }
        }
    }

    fn on_user_gone(&mut self) {
        if self.user_gone {
            return;
        }
        self.user_gone = true;
        if self.started && !matches!(self.state, State::Sta1 | State::Sta13) {
            debug!("user handle dropped, aborting association");
            self.events
                .push_back(Event::AbortRequest(AbortRQSource::ServiceUser));
        }
    }

    /// Poll the socket for incoming bytes and
    /// extract the next complete PDU, if any.
    fn check_network(&mut self) -> Option<Event> {
        // a PDU may already be sitting in the buffer from an earlier read
        if let Some(event) = self.extract_pdu() {
            return Some(event);
        }

        let socket = self.socket.as_mut()?;
        let mut chunk = [0u8; 8192];
        match socket.read(&mut chunk) {
            Ok(0) => {
                // remote closed the connection
                self.drop_socket();
                return Some(Event::TransportClosed);
            }
            Ok(n) => {
                self.read_buffer.extend_from_slice(&chunk[..n]);
                self.idle.restart();
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                // nothing arrived within the poll interval
                return None;
            }
            Err(e) => {
                debug!("transport read failed: {}", e);
                self.drop_socket();
                return Some(Event::TransportClosed);
            }
        }

        self.extract_pdu()
    }

    /// Take one complete PDU out of the read buffer and classify it.
    ///
    /// A partially received PDU stays buffered until the rest arrives;
    /// the read is all-or-nothing from the machine's point of view.
    fn extract_pdu(&mut self) -> Option<Event> {
        if self.read_buffer.len() < PDU_HEADER_SIZE as usize {
            return None;
        }

        let pdu_length = u32::from_be_bytes([
            self.read_buffer[2],
            self.read_buffer[3],
            self.read_buffer[4],
            self.read_buffer[5],
        ]);
        if pdu_length > MAXIMUM_PDU_SIZE {
            warn!("peer declared an impossible PDU length {}", pdu_length);
            self.read_buffer.clear();
            return Some(Event::InvalidPdu(
                AbortRQServiceProviderReason::InvalidPduParameter,
            ));
        }

        let total = PDU_HEADER_SIZE as usize + pdu_length as usize;
        if self.read_buffer.len() < total {
            return None;
        }

        let bytes = self.read_buffer.split_to(total);
        let mut cursor = Cursor::new(&bytes[..]);
        // the codec requires a receive maximum within the standard bounds
        let max_pdu_length = self.max_pdu_length.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE);
        match read_pdu(&mut cursor, max_pdu_length, self.strict) {
            Ok(Some(pdu)) => {
                trace!("received {}", pdu.short_description());
                Some(pdu_to_event(pdu))
            }
            // a whole PDU was buffered, so a clean EOF cannot happen here
            Ok(None) => None,
            Err(e) => {
                warn!("could not decode incoming PDU: {}", e);
                Some(Event::InvalidPdu(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                ))
            }
        }
    }

    /// Carry out the side effects of an action.
    fn perform(&mut self, action: Action, event: Event) -> Result<(), ActionError> {
        match (action, event) {
            // association establishment
            (Action::Ae1, Event::AssociateRequest(rq)) => {
                self.association_rq = Some(rq);
                match self.connector.take() {
                    Some(connect) => match connect() {
                        Ok(mut socket) => {
                            if let Err(e) = socket.set_read_timeout(Some(self.poll_interval)) {
                                warn!("could not set read timeout on socket: {}", e);
                            }
                            self.socket = Some(socket);
                            self.events.push_back(Event::TransportConnected);
                        }
                        Err(e) => {
                            debug!("could not connect to peer: {}", e);
                            self.events.push_back(Event::TransportClosed);
                        }
                    },
                    None => {
                        self.events.push_back(Event::TransportClosed);
                    }
                }
                Ok(())
            }
            (Action::Ae2, _) => {
                let rq = self.association_rq.take().ok_or(ActionError::NoSocket)?;
                self.send_pdu(&Pdu::AssociationRQ(rq))
            }
            (Action::Ae3, Event::AssociateAcPdu(ac)) => {
                self.deliver(Primitive::AssociateAc(ac));
                Ok(())
            }
            (Action::Ae4, Event::AssociateRjPdu(rj)) => {
                self.deliver(Primitive::AssociateRj(rj));
                self.close_socket();
                Ok(())
            }
            (Action::Ae5, _) => {
                self.artim.start();
                Ok(())
            }
            (Action::Ae6, Event::AssociateRqPdu(rq)) => {
                self.artim.stop();
                self.deliver(Primitive::AssociateRq(rq));
                Ok(())
            }
            (Action::Ae7, Event::AssociateAccept(ac)) => self.send_pdu(&Pdu::AssociationAC(ac)),
            (Action::Ae8, Event::AssociateReject(rj)) => {
                self.send_pdu(&Pdu::AssociationRJ(rj))?;
                self.artim.start();
                Ok(())
            }

            // data transfer
            (Action::Dt1, Event::PDataRequest(data))
            | (Action::Ar7, Event::PDataRequest(data)) => self.send_pdu(&Pdu::PData { data }),
            (Action::Dt2, Event::PDataPdu(data)) | (Action::Ar6, Event::PDataPdu(data)) => {
                self.deliver(Primitive::PData { data });
                Ok(())
            }

            // association release
            (Action::Ar1, _) => self.send_pdu(&Pdu::ReleaseRQ),
            (Action::Ar2, _) | (Action::Ar8, _) => {
                self.deliver(Primitive::ReleaseRq);
                Ok(())
            }
            (Action::Ar3, _) => {
                self.deliver(Primitive::ReleaseRp);
                self.close_socket();
                Ok(())
            }
            (Action::Ar4, _) => {
                self.send_pdu(&Pdu::ReleaseRP)?;
                self.artim.start();
                Ok(())
            }
            (Action::Ar5, _) => {
                self.artim.stop();
                Ok(())
            }
            (Action::Ar9, _) => self.send_pdu(&Pdu::ReleaseRP),
            (Action::Ar10, _) => {
                self.deliver(Primitive::ReleaseRp);
                Ok(())
            }

            // association abort
            (Action::Aa1, event) => {
                let source = match event {
                    Event::AbortRequest(source) => source,
                    _ => AbortRQSource::ServiceUser,
                };
                self.send_pdu(&Pdu::AbortRQ { source })?;
                self.artim.restart();
                Ok(())
            }
            (Action::Aa2, _) => {
                self.artim.stop();
                self.close_socket();
                Ok(())
            }
            (Action::Aa3, Event::AbortPdu(source)) => {
                self.deliver(Primitive::Abort { source });
                self.close_socket();
                Ok(())
            }
            (Action::Aa4, _) => {
                self.deliver(Primitive::ProviderAbort {
                    reason: AbortRQServiceProviderReason::ReasonNotSpecified,
                });
                self.close_socket();
                Ok(())
            }
            (Action::Aa5, _) => {
                self.artim.stop();
                Ok(())
            }
            (Action::Aa6, _) => {
                // swallow the stray PDU while waiting for the close
                Ok(())
            }
            (Action::Aa7, event) => {
                let reason = match event {
                    Event::InvalidPdu(reason) => reason,
                    _ => AbortRQServiceProviderReason::UnexpectedPdu,
                };
                self.send_pdu(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(reason),
                })
            }
            (Action::Aa8, event) => {
                let reason = match event {
                    Event::InvalidPdu(reason) => reason,
                    _ => AbortRQServiceProviderReason::UnexpectedPdu,
                };
                self.send_pdu(&Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(reason),
                })?;
                self.deliver(Primitive::ProviderAbort { reason });
                self.artim.start();
                Ok(())
            }

            (action, event) => {
                // the transition table pairs every action
                // with a matching event payload
                warn!(
                    "event {} does not carry a payload for action {:?}",
                    event.code(),
                    action
                );
                Ok(())
            }
        }
    }

    fn send_pdu(&mut self, pdu: &Pdu) -> Result<(), ActionError> {
        if self.socket.is_none() {
            return Err(ActionError::NoSocket);
        }
        self.write_buffer.clear();
        write_pdu(&mut self.write_buffer, pdu).context(EncodeSnafu)?;
        trace!("sending {}", pdu.short_description());

        let socket = self.socket.as_mut().ok_or(ActionError::NoSocket)?;
        socket.write_all(&self.write_buffer).context(WriteWireSnafu)?;
        socket.flush().context(WriteWireSnafu)?;
        self.idle.restart();
        Ok(())
    }

    fn deliver(&mut self, primitive: Primitive) {
        trace!("delivering {} to user", primitive.short_description());
        if self.to_user.send(primitive).is_err() {
            self.user_gone = true;
        }
    }

    fn close_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close();
        }
        self.read_buffer.clear();
    }

    fn drop_socket(&mut self) {
        self.socket = None;
        self.read_buffer.clear();
    }

    fn set_state(&mut self, state: State) {
        if state != self.state {
            trace!("state {} -> {}", self.state, state);
        }
        // the idle watchdog runs while data transfer is allowed
        if state == State::Sta6 && !self.idle.is_running() {
            self.idle.start();
        }
        self.state = state;
        if let Ok(mut shared) = self.shared_state.lock() {
            *shared = state;
        }
    }

    /// Drive the association to its terminal state after a failed action:
    /// stop the timers, tell the user, close the transport.
    fn fail_terminally(&mut self) {
        self.artim.stop();
        self.idle.stop();
        self.deliver(Primitive::ProviderAbort {
            reason: AbortRQServiceProviderReason::ReasonNotSpecified,
        });
        self.close_socket();
        self.set_state(State::Sta1);
        self.started = true;
    }
}

/// Whether the event originates from a local service user primitive.
fn is_user_event(code: crate::fsm::EventCode) -> bool {
    use crate::fsm::EventCode::*;
    matches!(code, Evt1 | Evt7 | Evt8 | Evt9 | Evt11 | Evt14 | Evt15)
}

/// Classify an outbound primitive into its state machine event.
fn primitive_to_event(primitive: Primitive) -> Event {
    match primitive {
        Primitive::AssociateRq(rq) => Event::AssociateRequest(rq),
        Primitive::AssociateAc(ac) => Event::AssociateAccept(ac),
        Primitive::AssociateRj(rj) => Event::AssociateReject(rj),
        Primitive::ReleaseRq => Event::ReleaseRequest,
        Primitive::ReleaseRp => Event::ReleaseResponse,
        Primitive::Abort { source } => Event::AbortRequest(source),
        Primitive::ProviderAbort { reason } => {
            Event::AbortRequest(AbortRQSource::ServiceProvider(reason))
        }
        Primitive::PData { data } => Event::PDataRequest(data),
    }
}

/// Classify an incoming PDU into its state machine event.
fn pdu_to_event(pdu: Pdu) -> Event {
    match pdu {
        Pdu::AssociationRQ(rq) => Event::AssociateRqPdu(rq),
        Pdu::AssociationAC(ac) => Event::AssociateAcPdu(ac),
        Pdu::AssociationRJ(rj) => Event::AssociateRjPdu(rj),
        Pdu::PData { data } => Event::PDataPdu(data),
        Pdu::ReleaseRQ => Event::ReleaseRqPdu,
        Pdu::ReleaseRP => Event::ReleaseRpPdu,
        Pdu::AbortRQ { source } => Event::AbortPdu(source),
        Pdu::Unknown { pdu_type, .. } => {
            warn!("received PDU of unknown type {:#04x}", pdu_type);
            Event::InvalidPdu(AbortRQServiceProviderReason::UnrecognizedPdu)
        }
    }
}
