use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use dicom_dul::association::{
    Association, AssociationState, ClientAssociationOptions, Error, ServerAssociationOptions,
};
use dicom_dul::dimse::commands::{self, CEchoRq, CEchoRsp, CStoreRq, Command, CommandField,
    Priority};
use dicom_dul::fsm::State;
use dicom_dul::pdu::{
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static SC_IMAGE_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";

// keep the tests snappy; the default poll interval is tuned for servers
const POLL: Duration = Duration::from_millis(5);
const WAIT: Duration = Duration::from_secs(10);

fn scp_options() -> ServerAssociationOptions<'static, dicom_dul::association::AcceptAny> {
    ServerAssociationOptions::new()
        .ae_title(SCP_AE_TITLE)
        .poll_interval(POLL)
        .acse_timeout(Some(WAIT))
        .dimse_timeout(Some(WAIT))
}

fn scu_options() -> ClientAssociationOptions {
    ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
        .poll_interval(POLL)
        .acse_timeout(Some(WAIT))
        .dimse_timeout(Some(WAIT))
}

/// wait until the association's protocol machine returns to idle
fn wait_for_idle(association: &Association) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if association.machine_state() == State::Sta1 {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Negotiate a verification association, run one C-ECHO exchange
/// over it and release gracefully.
#[test]
fn verification_round_trip() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    let scp = scp_options()
        .accept_called_ae_title()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let scp_handle = thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        assert_eq!(association.peer_ae_title(), SCU_AE_TITLE);
        assert_eq!(association.state(), AssociationState::Established);

        let message = association.receive_message()?;
        let command_set = commands::read_command_set(&message.command)?;
        assert_eq!(
            commands::command_field(&command_set),
            Some(CommandField::C_ECHO_RQ as u16)
        );
        assert_eq!(commands::message_id(&command_set), Some(1));
        assert!(message.dataset.is_none());

        let response = CEchoRsp {
            message_id_being_responded_to: 1,
            status: 0x0000,
        }
        .encode(false)?;
        association.send_message(message.presentation_context_id, &response, None)?;

        // the peer ends the association
        match association.receive_message() {
            Err(Error::PeerReleased) => {}
            other => panic!("expected a peer release, got {:?}", other),
        }
        assert_eq!(association.state(), AssociationState::Released);
        Ok(())
    });

    let mut association = scu_options()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    let pc = association
        .accepted_presentation_contexts()
        .next()
        .expect("one accepted presentation context")
        .clone();
    assert_eq!(pc.id, 1);
    assert_eq!(pc.transfer_syntax, IMPLICIT_VR_LE);
    // role defaults apply: this node is the SCU of the context
    assert!(pc.scu());
    assert!(!pc.scp());

    let command = CEchoRq { message_id: 1 }.encode(false).unwrap();
    association.send_message(pc.id, &command, None).unwrap();

    let response = association.receive_message().unwrap();
    assert_eq!(response.presentation_context_id, pc.id);
    let command_set = commands::read_command_set(&response.command).unwrap();
    assert_eq!(
        commands::command_field(&command_set),
        Some(CommandField::C_ECHO_RSP as u16)
    );
    assert_eq!(commands::message_id_being_responded_to(&command_set), Some(1));
    assert_eq!(commands::status(&command_set), Some(0x0000));

    association.release().unwrap();
    assert_eq!(association.state(), AssociationState::Released);
    assert!(wait_for_idle(&association));

    // terminal state: no further messaging is possible
    match association.send_message(pc.id, &command, None) {
        Err(Error::Terminated) => {}
        other => panic!("expected Terminated, got {:?}", other),
    }

    scp_handle.join().unwrap().unwrap();
}

/// An unsupported abstract syntax is refused per context
/// while the rest of the association proceeds.
#[test]
fn unsupported_abstract_syntax_is_refused() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    let scp = scp_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let scp_handle = thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        let refused: Vec<_> = association
            .rejected_presentation_contexts()
            .map(|pc| pc.id)
            .collect();
        assert_eq!(refused, vec![1]);

        match association.receive_message() {
            Err(Error::PeerReleased) => {}
            other => panic!("expected a peer release, got {:?}", other),
        }
        Ok(())
    });

    let mut association = scu_options()
        .with_presentation_context("1.2.3.4", vec![IMPLICIT_VR_LE])
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    {
        let contexts = association.presentation_contexts();
        assert_eq!(contexts.len(), 2);
        let refused = contexts.iter().find(|pc| pc.id == 1).unwrap();
        assert!(!refused.is_accepted());
        assert_eq!(refused.abstract_syntax, "1.2.3.4");
        let accepted = contexts.iter().find(|pc| pc.id == 3).unwrap();
        assert!(accepted.is_accepted());
        assert_eq!(accepted.transfer_syntax, IMPLICIT_VR_LE);
    }

    // messaging on the refused context must fail locally
    let command = CEchoRq { message_id: 1 }.encode(false).unwrap();
    match association.send_message(1, &command, None) {
        Err(Error::NoSuchPresentationContext { id: 1 }) => {}
        other => panic!("expected NoSuchPresentationContext, got {:?}", other),
    }

    association.release().unwrap();
    scp_handle.join().unwrap().unwrap();
}

/// A calling AE title outside the allowlist is rejected
/// with a permanent service-user rejection.
#[test]
fn rejection_on_calling_ae_title() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    let scp = scp_options()
        .require_calling_ae_title("EXPECTED")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let scp_handle = thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        scp.establish(stream)
    });

    let outcome = scu_options()
        .calling_ae_title("OTHER")
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(scp_addr);

    match outcome {
        Err(Error::Rejected { association_rj }) => {
            assert_eq!(association_rj.result, AssociationRJResult::Permanent);
            assert_eq!(
                association_rj.source,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized
                )
            );
        }
        other => panic!("expected a rejection, got {:?}", other.map(|_| ())),
    }

    match scp_handle.join().unwrap() {
        Err(Error::Rejected { association_rj }) => {
            assert_eq!(association_rj.result, AssociationRJResult::Permanent);
        }
        other => panic!("expected a rejection, got {:?}", other.map(|_| ())),
    }
}

/// Both sides request release at the same time;
/// the collision resolves and both sockets close.
#[test]
fn release_collision_resolves_on_both_sides() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    let scp = scp_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let barrier = Arc::new(Barrier::new(2));
    let scp_barrier = Arc::clone(&barrier);

    let scp_handle = thread::spawn(move || -> Result<Association> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        scp_barrier.wait();
        association.release()?;
        Ok(association)
    });

    let mut association = scu_options()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    barrier.wait();
    association.release().unwrap();
    assert_eq!(association.state(), AssociationState::Released);

    let scp_association = scp_handle.join().unwrap().unwrap();
    assert_eq!(scp_association.state(), AssociationState::Released);

    // both machines return to idle and the sockets close
    assert!(wait_for_idle(&association));
    assert!(wait_for_idle(&scp_association));
}

/// A data set larger than the negotiated maximum PDU length
/// is fragmented on the wire and reassembled on receipt.
#[test]
fn fragmented_data_set_reassembles() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    // the acceptor only admits small PDUs
    let scp = scp_options()
        .max_pdu_length(4096)
        .with_abstract_syntax(SC_IMAGE_STORAGE_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let dataset: Vec<u8> = (0..10_000u32).map(|x| (x % 251) as u8).collect();
    let expected = dataset.clone();

    let scp_handle = thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        let message = association.receive_message()?;
        let command_set = commands::read_command_set(&message.command)?;
        assert_eq!(
            commands::command_field(&command_set),
            Some(CommandField::C_STORE_RQ as u16)
        );
        assert!(commands::has_data_set(&command_set));
        assert_eq!(message.dataset.as_deref(), Some(&expected[..]));

        match association.receive_message() {
            Err(Error::PeerReleased) => {}
            other => panic!("expected a peer release, got {:?}", other),
        }
        Ok(())
    });

    let mut association = scu_options()
        .with_presentation_context(SC_IMAGE_STORAGE_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    // the acceptor advertised its receive maximum
    assert_eq!(association.peer_max_pdu_length(), 4096);

    let pc_id = association
        .accepted_presentation_contexts()
        .next()
        .unwrap()
        .id;
    let command = CStoreRq {
        message_id: 7,
        affected_sop_class_uid: SC_IMAGE_STORAGE_SOP_CLASS,
        affected_sop_instance_uid: "2.25.418",
        priority: Priority::Medium,
        move_originator_ae_title: None,
        move_originator_message_id: None,
    }
    .encode(true)
    .unwrap();

    association
        .send_message(pc_id, &command, Some(&dataset))
        .unwrap();

    association.release().unwrap();
    scp_handle.join().unwrap().unwrap();
}

/// A peer which connects but never sends an association request
/// is silently disconnected when the ARTIM timer expires.
#[test]
fn artim_expiry_on_silent_peer() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    let scp = scp_options()
        .artim_timeout(Duration::from_millis(300))
        .acse_timeout(None)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS);

    let scp_handle = thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        scp.establish(stream)
    });

    // connect and stay silent
    let mut stream = TcpStream::connect(scp_addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // the acceptor must close without transmitting anything
    let mut buffer = [0u8; 64];
    let read = stream.read(&mut buffer).unwrap();
    assert_eq!(read, 0, "the acceptor must not send any PDU");

    match scp_handle.join().unwrap() {
        Err(Error::Aborted { .. }) => {}
        other => panic!("expected an abort outcome, got {:?}", other.map(|_| ())),
    }

    // the socket is fully closed: writing eventually fails
    let deadline = Instant::now() + WAIT;
    loop {
        match stream.write(&[0u8; 16]).and_then(|_| stream.flush()) {
            Err(_) => break,
            Ok(_) if Instant::now() > deadline => {
                panic!("acceptor socket still accepts data after the abort")
            }
            Ok(_) => thread::sleep(Duration::from_millis(50)),
        }
    }
}

/// An abort tears the association down on both sides;
/// afterwards every operation reports the terminal state.
#[test]
fn abort_is_terminal_for_the_peer() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    let scp = scp_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let scp_handle = thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        match association.receive_message() {
            Err(Error::Aborted { .. }) => {}
            other => panic!("expected an abort, got {:?}", other),
        }
        assert_eq!(association.state(), AssociationState::Aborted);

        match association.release() {
            Err(Error::Terminated) => {}
            other => panic!("expected Terminated, got {:?}", other),
        }
        Ok(())
    });

    let association = scu_options()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    association.abort();

    scp_handle.join().unwrap().unwrap();
}

/// A second association beyond the configured cap
/// is rejected as transient.
#[test]
fn maximum_associations_cap_rejects_transiently() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    let scp = scp_options()
        .maximum_associations(1)
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let scp_handle = thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let _first = scp.establish(stream)?;

        // while the first association is alive, a second one is refused
        let (stream, _addr) = listener.accept()?;
        match scp.establish(stream) {
            Err(Error::Rejected { association_rj }) => {
                assert_eq!(association_rj.result, AssociationRJResult::Transient);
            }
            other => panic!("expected a transient rejection, got {:?}", other.map(|_| ())),
        }
        Ok(())
    });

    let _first = scu_options()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    let second = scu_options()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(scp_addr);
    match second {
        Err(Error::Rejected { association_rj }) => {
            assert_eq!(association_rj.result, AssociationRJResult::Transient);
        }
        other => panic!("expected a transient rejection, got {:?}", other.map(|_| ())),
    }

    scp_handle.join().unwrap().unwrap();
}

/// An established association with no traffic for longer than
/// the network timeout is aborted by the provider.
#[test]
fn network_idle_timeout_aborts() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    let scp = scp_options()
        .network_timeout(Some(Duration::from_millis(300)))
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(IMPLICIT_VR_LE);

    let scp_handle = thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;

        match association.receive_message() {
            Err(Error::Aborted { .. }) => {}
            other => panic!("expected an abort, got {:?}", other),
        }
        assert_eq!(association.state(), AssociationState::Aborted);
        Ok(())
    });

    let mut association = scu_options()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(scp_addr)
        .unwrap();

    // stay idle; the acceptor's watchdog fires and aborts
    match association.receive_message_timeout(Some(WAIT)) {
        Err(Error::Aborted { .. }) => {}
        other => panic!("expected an abort, got {:?}", other),
    }

    scp_handle.join().unwrap().unwrap();
}

/// The default transfer syntaxes are proposed when none are given,
/// and the acceptor's preference picks among them.
#[test]
fn default_transfer_syntaxes_are_proposed() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let scp_addr = listener.local_addr().unwrap();

    let scp = scp_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .with_transfer_syntax(EXPLICIT_VR_LE);

    let scp_handle = thread::spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let mut association = scp.establish(stream)?;
        match association.receive_message() {
            Err(Error::PeerReleased) => {}
            other => panic!("expected a peer release, got {:?}", other),
        }
        Ok(())
    });

    let mut association = scu_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(scp_addr)
        .unwrap();

    let pc = association
        .accepted_presentation_contexts()
        .next()
        .unwrap()
        .clone();
    assert_eq!(pc.transfer_syntax, EXPLICIT_VR_LE);

    association.release().unwrap();
    scp_handle.join().unwrap().unwrap();
}
