//! Two cores wired back to back: signals relayed through a fake rendezvous server and
//! sub-channel data piped between mock transports.

use parley_core::call::{CallEvent, EndReason};
use parley_core::crypto::EncryptionState;
use parley_core::message::DeliveryStatus;
use parley_core::mock::{MockMedia, MockTransport};
use parley_core::peer::Role;
use parley_core::signaling::{ClientSignal, MediaKind, ServerSignal};
use parley_core::transfer::{FileMeta, TransferStatus};
use parley_core::transport::{ConnectionState, TransportEvent};
use parley_core::{Action, ChatCore, Config, Event, MemoryStore, MessageStore, PeerId};

struct Node {
    id: PeerId,
    core: ChatCore,
    transport: MockTransport,
    events: Vec<Event>,
}

impl Node {
    fn new(id: &str) -> Self {
        let transport = MockTransport::new();
        let core = ChatCore::new(
            PeerId::from(id),
            Config::default(),
            Box::new(transport.clone()),
            Box::new(MockMedia::new()),
            Box::new(MemoryStore::new()),
        );
        Self {
            id: PeerId::from(id),
            core,
            transport,
            events: Vec::new(),
        }
    }

    /// Drain the core; keep events, return signals as the server would forward them.
    fn outgoing_signals(&mut self) -> Vec<(PeerId, ServerSignal)> {
        let mut out = Vec::new();
        for action in self.core.poll() {
            match action {
                Action::Notify(e) => self.events.push(e),
                Action::Signal(s) => {
                    if let Some(forwarded) = forward(&self.id, s) {
                        out.push(forwarded);
                    }
                }
            }
        }
        out
    }

    fn take_events(&mut self) -> Vec<Event> {
        for action in self.core.poll() {
            if let Action::Notify(e) = action {
                self.events.push(e);
            }
        }
        std::mem::take(&mut self.events)
    }

    fn open_channel(&mut self, peer: &PeerId) {
        let channel = self.core.session(peer).unwrap().channel.unwrap();
        self.core.on_transport_event(TransportEvent::ChannelOpen {
            peer_id: peer.clone(),
            channel,
        });
    }
}

/// What the rendezvous server does with a client signal: re-address it to the recipient.
fn forward(from: &PeerId, signal: ClientSignal) -> Option<(PeerId, ServerSignal)> {
    let from = from.clone();
    Some(match signal {
        ClientSignal::Offer { to, sdp } => (to, ServerSignal::Offer { from, sdp }),
        ClientSignal::Answer { to, sdp } => (to, ServerSignal::Answer { from, sdp }),
        ClientSignal::IceCandidate { to, candidate } => {
            (to, ServerSignal::IceCandidate { from, candidate })
        }
        ClientSignal::CallOffer {
            to,
            sdp,
            media_kind,
        } => (
            to,
            ServerSignal::CallOffer {
                from,
                sdp,
                media_kind,
            },
        ),
        ClientSignal::CallAnswer { to, sdp } => (to, ServerSignal::CallAnswer { from, sdp }),
        ClientSignal::CallEnd { to } => (to, ServerSignal::CallEnd { from }),
        ClientSignal::CallReject { to, reason } => {
            (to, ServerSignal::CallReject { from, reason })
        }
        ClientSignal::CallIceCandidate { to, candidate } => {
            (to, ServerSignal::CallIceCandidate { from, candidate })
        }
        ClientSignal::SetStatus { .. } => return None,
    })
}

/// Relay signals and sub-channel data both ways until nothing moves.
fn settle(a: &mut Node, b: &mut Node) {
    loop {
        let mut moved = false;
        for (to, signal) in a.outgoing_signals() {
            assert_eq!(to, b.id);
            b.core.on_signal(signal);
            moved = true;
        }
        for (to, signal) in b.outgoing_signals() {
            assert_eq!(to, a.id);
            a.core.on_signal(signal);
            moved = true;
        }
        for (to, data) in a.transport.take_sent() {
            assert_eq!(to, b.id);
            b.core.on_transport_event(TransportEvent::ChannelMessage {
                peer_id: a.id.clone(),
                data,
            });
            moved = true;
        }
        for (to, data) in b.transport.take_sent() {
            assert_eq!(to, a.id);
            a.core.on_transport_event(TransportEvent::ChannelMessage {
                peer_id: b.id.clone(),
                data,
            });
            moved = true;
        }
        if !moved {
            break;
        }
    }
}

/// alice dials bob; both sub-channels open and keys are exchanged.
fn connected() -> (Node, Node) {
    let mut a = Node::new("alice");
    let mut b = Node::new("bob");
    a.core.open(&b.id.clone()).unwrap();
    settle(&mut a, &mut b);
    let (aid, bid) = (a.id.clone(), b.id.clone());
    a.open_channel(&bid);
    b.open_channel(&aid);
    settle(&mut a, &mut b);
    (a, b)
}

fn received(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::MessageReceived(m) => Some(m.content.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn session_comes_up_encrypted() {
    let (mut a, mut b) = connected();
    assert_eq!(a.core.encryption_state(&b.id), EncryptionState::Established);
    assert_eq!(b.core.encryption_state(&a.id), EncryptionState::Established);
    assert!(a.take_events().contains(&Event::EncryptionEstablished(b.id.clone())));
    assert!(b.take_events().contains(&Event::ChannelReady(a.id.clone())));
}

#[test]
fn open_is_idempotent() {
    let (mut a, b) = connected();
    a.core.open(&b.id).unwrap();
    a.core.open(&b.id).unwrap();
    assert_eq!(a.transport.created(), 1);
}

fn delivered_sealed(events: &[Event], text: &str) -> bool {
    events
        .iter()
        .any(|e| matches!(e, Event::MessageReceived(m) if m.encrypted && m.content == text))
}

#[test]
fn reopen_after_disconnect_agrees_on_a_fresh_key() {
    let (mut a, mut b) = connected();
    let (aid, bid) = (a.id.clone(), b.id.clone());
    b.core.authorize(&aid);
    a.core.on_transport_event(TransportEvent::StateChanged {
        peer_id: bid.clone(),
        state: ConnectionState::Disconnected,
    });
    b.core.on_transport_event(TransportEvent::StateChanged {
        peer_id: aid.clone(),
        state: ConnectionState::Disconnected,
    });
    settle(&mut a, &mut b);

    a.core.open(&bid).unwrap();
    assert_eq!(a.core.encryption_state(&bid), EncryptionState::None);
    settle(&mut a, &mut b);
    a.open_channel(&bid);
    b.open_channel(&aid);
    settle(&mut a, &mut b);
    assert_eq!(a.core.encryption_state(&bid), EncryptionState::Established);
    assert_eq!(b.core.encryption_state(&aid), EncryptionState::Established);
    assert_eq!(a.transport.created(), 2);

    b.take_events();
    a.core.send_text(&bid, "again").unwrap();
    settle(&mut a, &mut b);
    let got = b.take_events();
    assert!(delivered_sealed(&got, "again"));
    assert!(!got.iter().any(|e| matches!(e, Event::Undecryptable { .. })));
}

#[test]
fn key_arriving_before_channel_open_still_converges() {
    let mut a = Node::new("alice");
    let mut b = Node::new("bob");
    let (aid, bid) = (a.id.clone(), b.id.clone());
    a.core.open(&bid).unwrap();
    settle(&mut a, &mut b);

    // alice's key reaches bob before bob sees his own channel open.
    a.open_channel(&bid);
    settle(&mut a, &mut b);
    assert_eq!(b.core.encryption_state(&aid), EncryptionState::Established);
    assert_eq!(a.core.encryption_state(&bid), EncryptionState::Pending);

    b.open_channel(&aid);
    settle(&mut a, &mut b);
    assert_eq!(a.core.encryption_state(&bid), EncryptionState::Established);

    b.core.authorize(&aid);
    a.core.send_text(&bid, "sealed").unwrap();
    settle(&mut a, &mut b);
    assert!(delivered_sealed(&b.take_events(), "sealed"));
}

#[test]
fn hello_goes_sent_delivered_read() {
    let (mut a, mut b) = connected();
    b.core.authorize(&a.id);
    let id = a.core.send_text(&b.id, "hello").unwrap();
    assert_eq!(a.core.outbound(&b.id)[0].status, DeliveryStatus::Sent);
    settle(&mut a, &mut b);

    let got = b.take_events();
    assert_eq!(received(&got), vec!["hello".to_string()]);
    assert!(got
        .iter()
        .any(|e| matches!(e, Event::MessageReceived(m) if m.encrypted)));
    assert_eq!(a.core.outbound(&b.id)[0].status, DeliveryStatus::Delivered);

    b.core.mark_read(&a.id, Some(&id)).unwrap();
    settle(&mut a, &mut b);
    assert_eq!(a.core.outbound(&b.id)[0].status, DeliveryStatus::Read);
    assert_eq!(
        a.core.store().load_messages("bob")[0].status,
        DeliveryStatus::Read
    );
    assert_eq!(b.core.store().summaries()[0].unread, 0);
}

#[test]
fn first_contact_waits_for_acceptance() {
    let (mut a, mut b) = connected();
    a.core.send_text(&b.id, "one").unwrap();
    a.core.send_text(&b.id, "two").unwrap();
    settle(&mut a, &mut b);

    let got = b.take_events();
    assert!(received(&got).is_empty());
    assert_eq!(b.core.pending_authorization(&a.id).len(), 2);
    assert!(a
        .core
        .outbound(&b.id)
        .iter()
        .all(|m| m.status == DeliveryStatus::Sent));

    b.core.accept_conversation(&a.id).unwrap();
    settle(&mut a, &mut b);
    assert_eq!(received(&b.take_events()), vec!["one", "two"]);
    assert!(a.take_events().contains(&Event::AuthAccepted(b.id.clone())));
    assert!(a
        .core
        .outbound(&b.id)
        .iter()
        .all(|m| m.status == DeliveryStatus::Delivered));
}

#[test]
fn rejected_conversation_marks_messages_refused() {
    let (mut a, mut b) = connected();
    a.core.send_text(&b.id, "spam").unwrap();
    settle(&mut a, &mut b);
    assert_eq!(b.core.reject_conversation(&a.id).unwrap(), 1);
    settle(&mut a, &mut b);

    assert!(a.take_events().contains(&Event::AuthRefused(b.id.clone())));
    assert_eq!(a.core.outbound(&b.id)[0].status, DeliveryStatus::Refused);
    assert!(b.core.store().load_messages("alice").is_empty());
}

#[test]
fn file_arrives_intact() {
    let (mut a, mut b) = connected();
    let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let id = a
        .core
        .send_file(
            &b.id,
            FileMeta {
                name: "photo.jpg".into(),
                mime: "image/jpeg".into(),
                thumbnail: None,
            },
            data.clone(),
        )
        .unwrap();
    settle(&mut a, &mut b);
    assert!(b
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::FileOffered(t) if t.id == id && t.meta.name == "photo.jpg")));

    b.core.accept_file(&id).unwrap();
    settle(&mut a, &mut b);
    while a.core.pump() > 0 {
        settle(&mut a, &mut b);
    }

    let rebuilt = b.take_events().into_iter().find_map(|e| match e {
        Event::TransferCompleted {
            transfer_id,
            data: Some(bytes),
        } if transfer_id == id => Some(bytes),
        _ => None,
    });
    assert_eq!(rebuilt, Some(data));
    assert!(a.take_events().contains(&Event::TransferCompleted {
        transfer_id: id.clone(),
        data: None
    }));
    assert_eq!(a.core.transfer(&id).unwrap().status, TransferStatus::Completed);
    assert_eq!(a.core.transfer(&id).unwrap().progress(), 1.0);
}

#[test]
fn declined_file_moves_no_bytes() {
    let (mut a, mut b) = connected();
    let id = a
        .core
        .send_file(
            &b.id,
            FileMeta {
                name: "big.iso".into(),
                mime: "application/octet-stream".into(),
                thumbnail: None,
            },
            vec![0; 1024],
        )
        .unwrap();
    settle(&mut a, &mut b);
    b.core.reject_file(&id).unwrap();
    settle(&mut a, &mut b);
    assert!(a.take_events().contains(&Event::TransferRejected(id.clone())));
    assert_eq!(a.core.pump(), 0);
    assert_eq!(a.core.transfer(&id).unwrap().status, TransferStatus::Rejected);
}

#[test]
fn call_rings_connects_and_hangs_up() {
    let (mut a, mut b) = connected();
    a.core.start_call(&b.id, MediaKind::Video).unwrap();
    settle(&mut a, &mut b);
    assert!(b.take_events().contains(&Event::Call(CallEvent::Incoming {
        peer_id: a.id.clone(),
        kind: MediaKind::Video
    })));

    b.core.accept_call().unwrap();
    settle(&mut a, &mut b);
    assert!(a
        .take_events()
        .contains(&Event::Call(CallEvent::Active(b.id.clone()))));

    // A second caller gets busy while the call is up.
    b.core.on_signal(ServerSignal::CallOffer {
        from: PeerId::from("carol"),
        sdp: parley_core::signaling::SessionDescription::offer("carol-offer"),
        media_kind: MediaKind::Audio,
    });
    let busy = b.core.poll().into_iter().any(|action| {
        matches!(action, Action::Signal(ClientSignal::CallReject { ref to, ref reason })
            if to.as_str() == "carol" && reason == "busy")
    });
    assert!(busy);
    assert_eq!(b.core.call().unwrap().peer_id, a.id);

    a.core.hangup().unwrap();
    settle(&mut a, &mut b);
    assert!(b.take_events().contains(&Event::Call(CallEvent::Ended {
        peer_id: a.id.clone(),
        reason: EndReason::RemoteHangup
    })));
    assert!(a.core.call().is_none());
    assert!(b.core.call().is_none());
    assert_eq!(a.core.call_history().len(), 1);
}

#[test]
fn simultaneous_dial_keeps_one_session() {
    let mut a = Node::new("alice");
    let mut b = Node::new("bob");
    a.core.open(&b.id.clone()).unwrap();
    b.core.open(&a.id.clone()).unwrap();
    settle(&mut a, &mut b);
    // The larger id keeps its offer.
    assert_eq!(b.core.session(&a.id).unwrap().role, Role::Initiator);
    assert_eq!(a.core.session(&b.id).unwrap().role, Role::Responder);
}
