use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use porch_client_core::media::{MediaConstraints, MockMediaStack};
use porch_client_core::negotiation::{NegotiationRole, NegotiationState, PeerObserver};
use porch_client_core::protocol::{CandidateBlob, Envelope, Payload, SessionDescriptor};
use porch_client_core::session::{RoomEvent, RoomSession, SessionOptions};
use porch_client_core::transport::RoomHub;

const WAIT: Duration = Duration::from_secs(5);

fn session_over_hub(
    hub: &Arc<RoomHub>,
    username: &str,
    negotiation_timeout: Option<Duration>,
) -> (RoomSession, Arc<MockMediaStack>) {
    let channel = hub.join(username, Some("lightblue"));
    let (media_tx, media_rx) = mpsc::unbounded_channel();
    let media = MockMediaStack::new(media_tx);
    let session = RoomSession::spawn(
        SessionOptions::new(username)
            .with_constraints(MediaConstraints::AUDIO_VIDEO)
            .with_negotiation_timeout(negotiation_timeout),
        channel,
        Arc::clone(&media) as Arc<dyn porch_client_core::media::MediaStack>,
        media_rx,
    );
    (session, media)
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(WAIT, async {
        loop {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn wait_peer(session: &RoomSession, username: &str) -> PeerObserver {
    timeout(WAIT, async {
        loop {
            if let Some(observer) = session.peer(username) {
                return observer;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no negotiation appeared for {username}"))
}

fn offers_from(hub: &RoomHub, sender: &str) -> usize {
    hub.sent_envelopes()
        .iter()
        .filter(|envelope| {
            envelope.username == sender
                && matches!(envelope.payload, Payload::NegotiateOffer { .. })
        })
        .count()
}

fn total_offers(hub: &RoomHub) -> usize {
    hub.sent_envelopes()
        .iter()
        .filter(|envelope| matches!(envelope.payload, Payload::NegotiateOffer { .. }))
        .count()
}

#[tokio::test]
async fn alice_and_bob_reach_connected_with_single_offer() {
    let hub = RoomHub::new();
    let (alice, _alice_media) = session_over_hub(&hub, "alice", None);
    let (bob, _bob_media) = session_over_hub(&hub, "bob", None);

    let alice_view = wait_peer(&alice, "bob").await;
    let bob_view = wait_peer(&bob, "alice").await;

    // Deterministic tie-break: alice calls, bob answers.
    assert_eq!(alice_view.role, NegotiationRole::Initiator);
    assert_eq!(bob_view.role, NegotiationRole::Responder);

    assert!(alice_view.wait_connected().await, "alice never connected");
    assert!(bob_view.wait_connected().await, "bob never connected");

    // Exactly one side opened negotiation for the pair.
    assert_eq!(total_offers(&hub), 1);
    assert_eq!(offers_from(&hub, "alice"), 1);
    assert_eq!(offers_from(&hub, "bob"), 0);
}

#[tokio::test]
async fn candidate_arriving_before_any_descriptor_is_queued_then_flushed() {
    let hub = RoomHub::new();
    let (alice, alice_media) = session_over_hub(&hub, "alice", None);

    // A scripted "bob" whose candidate outruns his introduction.
    let early_candidate = CandidateBlob {
        candidate: "candidate:7 1 udp 2122260223 192.0.2.7 54400 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    };
    hub.inject(Envelope {
        username: "bob".into(),
        to: Some("alice".into()),
        payload: Payload::NetworkCandidate {
            candidate: early_candidate.clone(),
        },
    });
    hub.inject(Envelope {
        username: "bob".into(),
        to: None,
        payload: Payload::IntroduceSelf {
            color: Some("plum".into()),
        },
    });

    // The candidate must survive until alice's local descriptor exists, then
    // reach the media stack.
    wait_until("queued candidate to be flushed", || {
        !alice_media.applied_candidates("bob").is_empty()
    })
    .await;
    assert_eq!(alice_media.applied_candidates("bob")[0], early_candidate);

    let observer = wait_peer(&alice, "bob").await;
    assert_eq!(observer.state(), NegotiationState::OfferSent);
}

#[tokio::test]
async fn second_answer_for_connected_peer_is_ignored() {
    let hub = RoomHub::new();
    let (alice, alice_media) = session_over_hub(&hub, "alice", None);

    hub.inject(Envelope {
        username: "bob".into(),
        to: None,
        payload: Payload::IntroduceSelf { color: None },
    });
    wait_until("alice's offer to bob", || offers_from(&hub, "alice") == 1).await;

    let first_answer = SessionDescriptor::answer("v=0 scripted answer");
    hub.inject(Envelope {
        username: "bob".into(),
        to: Some("alice".into()),
        payload: Payload::NegotiateAnswer {
            answer: first_answer.clone(),
        },
    });

    let observer = wait_peer(&alice, "bob").await;
    assert!(observer.wait_connected().await);
    assert_eq!(observer.remote_answer().await, first_answer);
    assert_eq!(alice_media.remote_descriptors_applied("bob"), 1);

    hub.inject(Envelope {
        username: "bob".into(),
        to: Some("alice".into()),
        payload: Payload::NegotiateAnswer {
            answer: SessionDescriptor::answer("v=0 duplicate answer"),
        },
    });
    sleep(Duration::from_millis(100)).await;

    assert_eq!(observer.state(), NegotiationState::Connected);
    assert_eq!(alice_media.remote_descriptors_applied("bob"), 1);
    assert_eq!(observer.remote_answer().await, first_answer);
}

#[tokio::test]
async fn messages_addressed_to_someone_else_have_no_effect() {
    let hub = RoomHub::new();
    let (alice, alice_media) = session_over_hub(&hub, "alice", None);
    let mut events = alice.events().await.unwrap();

    hub.inject(Envelope {
        username: "bob".into(),
        to: Some("carol".into()),
        payload: Payload::NegotiateOffer {
            offer: SessionDescriptor::offer("v=0 not for alice"),
        },
    });
    hub.inject(Envelope {
        username: "bob".into(),
        to: Some("carol".into()),
        payload: Payload::NetworkCandidate {
            candidate: CandidateBlob {
                candidate: "candidate:0".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        },
    });
    sleep(Duration::from_millis(100)).await;

    assert!(alice.peer("bob").is_none());
    assert!(!alice_media.knows_peer("bob"));
    assert!(events.try_recv().is_err(), "expected no room events");
}

#[tokio::test]
async fn repeated_introduction_is_idempotent() {
    let hub = RoomHub::new();
    let (alice, _alice_media) = session_over_hub(&hub, "alice", None);
    let mut events = alice.events().await.unwrap();

    let intro = Envelope {
        username: "bob".into(),
        to: None,
        payload: Payload::IntroduceSelf {
            color: Some("plum".into()),
        },
    };
    hub.inject(intro.clone());
    wait_until("alice's offer to bob", || offers_from(&hub, "alice") == 1).await;
    hub.inject(intro);
    sleep(Duration::from_millis(100)).await;

    // Still exactly one offer and one joined notification.
    assert_eq!(offers_from(&hub, "alice"), 1);
    let mut joined = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(&event, RoomEvent::PeerJoined { username, .. } if username == "bob") {
            joined += 1;
        }
    }
    assert_eq!(joined, 1);
}

#[tokio::test]
async fn unanswered_negotiation_times_out_to_failed() {
    let hub = RoomHub::new();
    let (alice, _alice_media) =
        session_over_hub(&hub, "alice", Some(Duration::from_millis(200)));
    let mut events = alice.events().await.unwrap();

    hub.inject(Envelope {
        username: "bob".into(),
        to: None,
        payload: Payload::IntroduceSelf { color: None },
    });

    let observer = wait_peer(&alice, "bob").await;
    let connected = timeout(WAIT, observer.wait_terminal())
        .await
        .expect("negotiation never reached a terminal state");
    assert!(!connected, "negotiation should have failed");
    assert_eq!(observer.state(), NegotiationState::Failed);

    let failure = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(RoomEvent::NegotiationFailed { username, .. }) if username == "bob" => {
                    return true;
                }
                Some(_) => {}
                None => return false,
            }
        }
    })
    .await
    .expect("no failure event arrived");
    assert!(failure);
}

#[tokio::test]
async fn leave_tears_down_the_peer() {
    let hub = RoomHub::new();
    let (alice, alice_media) = session_over_hub(&hub, "alice", None);
    let (bob, _bob_media) = session_over_hub(&hub, "bob", None);

    let alice_view = wait_peer(&alice, "bob").await;
    assert!(alice_view.wait_connected().await);
    let mut events = alice.events().await.unwrap();

    bob.leave().await;

    let left = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(RoomEvent::PeerLeft { username }) if username == "bob" => return true,
                Some(_) => {}
                None => return false,
            }
        }
    })
    .await
    .expect("no peer-left event arrived");
    assert!(left);
    assert!(alice.peer("bob").is_none());
    assert!(!alice_media.knows_peer("bob"));
}

#[tokio::test]
async fn unknown_message_types_are_surfaced() {
    let hub = RoomHub::new();
    let (alice, _alice_media) = session_over_hub(&hub, "alice", None);
    let mut events = alice.events().await.unwrap();

    hub.inject_raw(r#"{"type":"emoji-reaction","username":"bob","emoji":"🌊"}"#);

    let surfaced = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(RoomEvent::Unhandled { message }) => {
                    return message["type"] == "emoji-reaction";
                }
                Some(_) => {}
                None => return false,
            }
        }
    })
    .await
    .expect("unhandled message never surfaced");
    assert!(surfaced);
}

#[tokio::test]
async fn chat_messages_reach_everyone_including_the_sender() {
    let hub = RoomHub::new();
    let (alice, _alice_media) = session_over_hub(&hub, "alice", None);
    let (bob, _bob_media) = session_over_hub(&hub, "bob", None);
    let mut alice_events = alice.events().await.unwrap();
    let mut bob_events = bob.events().await.unwrap();

    alice.send_chat("hello porch").unwrap();

    for (who, events) in [("alice", &mut alice_events), ("bob", &mut bob_events)] {
        let got = timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Some(RoomEvent::Chat {
                        username, message, ..
                    }) if username == "alice" => return message,
                    Some(_) => {}
                    None => panic!("event stream for {who} closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{who} never saw the chat message"));
        assert_eq!(got, "hello porch");
    }
}
