// Membership engine end-to-end scenarios
//
// Drives the engine directly through its public phases and inbound
// dispatch, with a capturing transport standing in for the sockets.

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use rusty_gossip::error::Result;
use rusty_gossip::membership::MembershipEngine;
use rusty_gossip::transport::Transport;
use rusty_gossip::wire::{codec, Incarnation, MemberState, Message, NodeAddress};
use rusty_gossip::{MembershipConfig, MembershipMetrics, RttTracker};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Records every datagram instead of sending it.
#[derive(Default)]
struct CaptureTransport {
    sent: Mutex<Vec<(NodeAddress, Vec<u8>)>>,
}

#[async_trait]
impl Transport for CaptureTransport {
    fn send(&self, destination: &NodeAddress, payload: &[u8]) -> Result<()> {
        self.sent.lock().push((*destination, payload.to_vec()));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

impl CaptureTransport {
    fn datagrams(&self) -> Vec<(NodeAddress, Vec<u8>)> {
        self.sent.lock().clone()
    }

    fn clear(&self) {
        self.sent.lock().clear();
    }
}

struct Harness {
    engine: MembershipEngine,
    udp: Arc<CaptureTransport>,
    tcp: Arc<CaptureTransport>,
}

impl Harness {
    fn new(self_addr: &str, bootstrap: &[&str]) -> Self {
        let config = MembershipConfig {
            advertised_address: self_addr.parse::<SocketAddr>().unwrap(),
            bind_address: self_addr.parse::<SocketAddr>().unwrap(),
            bootstrap_members: bootstrap
                .iter()
                .map(|s| s.parse::<SocketAddr>().unwrap())
                .collect(),
            ..Default::default()
        };
        let udp = Arc::new(CaptureTransport::default());
        let tcp = Arc::new(CaptureTransport::default());
        let engine = MembershipEngine::new(
            config,
            udp.clone(),
            tcp.clone(),
            Arc::new(RttTracker::new(Default::default())),
            Arc::new(MembershipMetrics::new()),
        )
        .unwrap();
        Self { engine, udp, tcp }
    }

    /// Hand a single message to the engine as one inbound datagram.
    fn dispatch(&self, message: &Message) {
        let mut buf = BytesMut::new();
        codec::append(&mut buf, message).unwrap();
        self.engine.dispatch_datagram(&buf).unwrap();
    }

    /// Decode every record of every captured UDP datagram.
    fn sent_messages(&self) -> Vec<(NodeAddress, Message)> {
        let mut out = Vec::new();
        for (destination, payload) in self.udp.datagrams() {
            let mut pos = 0;
            while pos < payload.len() {
                let (message, used) = codec::parse(&payload[pos..]).unwrap();
                pos += used;
                out.push((destination, message));
            }
        }
        out
    }
}

fn addr(s: &str) -> NodeAddress {
    NodeAddress::from_socket_addr(s.parse::<SocketAddr>().unwrap()).unwrap()
}

#[test]
fn test_bootstrap_join_seeds_view_and_self_gossip() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.2:3000"]);

    let members = harness.engine.alive_members();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].address, addr("1.0.0.2:3000"));
    assert_eq!(members[0].state, MemberState::Alive);
    assert_eq!(members[0].incarnation, Incarnation(0));

    let gossip = harness.engine.queued_gossip();
    assert_eq!(
        gossip,
        vec![Message::Alive {
            dst: addr("1.0.0.1:3000"),
            incarnation: Incarnation(0),
        }]
    );
}

#[test]
fn test_bootstrap_deduplicates_and_skips_self() {
    let harness = Harness::new(
        "1.0.0.1:3000",
        &["1.0.0.2:3000", "1.0.0.2:3000", "1.0.0.1:3000"],
    );
    assert_eq!(harness.engine.alive_members().len(), 1);
}

#[test]
fn test_suspect_rumor_about_self_is_refuted() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.2:3000"]);

    harness.dispatch(&Message::Suspect {
        src: addr("1.0.0.2:3000"),
        dst: addr("1.0.0.1:3000"),
        incarnation: Incarnation(0),
    });

    assert_eq!(harness.engine.incarnation(), Incarnation(1));
    let gossip = harness.engine.queued_gossip();
    assert!(gossip.contains(&Message::Alive {
        dst: addr("1.0.0.1:3000"),
        incarnation: Incarnation(1),
    }));
    // The rumor must not create a member entry for ourselves.
    assert_eq!(harness.engine.alive_members().len(), 1);
    assert_eq!(
        harness.engine.alive_members()[0].address,
        addr("1.0.0.2:3000")
    );
}

#[test]
fn test_stale_rumor_about_self_is_ignored() {
    let harness = Harness::new("1.0.0.1:3000", &[]);

    // Establish incarnation 1 via a refutation.
    harness.dispatch(&Message::Suspect {
        src: addr("1.0.0.2:3000"),
        dst: addr("1.0.0.1:3000"),
        incarnation: Incarnation(0),
    });
    assert_eq!(harness.engine.incarnation(), Incarnation(1));

    // A rumor older than our incarnation changes nothing.
    harness.dispatch(&Message::Faulty {
        src: addr("1.0.0.2:3000"),
        dst: addr("1.0.0.1:3000"),
        incarnation: Incarnation(0),
    });
    assert_eq!(harness.engine.incarnation(), Incarnation(1));
}

#[test]
fn test_unanswered_probe_suspects_then_faults() {
    let harness = Harness::new("1.0.0.1:3000", &[]);
    let x = addr("1.0.0.9:3000");

    // Learn X as Alive at incarnation 2.
    harness.dispatch(&Message::Alive {
        dst: x,
        incarnation: Incarnation(2),
    });
    assert_eq!(harness.engine.alive_members().len(), 1);

    // Probe X and never answer.
    harness.engine.direct_ping().unwrap();
    harness.engine.end_of_protocol_period().unwrap();

    let members = harness.engine.alive_members();
    assert_eq!(members[0].state, MemberState::Suspect);
    assert_eq!(members[0].incarnation, Incarnation(2));
    assert_eq!(members[0].suspicion_periods, 0);
    assert!(harness.engine.queued_gossip().contains(&Message::Suspect {
        src: addr("1.0.0.1:3000"),
        dst: x,
        incarnation: Incarnation(2),
    }));

    // safety = 3 and one member: threshold = ceil(3 * log10(2)) = 1.
    harness.engine.end_of_protocol_period().unwrap();
    assert_eq!(harness.engine.alive_members()[0].suspicion_periods, 1);
    assert_eq!(harness.engine.faulty_members().len(), 0);

    harness.engine.end_of_protocol_period().unwrap();
    assert_eq!(harness.engine.alive_members().len(), 0);
    let faulty = harness.engine.faulty_members();
    assert_eq!(faulty.len(), 1);
    assert_eq!(faulty[0].address, x);
    assert_eq!(faulty[0].state, MemberState::Faulty);
    assert_eq!(faulty[0].incarnation, Incarnation(2));
    assert!(harness.engine.queued_gossip().contains(&Message::Faulty {
        src: addr("1.0.0.1:3000"),
        dst: x,
        incarnation: Incarnation(2),
    }));
}

#[test]
fn test_higher_incarnation_alive_revives_faulty() {
    let harness = Harness::new("1.0.0.1:3000", &[]);
    let x = addr("1.0.0.9:3000");

    harness.dispatch(&Message::Faulty {
        src: addr("1.0.0.2:3000"),
        dst: x,
        incarnation: Incarnation(2),
    });
    assert_eq!(harness.engine.faulty_members().len(), 1);
    assert_eq!(harness.engine.alive_members().len(), 0);

    harness.dispatch(&Message::Alive {
        dst: x,
        incarnation: Incarnation(3),
    });

    assert_eq!(harness.engine.faulty_members().len(), 0);
    let members = harness.engine.alive_members();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].address, x);
    assert_eq!(members[0].state, MemberState::Alive);
    assert_eq!(members[0].incarnation, Incarnation(3));
    assert!(harness.engine.queued_gossip().contains(&Message::Alive {
        dst: x,
        incarnation: Incarnation(3),
    }));
}

#[test]
fn test_equal_incarnation_alive_does_not_revive_faulty() {
    let harness = Harness::new("1.0.0.1:3000", &[]);
    let x = addr("1.0.0.9:3000");

    harness.dispatch(&Message::Faulty {
        src: addr("1.0.0.2:3000"),
        dst: x,
        incarnation: Incarnation(2),
    });
    harness.dispatch(&Message::Alive {
        dst: x,
        incarnation: Incarnation(2),
    });

    assert_eq!(harness.engine.faulty_members().len(), 1);
    assert_eq!(harness.engine.alive_members().len(), 0);
}

#[test]
fn test_indirect_ack_resolves_direct_probe() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.9:3000"]);
    let x = addr("1.0.0.9:3000");

    harness.engine.direct_ping().unwrap();
    let sequence = harness
        .sent_messages()
        .into_iter()
        .find_map(|(_, message)| match message {
            Message::DirectPing { seq, .. } => Some(seq),
            _ => None,
        })
        .expect("direct ping was sent");

    harness.dispatch(&Message::IndirectAck {
        src: x,
        seq: sequence,
    });

    harness.engine.end_of_protocol_period().unwrap();
    let members = harness.engine.alive_members();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].state, MemberState::Alive);
}

#[test]
fn test_direct_ack_resolves_probe() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.9:3000"]);
    let x = addr("1.0.0.9:3000");

    harness.engine.direct_ping().unwrap();
    let sequence = harness
        .sent_messages()
        .into_iter()
        .find_map(|(_, message)| match message {
            Message::DirectPing { seq, .. } => Some(seq),
            _ => None,
        })
        .expect("direct ping was sent");

    harness.dispatch(&Message::DirectAck {
        src: x,
        seq: sequence,
    });

    harness.engine.end_of_protocol_period().unwrap();
    assert_eq!(
        harness.engine.alive_members()[0].state,
        MemberState::Alive
    );
}

#[test]
fn test_inbound_direct_ping_answered_with_ack() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.2:3000"]);
    let peer = addr("1.0.0.2:3000");

    harness.udp.clear();
    harness.dispatch(&Message::DirectPing { src: peer, seq: 41 });

    let ack = harness
        .sent_messages()
        .into_iter()
        .find(|(destination, message)| {
            *destination == peer && matches!(message, Message::DirectAck { .. })
        });
    match ack {
        Some((_, Message::DirectAck { src, seq })) => {
            assert_eq!(src, addr("1.0.0.1:3000"));
            assert_eq!(seq, 41);
        }
        other => panic!("expected a direct ack, got {:?}", other),
    }
}

#[test]
fn test_indirect_ping_proxied_and_ack_forwarded() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.2:3000", "1.0.0.3:3000"]);
    let origin = addr("1.0.0.2:3000");
    let target = addr("1.0.0.3:3000");

    harness.udp.clear();
    harness.dispatch(&Message::IndirectPing {
        src: origin,
        dst: target,
        seq: 99,
    });

    // We probe the target with a sequence number of our own.
    let (proxy_destination, proxy_seq) = harness
        .sent_messages()
        .into_iter()
        .find_map(|(destination, message)| match message {
            Message::DirectPing { seq, .. } => Some((destination, seq)),
            _ => None,
        })
        .expect("proxy ping was sent");
    assert_eq!(proxy_destination, target);

    // The proxy probe survives the end of the current period.
    harness.engine.end_of_protocol_period().unwrap();

    harness.udp.clear();
    harness.dispatch(&Message::DirectAck {
        src: target,
        seq: proxy_seq,
    });

    // The ack comes back to the original requester under its sequence,
    // speaking for the probed target so the requester can match its own
    // pending entries for the target.
    let forwarded = harness
        .sent_messages()
        .into_iter()
        .find_map(|(destination, message)| match message {
            Message::IndirectAck { src, seq } => Some((destination, src, seq)),
            _ => None,
        })
        .expect("indirect ack was forwarded");
    assert_eq!(forwarded, (origin, target, 99));
}

#[test]
fn test_indirect_ping_phase_recruits_helpers() {
    let harness = Harness::new(
        "1.0.0.1:3000",
        &["1.0.0.2:3000", "1.0.0.3:3000", "1.0.0.4:3000", "1.0.0.5:3000"],
    );

    harness.engine.direct_ping().unwrap();
    let probed = harness
        .sent_messages()
        .into_iter()
        .find_map(|(destination, message)| match message {
            Message::DirectPing { .. } => Some(destination),
            _ => None,
        })
        .expect("direct ping was sent");

    harness.udp.clear();
    harness.engine.indirect_ping().unwrap();

    let requests: Vec<(NodeAddress, Message)> = harness
        .sent_messages()
        .into_iter()
        .filter(|(_, message)| matches!(message, Message::IndirectPing { .. }))
        .collect();
    // Three helpers by default, never the probed member itself.
    assert_eq!(requests.len(), 3);
    for (helper, message) in requests {
        assert_ne!(helper, probed);
        match message {
            Message::IndirectPing { dst, .. } => assert_eq!(dst, probed),
            _ => unreachable!(),
        }
    }
}

#[test]
fn test_list_request_answered_over_reliable_transport() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.2:3000", "1.0.0.3:3000"]);
    let requester = addr("1.0.0.5:3000");

    // One faulty member so the response covers both tables.
    harness.dispatch(&Message::Faulty {
        src: addr("1.0.0.2:3000"),
        dst: addr("1.0.0.4:3000"),
        incarnation: Incarnation(7),
    });

    harness.dispatch(&Message::ListRequest { src: requester });

    let datagrams = harness.tcp.datagrams();
    assert_eq!(datagrams.len(), 1);
    let (destination, payload) = &datagrams[0];
    assert_eq!(*destination, requester);

    let (message, _) = codec::parse(payload).unwrap();
    match message {
        Message::ListResponse { src, members } => {
            assert_eq!(src, addr("1.0.0.1:3000"));
            let by_addr: HashMap<NodeAddress, MemberState> = members
                .iter()
                .map(|m| (m.address, m.state))
                .collect();
            assert_eq!(by_addr.len(), 3);
            assert_eq!(by_addr[&addr("1.0.0.2:3000")], MemberState::Alive);
            assert_eq!(by_addr[&addr("1.0.0.4:3000")], MemberState::Faulty);
        }
        other => panic!("expected a list response, got {:?}", other),
    }
}

#[test]
fn test_list_response_dispatched_as_rumors() {
    let harness = Harness::new("1.0.0.1:3000", &[]);

    let mut buf = BytesMut::new();
    codec::append(
        &mut buf,
        &Message::ListResponse {
            src: addr("1.0.0.2:3000"),
            members: vec![
                rusty_gossip::wire::WireMember {
                    address: addr("1.0.0.3:3000"),
                    state: MemberState::Alive,
                    incarnation: Incarnation(1),
                },
                rusty_gossip::wire::WireMember {
                    address: addr("1.0.0.4:3000"),
                    state: MemberState::Faulty,
                    incarnation: Incarnation(2),
                },
            ],
        },
    )
    .unwrap();
    harness.engine.dispatch_datagram(&buf).unwrap();

    assert_eq!(harness.engine.alive_members().len(), 1);
    assert_eq!(harness.engine.faulty_members().len(), 1);
}

#[test]
fn test_direct_ping_round_robin_is_fair() {
    let seeds: Vec<String> = (1..=10).map(|i| format!("1.0.0.{}:3000", i)).collect();
    let seed_refs: Vec<&str> = seeds.iter().map(String::as_str).collect();
    let harness = Harness::new("1.0.0.99:3000", &seed_refs);

    for _ in 0..100 {
        harness.engine.direct_ping().unwrap();
    }

    let mut probes: HashMap<NodeAddress, usize> = HashMap::new();
    for (destination, message) in harness.sent_messages() {
        if matches!(message, Message::DirectPing { .. }) {
            *probes.entry(destination).or_default() += 1;
        }
    }

    assert_eq!(probes.len(), 10);
    for (_, count) in probes {
        assert_eq!(count, 10);
    }
}

#[test]
fn test_self_never_enters_tables() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.2:3000"]);
    let me = addr("1.0.0.1:3000");

    for message in [
        Message::Alive {
            dst: me,
            incarnation: Incarnation(5),
        },
        Message::Suspect {
            src: addr("1.0.0.2:3000"),
            dst: me,
            incarnation: Incarnation(6),
        },
        Message::Faulty {
            src: addr("1.0.0.2:3000"),
            dst: me,
            incarnation: Incarnation(7),
        },
    ] {
        harness.dispatch(&message);
    }

    let mut seen = Vec::new();
    harness.engine.visit_members(|member| seen.push(member.address));
    assert!(!seen.contains(&me));
}

#[test]
fn test_tables_stay_disjoint_and_sorted() {
    let harness = Harness::new("1.0.0.1:3000", &[]);

    for i in 2..=9u8 {
        harness.dispatch(&Message::Alive {
            dst: addr(&format!("1.0.0.{}:3000", i)),
            incarnation: Incarnation(1),
        });
    }
    for i in [3u8, 6, 8] {
        harness.dispatch(&Message::Faulty {
            src: addr("1.0.0.2:3000"),
            dst: addr(&format!("1.0.0.{}:3000", i)),
            incarnation: Incarnation(1),
        });
    }

    let alive: Vec<NodeAddress> = harness
        .engine
        .alive_members()
        .iter()
        .map(|m| m.address)
        .collect();
    let faulty: Vec<NodeAddress> = harness
        .engine
        .faulty_members()
        .iter()
        .map(|m| m.address)
        .collect();

    let mut alive_sorted = alive.clone();
    alive_sorted.sort();
    assert_eq!(alive, alive_sorted);
    let mut faulty_sorted = faulty.clone();
    faulty_sorted.sort();
    assert_eq!(faulty, faulty_sorted);

    for address in &faulty {
        assert!(!alive.contains(address));
    }
    assert_eq!(alive.len(), 5);
    assert_eq!(faulty.len(), 3);
}

#[test]
fn test_faulty_member_stays_faulty_without_newer_rumor() {
    let harness = Harness::new("1.0.0.1:3000", &[]);
    let x = addr("1.0.0.9:3000");

    harness.dispatch(&Message::Faulty {
        src: addr("1.0.0.2:3000"),
        dst: x,
        incarnation: Incarnation(4),
    });

    // Same-incarnation suspect and older alive must not revive it.
    harness.dispatch(&Message::Suspect {
        src: addr("1.0.0.2:3000"),
        dst: x,
        incarnation: Incarnation(4),
    });
    harness.dispatch(&Message::Alive {
        dst: x,
        incarnation: Incarnation(3),
    });
    assert_eq!(harness.engine.faulty_members().len(), 1);

    // A newer suspect does.
    harness.dispatch(&Message::Suspect {
        src: addr("1.0.0.2:3000"),
        dst: x,
        incarnation: Incarnation(5),
    });
    assert_eq!(harness.engine.faulty_members().len(), 0);
    assert_eq!(
        harness.engine.alive_members()[0].state,
        MemberState::Suspect
    );
}

#[test]
fn test_piggyback_respects_datagram_limit() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.2:3000"]);

    // Flood the queue with rumors about many members.
    for i in 1..=200u16 {
        harness.dispatch(&Message::Alive {
            dst: addr(&format!("1.0.1.{}:3000", (i % 250) as u8)),
            incarnation: Incarnation(i),
        });
    }

    harness.udp.clear();
    harness.engine.direct_ping().unwrap();

    for (_, payload) in harness.udp.datagrams() {
        assert!(payload.len() <= 512, "datagram of {} bytes", payload.len());
    }
}

#[test]
fn test_malformed_record_abandons_rest_of_datagram() {
    let harness = Harness::new("1.0.0.1:3000", &[]);

    let mut buf = BytesMut::new();
    codec::append(
        &mut buf,
        &Message::Alive {
            dst: addr("1.0.0.3:3000"),
            incarnation: Incarnation(1),
        },
    )
    .unwrap();
    buf.extend_from_slice(&[0xff, 0x01]); // bad tag
    let mut second = BytesMut::new();
    codec::append(
        &mut second,
        &Message::Alive {
            dst: addr("1.0.0.4:3000"),
            incarnation: Incarnation(1),
        },
    )
    .unwrap();
    buf.extend_from_slice(&second);

    assert!(harness.engine.dispatch_datagram(&buf).is_err());

    // The record before the bad prefix was processed; the one after was
    // abandoned.
    let members = harness.engine.alive_members();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].address, addr("1.0.0.3:3000"));
}

#[test]
fn test_shutdown_broadcast_announces_departure() {
    let harness = Harness::new("1.0.0.1:3000", &["1.0.0.2:3000", "1.0.0.3:3000"]);

    harness.udp.clear();
    harness.engine.shutdown_broadcast().unwrap();

    let farewells: Vec<(NodeAddress, Message)> = harness
        .sent_messages()
        .into_iter()
        .filter(|(_, message)| {
            matches!(message, Message::Faulty { dst, .. } if *dst == addr("1.0.0.1:3000"))
        })
        .collect();
    assert_eq!(farewells.len(), 2);
}

#[test]
fn test_member_callbacks_fire_under_changes() {
    let added: Arc<Mutex<Vec<NodeAddress>>> = Arc::new(Mutex::new(Vec::new()));
    let removed: Arc<Mutex<Vec<NodeAddress>>> = Arc::new(Mutex::new(Vec::new()));

    let added_sink = added.clone();
    let removed_sink = removed.clone();
    let config = MembershipConfig {
        advertised_address: "1.0.0.1:3000".parse().unwrap(),
        bind_address: "1.0.0.1:3000".parse().unwrap(),
        member_added: Some(Arc::new(move |member| {
            added_sink.lock().push(member.address);
        })),
        member_removed: Some(Arc::new(move |member| {
            removed_sink.lock().push(member.address);
        })),
        ..Default::default()
    };
    let engine = MembershipEngine::new(
        config,
        Arc::new(CaptureTransport::default()),
        Arc::new(CaptureTransport::default()),
        Arc::new(RttTracker::new(Default::default())),
        Arc::new(MembershipMetrics::new()),
    )
    .unwrap();

    let x = addr("1.0.0.9:3000");
    let mut buf = BytesMut::new();
    codec::append(
        &mut buf,
        &Message::Alive {
            dst: x,
            incarnation: Incarnation(1),
        },
    )
    .unwrap();
    engine.dispatch_datagram(&buf).unwrap();
    assert_eq!(added.lock().as_slice(), &[x]);

    buf.clear();
    codec::append(
        &mut buf,
        &Message::Faulty {
            src: addr("1.0.0.2:3000"),
            dst: x,
            incarnation: Incarnation(1),
        },
    )
    .unwrap();
    engine.dispatch_datagram(&buf).unwrap();
    assert_eq!(removed.lock().as_slice(), &[x]);
}
