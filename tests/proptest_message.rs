use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};

use proptest::prelude::*;

use dhcpfailover::config::PeerConfig;
use dhcpfailover::lease::{Lease, LeaseDb, LeaseId, PoolId, QueueSlot};
use dhcpfailover::link::{Link, LinkId};
use dhcpfailover::message::HEADER_SIZE;
use dhcpfailover::{
    BindingState, FailoverOption, Message, MessageType, RejectReason, Relationship, Role,
};

const NOW: i64 = 1_700_000_000;

fn header(message_type: u8, total_length: usize) -> Vec<u8> {
    let mut data = vec![0u8; HEADER_SIZE];
    data[0..2].copy_from_slice(&(total_length as u16).to_be_bytes());
    data[2] = message_type;
    data[3] = HEADER_SIZE as u8;
    data
}

fn sample_message() -> Message {
    let mut message = Message::new(MessageType::BindUpdate)
        .with(FailoverOption::AssignedIpAddress(Ipv4Addr::new(10, 0, 0, 7)))
        .with(FailoverOption::Chaddr(vec![1, 0, 0x11, 0x22, 0x33, 0x44, 0x55]))
        .with(FailoverOption::RelationshipName("peer".to_string()));
    message.xid = 42;
    message.time = 1_000;
    message
}

fn peer_addr() -> SocketAddr {
    "10.0.0.2:647".parse().unwrap()
}

fn relationship_with_leases(count: u8) -> (Relationship, LeaseDb) {
    let config = PeerConfig::new("peer", Role::Primary, "10.0.0.1:647".parse().unwrap(), peer_addr());
    let relationship = Relationship::new(config, None, NOW).unwrap();

    let mut leases = LeaseDb::new();
    let pool = leases.add_pool("lan", "peer");
    for host in 0..count {
        leases
            .add_lease(Lease::new(Ipv4Addr::new(10, 0, 1, host), pool))
            .unwrap();
    }
    (relationship, leases)
}

fn bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..32)
}

fn text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .-]{0,24}"
}

fn fixed_option() -> impl Strategy<Value = FailoverOption> {
    prop_oneof![
        any::<u32>().prop_map(FailoverOption::AddressesTransferred),
        any::<[u8; 4]>().prop_map(|octets| FailoverOption::AssignedIpAddress(Ipv4Addr::from(octets))),
        (1u8..=7).prop_map(|code| FailoverOption::BindingStatus(BindingState::try_from(code).unwrap())),
        any::<u32>().prop_map(FailoverOption::Cltt),
        any::<u8>().prop_map(FailoverOption::DelayedService),
        any::<u16>().prop_map(FailoverOption::IpFlags),
        any::<u32>().prop_map(FailoverOption::LeaseExpiry),
        any::<u32>().prop_map(FailoverOption::MaxUnacked),
        any::<u32>().prop_map(FailoverOption::Mclt),
        any::<u32>().prop_map(FailoverOption::PotentialExpiry),
    ]
}

fn small_option() -> impl Strategy<Value = FailoverOption> {
    prop_oneof![
        any::<u32>().prop_map(FailoverOption::ReceiveTimer),
        any::<u8>().prop_map(FailoverOption::ProtocolVersion),
        any::<u8>().prop_map(|code| FailoverOption::RejectReason(RejectReason::from_code(code))),
        any::<u8>().prop_map(FailoverOption::ServerFlags),
        any::<u8>().prop_map(FailoverOption::ServerState),
        any::<u32>().prop_map(FailoverOption::Stos),
    ]
}

fn variable_option() -> impl Strategy<Value = FailoverOption> {
    prop_oneof![
        bytes().prop_map(FailoverOption::ClientIdentifier),
        bytes().prop_map(FailoverOption::Chaddr),
        bytes().prop_map(FailoverOption::ReplyOptions),
        bytes().prop_map(FailoverOption::RequestOptions),
        bytes().prop_map(FailoverOption::Ddns),
        bytes().prop_map(FailoverOption::Hba),
        bytes().prop_map(FailoverOption::MessageDigest),
        bytes().prop_map(FailoverOption::VendorOptions),
        (30u16.., bytes()).prop_map(|(code, data)| FailoverOption::Unknown(code, data)),
    ]
}

fn text_option() -> impl Strategy<Value = FailoverOption> {
    prop_oneof![
        text().prop_map(FailoverOption::Message),
        text().prop_map(FailoverOption::RelationshipName),
        text().prop_map(FailoverOption::VendorClass),
    ]
}

fn any_option() -> impl Strategy<Value = FailoverOption> {
    prop_oneof![fixed_option(), small_option(), variable_option(), text_option()]
}

/// One option per code, with any digest moved to the end where it must go.
fn well_formed(options: Vec<FailoverOption>) -> Vec<FailoverOption> {
    let mut seen = HashSet::new();
    let mut options: Vec<FailoverOption> = options
        .into_iter()
        .filter(|option| seen.insert(option.option_code()))
        .collect();
    if let Some(position) = options
        .iter()
        .position(|option| matches!(option, FailoverOption::MessageDigest(_)))
    {
        let digest = options.remove(position);
        options.push(digest);
    }
    options
}

#[derive(Debug, Clone)]
enum QueueOp {
    Enqueue(usize),
    Send,
    Ack(usize),
    Requeue,
}

fn queue_op(leases: usize) -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        (0..leases).prop_map(QueueOp::Enqueue),
        Just(QueueOp::Send),
        (0..leases).prop_map(QueueOp::Ack),
        Just(QueueOp::Requeue),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = Message::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_valid_header_with_random_options(
        message_type in 0u8..16,
        options_data in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let mut data = header(message_type, HEADER_SIZE + options_data.len());
        data.extend_from_slice(&options_data);
        let _ = Message::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_random_option_lengths(
        option_code in 0u16..64,
        option_length in any::<u16>(),
        option_data in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let mut options = Vec::new();
        options.extend_from_slice(&option_code.to_be_bytes());
        options.extend_from_slice(&option_length.to_be_bytes());
        options.extend_from_slice(&option_data);

        let mut data = header(MessageType::BindUpdate as u8, HEADER_SIZE + options.len());
        data.extend_from_slice(&options);
        let _ = Message::parse(&data);
    }

    #[test]
    fn roundtrip_encode_parse_preserves_message(
        message_type in 1u8..=12,
        xid in any::<u32>(),
        time in any::<u32>(),
        options in prop::collection::vec(any_option(), 0..12)
    ) {
        let message = Message {
            message_type: MessageType::try_from(message_type).unwrap(),
            xid,
            time,
            options: well_formed(options),
        };
        let encoded = message.encode().unwrap();
        prop_assert_eq!(Message::parse(&encoded).unwrap(), message);
    }

    #[test]
    fn length_mismatch_always_rejected(
        options_data in prop::collection::vec(any::<u8>(), 0..64),
        delta in 1usize..8
    ) {
        let mut data = header(MessageType::Contact as u8, HEADER_SIZE + options_data.len() + delta);
        data.extend_from_slice(&options_data);
        prop_assert!(Message::parse(&data).is_err());
    }

    #[test]
    fn framing_survives_arbitrary_chunking(
        cuts in prop::collection::vec(1usize..40, 0..20)
    ) {
        let encoded = sample_message().encode().unwrap();
        let mut stream = encoded.clone();
        stream.extend_from_slice(&encoded);

        let mut link = Link::new(LinkId(1), peer_addr(), None, false);
        let mut received = Vec::new();
        let mut rest = stream.as_slice();
        for cut in cuts {
            let take = cut.min(rest.len());
            received.extend(link.feed(&rest[..take]).unwrap());
            rest = &rest[take..];
        }
        received.extend(link.feed(rest).unwrap());

        prop_assert_eq!(received.len(), 2);
        for message in received {
            prop_assert_eq!(message, sample_message());
        }
    }

    #[test]
    fn feed_never_panics_on_arbitrary_stream(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..10)
    ) {
        let mut link = Link::new(LinkId(1), peer_addr(), None, false);
        for chunk in chunks {
            if link.feed(&chunk).is_err() {
                prop_assert!(link.is_disconnected());
                break;
            }
        }
    }

    #[test]
    fn lease_is_on_at_most_one_queue(
        ops in prop::collection::vec(queue_op(8), 0..100)
    ) {
        let (mut relationship, mut leases) = relationship_with_leases(8);

        for op in ops {
            match op {
                QueueOp::Enqueue(lease) => {
                    relationship.enqueue_update(&mut leases, LeaseId(lease));
                }
                QueueOp::Send => {
                    if relationship.can_send_update() {
                        relationship.mark_sent(&mut leases);
                    }
                }
                QueueOp::Ack(lease) => {
                    relationship.ack_queue_remove(&mut leases, LeaseId(lease));
                }
                QueueOp::Requeue => relationship.requeue_unacked(&mut leases),
            }

            prop_assert!(relationship.current_unacked() <= relationship.partner.max_unacked as usize);
            for index in 0..8 {
                let id = LeaseId(index);
                let on_update = relationship.update_queue().iter().filter(|queued| **queued == id).count();
                let on_ack = relationship.ack_queue().iter().filter(|queued| **queued == id).count();
                prop_assert!(on_update + on_ack <= 1);
                let expected = match (on_update, on_ack) {
                    (1, 0) => QueueSlot::Update,
                    (0, 1) => QueueSlot::Ack,
                    _ => QueueSlot::Idle,
                };
                prop_assert_eq!(leases[id].queue, expected);
            }
        }
    }
}

#[test]
fn requeue_preserves_send_order() {
    let (mut relationship, mut leases) = relationship_with_leases(4);
    for index in 0..4 {
        relationship.enqueue_update(&mut leases, LeaseId(index));
    }
    relationship.mark_sent(&mut leases);
    relationship.mark_sent(&mut leases);
    relationship.requeue_unacked(&mut leases);

    let order: Vec<usize> = relationship.update_queue().iter().map(|id| id.0).collect();
    assert_eq!(order, vec![0, 1, 2, 3]);
    assert_eq!(leases[LeaseId(0)].pool, PoolId(0));
}
