//! End-to-end NMT, error-control, PDO and LSS scenarios over the virtual
//! bus.

mod simulator;

use canopen_rs::lss::{LssAddress, LssMasterEvent};
use canopen_rs::nmt::master::MasterEvent;
use canopen_rs::nmt::{HbEvent, NmtCommand, NmtState};
use canopen_rs::od::{Object, SubObject};
use canopen_rs::pdo::PdoMapEntry;
use canopen_rs::{NodeEvent, NodeId, Value};
use simulator::{VirtualBus, base_od};

fn nid(n: u8) -> NodeId {
    NodeId::try_from(n).unwrap()
}

/// Booting a node emits exactly one boot-up frame and enters
/// pre-operational.
#[test]
fn bootup_emits_frame_and_enters_preop() {
    let mut bus = VirtualBus::new();
    let node = bus.add_node(base_od(0, [1, 2, 3, 4]), nid(7));
    let bootups = bus.frames_with_id(0x707);
    assert_eq!(bootups.len(), 1);
    assert_eq!(bootups[0].frame.data(), &[0x00]);
    assert_eq!(bus.nodes[node].node.nmt_state(), NmtState::PreOperational);
}

/// Every NMT command reaches its destination state in one step; invalid
/// repetitions are no-ops.
#[test]
fn nmt_transitions_follow_the_state_machine() {
    let mut bus = VirtualBus::new();
    let node = bus.add_node(base_od(0, [1, 2, 3, 4]), nid(7));

    let steps = [
        (NmtCommand::Start, NmtState::Operational),
        (NmtCommand::Start, NmtState::Operational),
        (NmtCommand::Stop, NmtState::Stopped),
        (NmtCommand::Start, NmtState::Operational),
        (NmtCommand::EnterPreOperational, NmtState::PreOperational),
        (NmtCommand::Stop, NmtState::Stopped),
        (NmtCommand::EnterPreOperational, NmtState::PreOperational),
    ];
    for (command, expected) in steps {
        bus.nodes[node].node.nmt_request(command, None).unwrap();
        bus.pump();
        assert_eq!(bus.nodes[node].node.nmt_state(), expected);
    }

    // Reset-communication boots again.
    bus.nodes[node]
        .node
        .nmt_request(NmtCommand::ResetCommunication, None)
        .unwrap();
    bus.pump();
    assert_eq!(bus.nodes[node].node.nmt_state(), NmtState::PreOperational);
    assert_eq!(bus.frames_with_id(0x707).len(), 2);
}

/// S3: the heartbeat consumer fires at last heartbeat + consumer time, not
/// earlier, after the producer goes silent.
#[test]
fn heartbeat_consumer_timeout_is_punctual() {
    let mut bus = VirtualBus::new();

    // The producer, node 5, beats every 80 ms.
    let mut producer_od = base_od(0, [5, 5, 5, 5]);
    producer_od.insert(Object::var(
        0x1017,
        "Producer heartbeat time",
        SubObject::new(0, "Producer heartbeat time", Value::Unsigned16(80)),
    ));
    let producer = bus.add_node(producer_od, nid(5));

    // The consumer expects one every 100 ms.
    let mut consumer_od = base_od(0, [1, 1, 1, 1]);
    consumer_od.insert(
        Object::array(0x1016, "Consumer heartbeat time").push_sub(SubObject::new(
            1,
            "Consumer heartbeat time",
            Value::Unsigned32((5 << 16) | 100),
        )),
    );
    let consumer = bus.add_node(consumer_od, nid(1));

    // Three heartbeats arrive: t = 80, 160, 240 ms.
    bus.advance_to(245_000);
    let hb_events: Vec<&NodeEvent> = bus.nodes[consumer]
        .events
        .iter()
        .filter(|e| matches!(e, NodeEvent::Heartbeat(HbEvent::Occurred { .. })))
        .collect();
    assert!(hb_events.is_empty());

    // The producer dies. The consumer must fire at 240 + 100 ms, not
    // before.
    bus.nodes[producer].attached = false;
    bus.advance_to(339_000);
    assert!(
        !bus.nodes[consumer]
            .events
            .iter()
            .any(|e| matches!(e, NodeEvent::Heartbeat(HbEvent::Occurred { .. })))
    );
    bus.advance_to(341_000);
    assert!(
        bus.nodes[consumer]
            .events
            .iter()
            .any(|e| matches!(
                e,
                NodeEvent::Heartbeat(HbEvent::Occurred { node }) if node.raw() == 5
            ))
    );

    // The producer returns: the loss resolves.
    bus.nodes[producer].attached = true;
    bus.advance_to(500_000);
    assert!(
        bus.nodes[consumer]
            .events
            .iter()
            .any(|e| matches!(e, NodeEvent::Heartbeat(HbEvent::Resolved { .. })))
    );
}

/// S4: an event-driven TPDO with a 10 ms inhibit time sends immediately,
/// suppresses changes inside the window and flushes the latest value at the
/// inhibit deadline.
#[test]
fn tpdo_event_with_inhibit_time() {
    let mut bus = VirtualBus::new();
    let mut od = base_od(0, [2, 2, 2, 2]);
    od.insert(Object::var(
        0x6000,
        "Measured value",
        SubObject::new(0, "Measured value", Value::Unsigned16(0x1111)).pdo_mappable(),
    ));
    od.insert(
        Object::record(0x1800, "TPDO communication parameter")
            .push_sub(SubObject::new(
                1,
                "COB-ID used by TPDO",
                Value::Unsigned32(0x182),
            ))
            .push_sub(SubObject::new(2, "Transmission type", Value::Unsigned8(255)))
            // 10 ms in multiples of 100 us.
            .push_sub(SubObject::new(3, "Inhibit time", Value::Unsigned16(100))),
    );
    od.insert(
        Object::array(0x1A00, "TPDO mapping parameter").push_sub(SubObject::new(
            1,
            "Mapping entry 1",
            Value::Unsigned32(
                PdoMapEntry {
                    index: 0x6000,
                    sub_index: 0,
                    bits: 16,
                }
                .to_u32(),
            ),
        )),
    );
    let node = bus.add_node(od, nid(2));
    bus.add_node(base_od(0, [9, 9, 9, 9]), nid(9)); // a listener
    bus.nodes[node]
        .node
        .nmt_request(NmtCommand::Start, None)
        .unwrap();
    bus.pump();

    // t = 0: the mapped value changes; one frame goes out immediately.
    bus.nodes[node]
        .node
        .write(0x6000, 0, Value::Unsigned16(0xAAAA))
        .unwrap();
    bus.pump();
    let frames = bus.frames_with_id(0x182);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].frame.data(), &0xAAAAu16.to_le_bytes());

    // t = 3 ms: another change; nothing is sent.
    bus.advance_to(3_000);
    bus.nodes[node]
        .node
        .write(0x6000, 0, Value::Unsigned16(0xBBBB))
        .unwrap();
    bus.pump();
    assert_eq!(bus.frames_with_id(0x182).len(), 1);

    // t = 10 ms: exactly one frame with the latest value.
    bus.advance_to(10_000);
    let frames = bus.frames_with_id(0x182);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].time_us, 10_000);
    assert_eq!(frames[1].frame.data(), &0xBBBBu16.to_le_bytes());
}

/// SYNC-driven PDO delivery: the producer's pulse triggers a cyclic TPDO on
/// node 2 whose frame lands in node 3's dictionary via a synchronous RPDO
/// on the next pulse.
#[test]
fn sync_gated_pdo_roundtrip() {
    let mut bus = VirtualBus::new();

    // Node 1 produces SYNC every 50 ms.
    let mut sync_od = base_od(0, [1, 1, 1, 1]);
    sync_od.insert(Object::var(
        0x1005,
        "COB-ID SYNC message",
        SubObject::new(0, "COB-ID SYNC message", Value::Unsigned32(0x80 | (1 << 30))),
    ));
    sync_od.insert(Object::var(
        0x1006,
        "Communication cycle period",
        SubObject::new(0, "Communication cycle period", Value::Unsigned32(50_000)),
    ));
    let producer = bus.add_node(sync_od, nid(1));

    // Node 2 transmits 0x6000 on every SYNC.
    let mut tx_od = base_od(0, [2, 2, 2, 2]);
    tx_od.insert(Object::var(
        0x6000,
        "Value",
        SubObject::new(0, "Value", Value::Unsigned16(0xCAFE)).pdo_mappable(),
    ));
    tx_od.insert(
        Object::record(0x1800, "TPDO communication parameter")
            .push_sub(SubObject::new(1, "COB-ID used by TPDO", Value::Unsigned32(0x182)))
            .push_sub(SubObject::new(2, "Transmission type", Value::Unsigned8(1))),
    );
    tx_od.insert(
        Object::array(0x1A00, "TPDO mapping parameter").push_sub(SubObject::new(
            1,
            "Mapping entry 1",
            Value::Unsigned32(PdoMapEntry { index: 0x6000, sub_index: 0, bits: 16 }.to_u32()),
        )),
    );
    let tx = bus.add_node(tx_od, nid(2));

    // Node 3 receives into 0x6200 on SYNC.
    let mut rx_od = base_od(0, [3, 3, 3, 3]);
    rx_od.insert(Object::var(
        0x6200,
        "Mirrored value",
        SubObject::new(0, "Mirrored value", Value::Unsigned16(0)).pdo_mappable(),
    ));
    rx_od.insert(
        Object::record(0x1400, "RPDO communication parameter")
            .push_sub(SubObject::new(1, "COB-ID used by RPDO", Value::Unsigned32(0x182)))
            .push_sub(SubObject::new(2, "Transmission type", Value::Unsigned8(1))),
    );
    rx_od.insert(
        Object::array(0x1600, "RPDO mapping parameter").push_sub(SubObject::new(
            1,
            "Mapping entry 1",
            Value::Unsigned32(PdoMapEntry { index: 0x6200, sub_index: 0, bits: 16 }.to_u32()),
        )),
    );
    let rx = bus.add_node(rx_od, nid(3));

    for i in [producer, tx, rx] {
        bus.nodes[i].node.nmt_request(NmtCommand::Start, None).unwrap();
    }
    bus.pump();

    // First SYNC at 50 ms: node 2 transmits, node 3 buffers.
    bus.advance_to(50_000);
    assert_eq!(bus.frames_with_id(0x182).len(), 1);
    // Second SYNC at 100 ms: node 3 actuates the buffered frame.
    bus.advance_to(100_000);
    assert_eq!(
        bus.nodes[rx].node.dictionary().read_u16(0x6200, 0),
        Some(0xCAFE)
    );
}

fn master_od(slave: u8, expected_device_type: u32) -> canopen_rs::ObjectDictionary {
    let mut od = base_od(0, [1, 1, 1, 1]);
    od.insert(Object::var(
        0x1F80,
        "NMT startup",
        SubObject::new(0, "NMT startup", Value::Unsigned32(0x01)),
    ));
    let mut assignment = Object::array(0x1F81, "Slave assignment");
    assignment.insert_sub(SubObject::new(
        slave,
        "Slave assignment",
        Value::Unsigned32(0x05), // slave, boot at startup
    ));
    od.insert(assignment);
    let mut dt = Object::array(0x1F84, "Device type identification");
    dt.insert_sub(SubObject::new(
        slave,
        "Expected device type",
        Value::Unsigned32(expected_device_type),
    ));
    od.insert(dt);
    od
}

/// S6: booting a slave whose device type does not match the expected value
/// reports the CiA 302-2 status letter and does not start the slave.
#[test]
fn master_boot_slave_device_type_mismatch() {
    let mut bus = VirtualBus::new();
    // Slave 2 reports device type 0x5678.
    let slave = bus.add_node(base_od(0x5678, [2, 2, 2, 2]), nid(2));
    // The master expects 0x1234.
    let master = bus.add_node(master_od(2, 0x1234), nid(1));
    bus.advance(10_000);

    let boot_events: Vec<&NodeEvent> = bus.nodes[master]
        .events
        .iter()
        .filter(|e| matches!(e, NodeEvent::Master(MasterEvent::BootCompleted { .. })))
        .collect();
    assert_eq!(boot_events.len(), 1);
    assert!(matches!(
        boot_events[0],
        NodeEvent::Master(MasterEvent::BootCompleted {
            node,
            status: Some('C'),
        }) if node.raw() == 2
    ));
    // The slave was never started.
    assert_eq!(bus.nodes[slave].node.nmt_state(), NmtState::PreOperational);
}

/// A matching identity boots and starts the slave.
#[test]
fn master_boots_and_starts_matching_slave() {
    let mut bus = VirtualBus::new();
    let slave = bus.add_node(base_od(0x1234, [2, 2, 2, 2]), nid(2));
    let master = bus.add_node(master_od(2, 0x1234), nid(1));
    bus.advance(50_000);

    assert!(bus.nodes[master].events.iter().any(|e| matches!(
        e,
        NodeEvent::Master(MasterEvent::BootCompleted { status: None, .. })
    )));
    assert_eq!(bus.nodes[slave].node.nmt_state(), NmtState::Operational);
    // The autostarting master is operational too.
    assert_eq!(bus.nodes[master].node.nmt_state(), NmtState::Operational);
}

/// S5: switch selective addresses exactly one of two slaves differing only
/// in the serial number.
#[test]
fn lss_switch_selective_targets_one_slave() {
    let mut bus = VirtualBus::new();
    let a = bus.add_node(base_od(0, [1, 2, 3, 4]), NodeId::UNCONFIGURED);
    let b = bus.add_node(base_od(0, [1, 2, 3, 5]), NodeId::UNCONFIGURED);
    let master = bus.add_node(master_od(2, 0), nid(1));

    bus.nodes[master]
        .node
        .lss_switch_selective(&LssAddress {
            vendor_id: 1,
            product_code: 2,
            revision: 3,
            serial: 4,
        })
        .unwrap();
    // The response arrives synchronously; the timeout only closes the
    // operation.
    bus.advance(200_000);

    let switched: Vec<&NodeEvent> = bus.nodes[master]
        .events
        .iter()
        .filter(|e| matches!(e, NodeEvent::LssMaster(LssMasterEvent::Switched { .. })))
        .collect();
    assert_eq!(switched.len(), 1);
    assert!(matches!(
        switched[0],
        NodeEvent::LssMaster(LssMasterEvent::Switched { ok: true })
    ));
    let _ = (a, b);
}

/// Fastscan over the virtual bus discovers the single unconfigured slave
/// and a subsequent node-ID configuration takes effect at reset.
#[test]
fn lss_fastscan_configures_slave() {
    let mut bus = VirtualBus::new();
    let address = LssAddress {
        vendor_id: 0x0000_0099,
        product_code: 0x1234_5678,
        revision: 0x0001_0000,
        serial: 0xDEAD_BEEF,
    };
    let slave = bus.add_node(
        base_od(0, [address.vendor_id, address.product_code, address.revision, address.serial]),
        NodeId::UNCONFIGURED,
    );
    let master = bus.add_node(master_od(2, 0), nid(1));

    bus.nodes[master].node.lss_fastscan().unwrap();
    // 129 probes plus confirmations at 100 ms response windows each.
    bus.advance(20_000_000);
    assert!(bus.nodes[master].events.iter().any(|e| matches!(
        e,
        NodeEvent::LssMaster(LssMasterEvent::FastscanDone { address: Some(found) })
            if *found == address
    )));

    bus.nodes[master].node.lss_configure_node_id(nid(42)).unwrap();
    bus.advance(200_000);
    assert_eq!(bus.nodes[slave].node.pending_node_id(), nid(42));

    // The pending ID takes effect at reset-communication.
    bus.nodes[slave]
        .node
        .nmt_request(NmtCommand::ResetCommunication, None)
        .unwrap();
    bus.pump();
    assert_eq!(bus.nodes[slave].node.node_id(), nid(42));
    // The boot-up frame went out on the new error-control COB-ID.
    assert_eq!(bus.frames_with_id(0x700 + 42).len(), 1);
}

/// An EMCY raised on one node is observed by a watcher on another.
#[test]
fn emcy_propagates_to_watcher() {
    let mut bus = VirtualBus::new();
    let mut producer_od = base_od(0, [5, 5, 5, 5]);
    producer_od.insert(Object::var(
        0x1014,
        "COB-ID EMCY",
        SubObject::new(0, "COB-ID EMCY", Value::Unsigned32(0x85)),
    ));
    let producer = bus.add_node(producer_od, nid(5));
    let watcher = bus.add_node(base_od(0, [1, 1, 1, 1]), nid(1));
    bus.nodes[watcher].node.emcy_watch(nid(5));

    bus.nodes[producer].node.emcy_push(0x8130, [1, 2, 3, 4, 5]);
    bus.pump();

    assert!(bus.nodes[watcher].events.iter().any(|e| matches!(
        e,
        NodeEvent::Emcy(msg)
            if msg.code == 0x8130 && msg.node == Some(nid(5)) && msg.vendor == [1, 2, 3, 4, 5]
    )));
    // The producer's error register reflects the communication error.
    assert_eq!(
        bus.nodes[producer].node.dictionary().read_u8(0x1001, 0),
        Some(0x11)
    );
}
