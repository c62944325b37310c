//! A virtual CAN bus connecting several nodes for integration tests.

use canopen_rs::od::{AccessType, Object, ObjectDictionary, SubObject};
use canopen_rs::{CanFrame, Node, NodeEvent, NodeId, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A frame on the virtual bus, with its transmission time.
#[derive(Debug, Clone)]
pub struct TracedFrame {
    pub time_us: u64,
    pub src: usize,
    pub frame: CanFrame,
}

/// Wraps a [`Node`] and the outbox its send hook fills.
pub struct NodeHarness {
    pub node: Node,
    outbox: Rc<RefCell<VecDeque<CanFrame>>>,
    pub events: Vec<NodeEvent>,
    /// A detached node no longer receives or transmits.
    pub attached: bool,
}

impl NodeHarness {
    pub fn new(od: ObjectDictionary, node_id: NodeId) -> Self {
        let mut node = Node::new(od, node_id).expect("valid node");
        let outbox = Rc::new(RefCell::new(VecDeque::new()));
        let sink = Rc::clone(&outbox);
        node.set_send_fn(Box::new(move |frame| {
            sink.borrow_mut().push_back(*frame);
            Ok(())
        }));
        Self {
            node,
            outbox,
            events: Vec::new(),
            attached: true,
        }
    }

    fn drain_outbox(&mut self) -> Vec<CanFrame> {
        self.outbox.borrow_mut().drain(..).collect()
    }

    fn collect_events(&mut self) {
        self.events.extend(self.node.take_events());
    }
}

/// The virtual network: owns the nodes, the clock and the frame trace.
pub struct VirtualBus {
    pub nodes: Vec<NodeHarness>,
    pub time_us: u64,
    pub trace: Vec<TracedFrame>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            time_us: 0,
            trace: Vec::new(),
        }
    }

    /// Adds a node and boots it. Returns its index.
    pub fn add_node(&mut self, od: ObjectDictionary, node_id: NodeId) -> usize {
        let mut harness = NodeHarness::new(od, node_id);
        harness.node.start();
        self.nodes.push(harness);
        let index = self.nodes.len() - 1;
        self.pump();
        index
    }

    /// Delivers every pending frame to every other attached node, repeating
    /// until the bus is quiet.
    pub fn pump(&mut self) {
        loop {
            let mut any = false;
            for src in 0..self.nodes.len() {
                if !self.nodes[src].attached {
                    self.nodes[src].drain_outbox();
                    continue;
                }
                let frames = self.nodes[src].drain_outbox();
                for frame in frames {
                    any = true;
                    self.trace.push(TracedFrame {
                        time_us: self.time_us,
                        src,
                        frame,
                    });
                    for dst in 0..self.nodes.len() {
                        if dst != src && self.nodes[dst].attached {
                            self.nodes[dst].node.recv(&frame);
                        }
                    }
                }
            }
            if !any {
                break;
            }
        }
        for node in &mut self.nodes {
            node.collect_events();
        }
    }

    /// Advances the shared clock to `target_us`, firing every timer at its
    /// exact deadline and pumping the bus after each step.
    pub fn advance_to(&mut self, target_us: u64) {
        while self.time_us < target_us {
            let next = self
                .nodes
                .iter()
                .filter(|n| n.attached)
                .filter_map(|n| n.node.next_deadline())
                .min()
                .map(|d| d.max(self.time_us + 1))
                .unwrap_or(target_us)
                .min(target_us);
            self.time_us = next;
            for node in &mut self.nodes {
                if node.attached {
                    node.node.set_time(next);
                }
            }
            self.pump();
        }
    }

    /// Advances the clock by `delta_us`.
    pub fn advance(&mut self, delta_us: u64) {
        self.advance_to(self.time_us + delta_us);
    }

    /// Frames with the given CAN-ID seen so far, oldest first.
    pub fn frames_with_id(&self, id: u32) -> Vec<&TracedFrame> {
        self.trace.iter().filter(|t| t.frame.id == id).collect()
    }
}

/// A minimal dictionary every CANopen device carries: device type, error
/// register and the identity object.
pub fn base_od(device_type: u32, identity: [u32; 4]) -> ObjectDictionary {
    let mut od = ObjectDictionary::new();
    od.insert(Object::var(
        0x1000,
        "Device type",
        SubObject::new(0, "Device type", Value::Unsigned32(device_type))
            .access(AccessType::ReadOnly),
    ));
    od.insert(Object::var(
        0x1001,
        "Error register",
        SubObject::new(0, "Error register", Value::Unsigned8(0)).access(AccessType::ReadOnly),
    ));
    let mut id = Object::record(0x1018, "Identity object");
    let names = ["Vendor-ID", "Product code", "Revision number", "Serial number"];
    for (i, (value, name)) in identity.iter().zip(names).enumerate() {
        id.insert_sub(
            SubObject::new((i + 1) as u8, name, Value::Unsigned32(*value))
                .access(AccessType::ReadOnly),
        );
    }
    od.insert(id);
    od
}

/// Adds an SDO client parameter record (object 0x1280) targeting `server`.
pub fn add_csdo_params(od: &mut ObjectDictionary, server: u8) {
    od.insert(
        Object::record(0x1280, "SDO client parameter")
            .push_sub(SubObject::new(
                1,
                "COB-ID client to server",
                Value::Unsigned32(0x600 + u32::from(server)),
            ))
            .push_sub(SubObject::new(
                2,
                "COB-ID server to client",
                Value::Unsigned32(0x580 + u32::from(server)),
            ))
            .push_sub(SubObject::new(
                3,
                "Node-ID of the SDO server",
                Value::Unsigned8(server),
            )),
    );
}
