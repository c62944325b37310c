//! The EMCY producer/consumer.
//!
//! The producer maintains the error register (object 0x1001) and the
//! pre-defined error field (object 0x1003), transmits emergency frames with
//! inhibit-time spacing, and suppresses duplicate active errors. The
//! consumer decodes emergency frames of monitored peers.
//! (Reference: CiA 301, Section 7.2.7)

use crate::frame::CanFrame;
use crate::net::{CanNet, RecvHandle, TimerHandle};
use crate::od::ObjectDictionary;
use crate::types::{COB_ID_EMCY_BASE, NodeId};
use crate::value::Value;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, warn};

/// Emergency error codes used by the core itself.
/// (Reference: CiA 301, Table 26)
pub mod codes {
    /// Error reset or no error.
    pub const ERROR_RESET: u16 = 0x0000;
    /// Generic error.
    pub const GENERIC: u16 = 0x1000;
    /// CAN overrun (objects lost).
    pub const CAN_OVERRUN: u16 = 0x8110;
    /// CAN in error passive mode.
    pub const ERROR_PASSIVE: u16 = 0x8120;
    /// Life guard or heartbeat error.
    pub const LIFE_GUARD: u16 = 0x8130;
    /// Recovered from bus off.
    pub const BUS_OFF_RECOVERED: u16 = 0x8140;
    /// PDO not processed due to length error.
    pub const PDO_LENGTH: u16 = 0x8210;
    /// PDO length exceeded.
    pub const PDO_LENGTH_EXCEEDED: u16 = 0x8220;
    /// Unexpected SYNC data length.
    pub const SYNC_LENGTH: u16 = 0x8240;
    /// RPDO timeout.
    pub const RPDO_TIMEOUT: u16 = 0x8250;
}

/// A decoded emergency message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyMessage {
    /// The producing node, if it could be derived from the COB-ID.
    pub node: Option<NodeId>,
    /// Emergency error code.
    pub code: u16,
    /// Error register (object 0x1001) of the producer.
    pub register: u8,
    /// Manufacturer-specific error field.
    pub vendor: [u8; 5],
}

/// Bits of the error register (object 0x1001).
const REG_GENERIC: u8 = 0x01;
const REG_COMMUNICATION: u8 = 0x10;

/// The EMCY producer.
pub struct EmcyService {
    cob_id: u32,
    /// Inhibit time between consecutive emergency frames, in microseconds.
    inhibit_us: u64,
    /// Time the last frame was sent, used to enforce the inhibit time.
    last_sent_us: Option<u64>,
    /// Frames awaiting the inhibit window.
    pending: VecDeque<[u8; 8]>,
    /// Currently active error codes, most recent first.
    active: Vec<u16>,
    active_service: bool,
    timer: TimerHandle,
}

impl EmcyService {
    pub fn new(timer: TimerHandle) -> Self {
        Self {
            cob_id: 0,
            inhibit_us: 0,
            last_sent_us: None,
            pending: VecDeque::new(),
            active: Vec::new(),
            active_service: false,
            timer,
        }
    }

    /// (Re)configures the producer from objects 0x1014 and 0x1015.
    pub fn start<T: Copy>(&mut self, net: &mut CanNet<T>, od: &ObjectDictionary, node_id: NodeId) {
        self.stop(net);
        let default = if node_id.is_unconfigured() {
            0x8000_0000
        } else {
            COB_ID_EMCY_BASE + u32::from(node_id.raw())
        };
        let cob = od.read_u32(0x1014, 0).unwrap_or(default);
        if cob & 0x8000_0000 != 0 {
            return;
        }
        self.cob_id = cob & 0x7FF;
        // Inhibit time EMCY (0x1015) is in multiples of 100 us.
        self.inhibit_us = u64::from(od.read_u16(0x1015, 0).unwrap_or(0)) * 100;
        self.active_service = true;
    }

    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.timer_stop(self.timer);
        self.pending.clear();
        self.last_sent_us = None;
        self.active_service = false;
    }

    /// Raises an error: updates objects 0x1001/0x1003 and transmits the
    /// emergency frame. Re-raising an already active code is suppressed.
    pub fn push_error<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
        code: u16,
        vendor: [u8; 5],
    ) {
        if self.active.contains(&code) {
            debug!("[EMCY] error {:#06X} already active, suppressed", code);
            return;
        }
        self.active.insert(0, code);
        let register = self.derive_register();
        let _ = od.write_silent(0x1001, 0, Value::Unsigned8(register));
        self.record_history(od, code);
        warn!("[EMCY] error {:#06X} raised, register {:#04X}", code, register);
        self.transmit(net, code, register, vendor);
    }

    /// Clears an active error. When the last error clears, an "error reset"
    /// frame is transmitted.
    pub fn clear_error<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
        code: u16,
    ) {
        let Some(pos) = self.active.iter().position(|&c| c == code) else {
            return;
        };
        self.active.remove(pos);
        let register = self.derive_register();
        let _ = od.write_silent(0x1001, 0, Value::Unsigned8(register));
        if self.active.is_empty() {
            self.transmit(net, codes::ERROR_RESET, register, [0; 5]);
        }
    }

    /// Currently active error codes.
    pub fn active_errors(&self) -> &[u16] {
        &self.active
    }

    /// Flushes pending frames once the inhibit window elapses.
    pub fn on_timer<T: Copy>(&mut self, net: &mut CanNet<T>) {
        while let Some(payload) = self.pending.pop_front() {
            let now = net.time();
            if !self.inhibit_elapsed(now) {
                self.pending.push_front(payload);
                self.arm_inhibit_timer(net, now);
                return;
            }
            self.send_now(net, payload, now);
        }
    }

    fn derive_register(&self) -> u8 {
        if self.active.is_empty() {
            return 0;
        }
        let mut register = REG_GENERIC;
        if self.active.iter().any(|&c| (0x8100..0x9000).contains(&c)) {
            register |= REG_COMMUNICATION;
        }
        register
    }

    /// Shifts the new code into the pre-defined error field (0x1003).
    fn record_history(&self, od: &mut ObjectDictionary, code: u16) {
        let Ok(obj) = od.object_mut(0x1003) else {
            return;
        };
        let capacity = obj.subs().filter(|s| s.sub_index() != 0).count();
        if capacity == 0 {
            return;
        }
        // Shift older entries down, newest in sub-index 1.
        let mut previous: Vec<u32> = Vec::new();
        for sub in obj.subs() {
            if sub.sub_index() == 0 {
                continue;
            }
            if let Value::Unsigned32(v) = sub.value() {
                previous.push(*v);
            }
        }
        let count = od.read_u8(0x1003, 0).unwrap_or(0).min(capacity as u8);
        let Ok(obj) = od.object_mut(0x1003) else {
            return;
        };
        if let Some(first) = obj.sub_mut(1) {
            first.set_value_silent(Value::Unsigned32(u32::from(code)));
        }
        for i in 1..usize::from(count).min(capacity - 1) + 1 {
            if let Some(sub) = obj.sub_mut((i + 1) as u8) {
                if let Some(&v) = previous.get(i - 1) {
                    sub.set_value_silent(Value::Unsigned32(v));
                }
            }
        }
        let new_count = (count + 1).min(capacity as u8);
        if let Some(zero) = obj.sub_mut(0) {
            zero.set_value_silent(Value::Unsigned8(new_count));
        }
    }

    fn transmit<T: Copy>(&mut self, net: &mut CanNet<T>, code: u16, register: u8, vendor: [u8; 5]) {
        if !self.active_service {
            return;
        }
        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&code.to_le_bytes());
        payload[2] = register;
        payload[3..8].copy_from_slice(&vendor);
        let now = net.time();
        if self.inhibit_elapsed(now) && self.pending.is_empty() {
            self.send_now(net, payload, now);
        } else {
            self.pending.push_back(payload);
            self.arm_inhibit_timer(net, now);
        }
    }

    fn inhibit_elapsed(&self, now: u64) -> bool {
        match self.last_sent_us {
            Some(last) => self.inhibit_us == 0 || now >= last.saturating_add(self.inhibit_us),
            None => true,
        }
    }

    fn send_now<T: Copy>(&mut self, net: &mut CanNet<T>, payload: [u8; 8], now: u64) {
        if let Ok(frame) = CanFrame::new(self.cob_id, &payload) {
            let _ = net.send(&frame);
        }
        self.last_sent_us = Some(now);
    }

    fn arm_inhibit_timer<T: Copy>(&self, net: &mut CanNet<T>, now: u64) {
        let deadline = self
            .last_sent_us
            .unwrap_or(now)
            .saturating_add(self.inhibit_us);
        net.timer_start(self.timer, deadline, None);
    }
}

/// The EMCY consumer side: decodes an emergency frame of a peer.
pub fn parse_emcy(frame: &CanFrame) -> Option<EmcyMessage> {
    if frame.is_rtr() || frame.len() < 8 {
        return None;
    }
    let data = frame.data();
    let node = if (0x081..=0x0FF).contains(&frame.id) {
        NodeId::try_from((frame.id - COB_ID_EMCY_BASE) as u8).ok()
    } else {
        None
    };
    Some(EmcyMessage {
        node,
        code: u16::from_le_bytes([data[0], data[1]]),
        register: data[2],
        vendor: [data[3], data[4], data[5], data[6], data[7]],
    })
}

/// A receiver record for a monitored peer's EMCY COB-ID, owned by the node.
pub struct EmcyWatcher {
    pub node: NodeId,
    pub recv: RecvHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{AccessType, Object, SubObject};
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    fn emcy_od(history: u8) -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(Object::var(
            0x1001,
            "Error register",
            SubObject::new(0, "Error register", Value::Unsigned8(0)).access(AccessType::ReadOnly),
        ));
        let mut obj = Object::array(0x1003, "Pre-defined error field");
        for i in 1..=history {
            obj.insert_sub(SubObject::new(i, "Standard error field", Value::Unsigned32(0)));
        }
        if let Some(zero) = obj.sub_mut(0) {
            zero.set_value_silent(Value::Unsigned8(0));
        }
        od.insert(obj);
        od.insert(Object::var(
            0x1014,
            "COB-ID EMCY",
            SubObject::new(0, "COB-ID EMCY", Value::Unsigned32(0x085)),
        ));
        od.insert(Object::var(
            0x1015,
            "Inhibit time EMCY",
            SubObject::new(0, "Inhibit time EMCY", Value::Unsigned16(0)),
        ));
        od
    }

    struct Harness {
        net: CanNet<u8>,
        od: ObjectDictionary,
        emcy: EmcyService,
        sent: Rc<RefCell<alloc::vec::Vec<CanFrame>>>,
    }

    fn get_test_emcy(inhibit_100us: u16) -> Harness {
        let mut net: CanNet<u8> = CanNet::new();
        let sent = Rc::new(RefCell::new(alloc::vec::Vec::new()));
        let sink = Rc::clone(&sent);
        net.set_send_fn(Box::new(move |f: &CanFrame| {
            sink.borrow_mut().push(*f);
            Ok(())
        }));
        let mut od = emcy_od(4);
        od.write_silent(0x1015, 0, Value::Unsigned16(inhibit_100us))
            .unwrap();
        let timer = net.timer_create(0);
        let mut emcy = EmcyService::new(timer);
        emcy.start(&mut net, &od, NodeId::try_from(5).unwrap());
        Harness { net, od, emcy, sent }
    }

    #[test]
    fn test_push_error_transmits_and_updates_register() {
        let mut h = get_test_emcy(0);
        h.emcy
            .push_error(&mut h.net, &mut h.od, codes::LIFE_GUARD, [0; 5]);
        assert_eq!(h.od.read_u8(0x1001, 0), Some(0x11));
        assert_eq!(h.od.read_u32(0x1003, 1), Some(u32::from(codes::LIFE_GUARD)));
        assert_eq!(h.od.read_u8(0x1003, 0), Some(1));
        let frames = h.sent.borrow();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x085);
        assert_eq!(&frames[0].data()[0..3], &[0x30, 0x81, 0x11]);
    }

    #[test]
    fn test_duplicate_error_suppressed() {
        let mut h = get_test_emcy(0);
        h.emcy
            .push_error(&mut h.net, &mut h.od, codes::GENERIC, [0; 5]);
        h.emcy
            .push_error(&mut h.net, &mut h.od, codes::GENERIC, [0; 5]);
        assert_eq!(h.sent.borrow().len(), 1);
    }

    #[test]
    fn test_clearing_last_error_sends_reset() {
        let mut h = get_test_emcy(0);
        h.emcy
            .push_error(&mut h.net, &mut h.od, codes::GENERIC, [0; 5]);
        h.emcy.clear_error(&mut h.net, &mut h.od, codes::GENERIC);
        assert_eq!(h.od.read_u8(0x1001, 0), Some(0));
        let frames = h.sent.borrow();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1].data()[0..2], &[0x00, 0x00]);
    }

    #[test]
    fn test_history_shifts_newest_first() {
        let mut h = get_test_emcy(0);
        h.emcy
            .push_error(&mut h.net, &mut h.od, 0x1000, [0; 5]);
        h.emcy
            .push_error(&mut h.net, &mut h.od, 0x8110, [0; 5]);
        assert_eq!(h.od.read_u32(0x1003, 1), Some(0x8110));
        assert_eq!(h.od.read_u32(0x1003, 2), Some(0x1000));
        assert_eq!(h.od.read_u8(0x1003, 0), Some(2));
    }

    #[test]
    fn test_inhibit_defers_second_frame() {
        let mut h = get_test_emcy(100); // 10 ms
        h.emcy
            .push_error(&mut h.net, &mut h.od, 0x1000, [0; 5]);
        h.emcy
            .push_error(&mut h.net, &mut h.od, 0x8110, [0; 5]);
        assert_eq!(h.sent.borrow().len(), 1);
        // The inhibit timer flushes the queued frame at t = 10 ms.
        h.net.set_time(10_000);
        assert!(h.net.pop_expired().is_some());
        h.emcy.on_timer(&mut h.net);
        assert_eq!(h.sent.borrow().len(), 2);
    }

    #[test]
    fn test_parse_emcy_derives_node() {
        let frame = CanFrame::new(0x085, &[0x30, 0x81, 0x11, 1, 2, 3, 4, 5]).unwrap();
        let msg = parse_emcy(&frame).unwrap();
        assert_eq!(msg.node, NodeId::try_from(5).ok());
        assert_eq!(msg.code, 0x8130);
        assert_eq!(msg.register, 0x11);
        assert_eq!(msg.vendor, [1, 2, 3, 4, 5]);
    }
}
