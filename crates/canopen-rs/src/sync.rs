//! The SYNC producer/consumer.
//!
//! A SYNC producer periodically transmits the synchronization object; a
//! consumer validates received SYNC frames and reports the counter gating
//! synchronous PDO traffic. (Reference: CiA 301, Section 7.2.5)

use crate::frame::CanFrame;
use crate::net::{CanNet, RecvHandle, TimerHandle};
use crate::od::ObjectDictionary;
use crate::types::COB_ID_SYNC;
use log::trace;

/// Bit 30 of object 0x1005 marks this device as the SYNC producer.
const COB_SYNC_PRODUCE: u32 = 1 << 30;

/// The outcome of a received or produced SYNC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// A valid SYNC with the given counter (`None` if the counter is not
    /// configured).
    Pulse(Option<u8>),
    /// A SYNC frame with an inconsistent data length was received.
    LengthError,
}

/// The SYNC service, acting as producer or consumer per object 0x1005.
pub struct SyncService {
    cob_id: u32,
    producer: bool,
    period_us: u64,
    /// Counter overflow from object 0x1019; 0 disables the counter.
    overflow: u8,
    counter: u8,
    active: bool,
    recv: RecvHandle,
    timer: TimerHandle,
}

impl SyncService {
    pub fn new(recv: RecvHandle, timer: TimerHandle) -> Self {
        Self {
            cob_id: COB_ID_SYNC,
            producer: false,
            period_us: 0,
            overflow: 0,
            counter: 1,
            active: false,
            recv,
            timer,
        }
    }

    /// (Re)configures the service from objects 0x1005, 0x1006 and 0x1019 and
    /// activates it.
    pub fn start<T: Copy>(&mut self, net: &mut CanNet<T>, od: &ObjectDictionary) {
        self.stop(net);
        let cob = od.read_u32(0x1005, 0).unwrap_or(COB_ID_SYNC);
        self.cob_id = cob & 0x7FF;
        self.producer = cob & COB_SYNC_PRODUCE != 0;
        // Communication cycle period is in microseconds.
        self.period_us = u64::from(od.read_u32(0x1006, 0).unwrap_or(0));
        self.overflow = od.read_u8(0x1019, 0).unwrap_or(0);
        self.counter = 1;
        self.active = true;
        if self.producer {
            if self.period_us > 0 {
                let first = net.time().saturating_add(self.period_us);
                net.timer_start(self.timer, first, Some(self.period_us));
            }
        } else {
            net.recv_start(self.recv, self.cob_id, false);
        }
        trace!(
            "[SYNC] started as {} on {:#05X}",
            if self.producer { "producer" } else { "consumer" },
            self.cob_id
        );
    }

    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_stop(self.recv);
        net.timer_stop(self.timer);
        self.active = false;
    }

    pub fn is_producer(&self) -> bool {
        self.producer
    }

    /// Produces one SYNC frame. Called by the period timer, or directly by
    /// the application for acyclic production.
    pub fn on_timer<T: Copy>(&mut self, net: &mut CanNet<T>) -> Option<SyncEvent> {
        if !self.active || !self.producer {
            return None;
        }
        let counter = if self.overflow > 1 {
            let c = self.counter;
            self.counter = if c >= self.overflow { 1 } else { c + 1 };
            Some(c)
        } else {
            None
        };
        let frame = match counter {
            Some(c) => CanFrame::new(self.cob_id, &[c]),
            None => CanFrame::new(self.cob_id, &[]),
        };
        if let Ok(frame) = frame {
            let _ = net.send(&frame);
        }
        Some(SyncEvent::Pulse(counter))
    }

    /// Validates a received SYNC frame.
    pub fn on_frame(&mut self, frame: &CanFrame) -> Option<SyncEvent> {
        if !self.active || self.producer || frame.is_rtr() {
            return None;
        }
        let expect_counter = self.overflow > 1;
        match (expect_counter, frame.len()) {
            (true, 1) => Some(SyncEvent::Pulse(Some(frame.data()[0]))),
            (false, 0) => Some(SyncEvent::Pulse(None)),
            _ => Some(SyncEvent::LengthError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{Object, SubObject};
    use crate::value::Value;
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    fn sync_od(cob: u32, period: u32, overflow: u8) -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(Object::var(
            0x1005,
            "COB-ID SYNC message",
            SubObject::new(0, "COB-ID SYNC message", Value::Unsigned32(cob)),
        ));
        od.insert(Object::var(
            0x1006,
            "Communication cycle period",
            SubObject::new(0, "Communication cycle period", Value::Unsigned32(period)),
        ));
        od.insert(Object::var(
            0x1019,
            "Synchronous counter overflow value",
            SubObject::new(0, "Synchronous counter overflow value", Value::Unsigned8(overflow)),
        ));
        od
    }

    #[test]
    fn test_producer_emits_with_counter() {
        let mut net: CanNet<u8> = CanNet::new();
        let sent = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&sent);
        net.set_send_fn(Box::new(move |f: &CanFrame| {
            sink.borrow_mut().push(*f);
            Ok(())
        }));
        let od = sync_od(COB_ID_SYNC | COB_SYNC_PRODUCE, 1000, 3);
        let recv = net.recv_create(0);
        let timer = net.timer_create(0);
        let mut sync = SyncService::new(recv, timer);
        sync.start(&mut net, &od);

        // Three periods: counters 1, 2, 3, then wrap to 1.
        for expected in [1u8, 2, 3, 1] {
            net.set_time(net.time() + 1000);
            assert!(net.pop_expired().is_some());
            assert_eq!(sync.on_timer(&mut net), Some(SyncEvent::Pulse(Some(expected))));
        }
        let frames = sent.borrow();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].id, 0x080);
        assert_eq!(frames[0].data(), &[1]);
    }

    #[test]
    fn test_consumer_checks_length() {
        let mut net: CanNet<u8> = CanNet::new();
        let od = sync_od(COB_ID_SYNC, 0, 0);
        let recv = net.recv_create(0);
        let timer = net.timer_create(0);
        let mut sync = SyncService::new(recv, timer);
        sync.start(&mut net, &od);

        let ok = CanFrame::new(COB_ID_SYNC, &[]).unwrap();
        assert_eq!(sync.on_frame(&ok), Some(SyncEvent::Pulse(None)));
        let bad = CanFrame::new(COB_ID_SYNC, &[1]).unwrap();
        assert_eq!(sync.on_frame(&bad), Some(SyncEvent::LengthError));
    }
}
