//! The TIME producer/consumer. (Reference: CiA 301, Section 7.2.6)

use crate::frame::CanFrame;
use crate::net::{CanNet, RecvHandle, TimerHandle};
use crate::od::ObjectDictionary;
use crate::types::COB_ID_TIME;
use crate::value::{DataType, TimeOfDay, Value};

/// Bit 31 of object 0x1012: this device consumes TIME messages.
const COB_TIME_CONSUME: u32 = 1 << 31;
/// Bit 30 of object 0x1012: this device produces TIME messages.
const COB_TIME_PRODUCE: u32 = 1 << 30;

/// The TIME service.
pub struct TimeService {
    cob_id: u32,
    producer: bool,
    consumer: bool,
    active: bool,
    /// Production interval; 0 means production is application-driven.
    period_us: u64,
    /// The timestamp transmitted on periodic production.
    current: TimeOfDay,
    recv: RecvHandle,
    timer: TimerHandle,
}

impl TimeService {
    pub fn new(recv: RecvHandle, timer: TimerHandle) -> Self {
        Self {
            cob_id: COB_ID_TIME,
            producer: false,
            consumer: false,
            active: false,
            period_us: 0,
            current: TimeOfDay::default(),
            recv,
            timer,
        }
    }

    /// (Re)configures the service from object 0x1012 and activates it.
    pub fn start<T: Copy>(&mut self, net: &mut CanNet<T>, od: &ObjectDictionary) {
        self.stop(net);
        let Some(cob) = od.read_u32(0x1012, 0) else {
            return;
        };
        self.cob_id = cob & 0x7FF;
        self.producer = cob & COB_TIME_PRODUCE != 0;
        self.consumer = cob & COB_TIME_CONSUME != 0;
        self.active = true;
        if self.consumer {
            net.recv_start(self.recv, self.cob_id, false);
        }
        if self.producer && self.period_us > 0 {
            let first = net.time().saturating_add(self.period_us);
            net.timer_start(self.timer, first, Some(self.period_us));
        }
    }

    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_stop(self.recv);
        net.timer_stop(self.timer);
        self.active = false;
    }

    /// Enables periodic production with the given interval and reference
    /// timestamp. Takes effect on the next [`TimeService::start`].
    pub fn set_production(&mut self, period_us: u64, reference: TimeOfDay) {
        self.period_us = period_us;
        self.current = reference;
    }

    /// Transmits one TIME frame carrying `stamp`.
    pub fn produce<T: Copy>(&mut self, net: &mut CanNet<T>, stamp: TimeOfDay) {
        if !self.active || !self.producer {
            return;
        }
        self.current = stamp;
        let bytes = Value::TimeOfDay(stamp).to_bytes();
        if let Ok(frame) = CanFrame::new(self.cob_id, &bytes) {
            let _ = net.send(&frame);
        }
    }

    /// Periodic production: advances the reference by the period and sends.
    pub fn on_timer<T: Copy>(&mut self, net: &mut CanNet<T>) {
        let mut stamp = self.current;
        let mut millis = u64::from(stamp.millis) + self.period_us / 1000;
        const DAY_MS: u64 = 24 * 60 * 60 * 1000;
        while millis >= DAY_MS {
            millis -= DAY_MS;
            stamp.days = stamp.days.wrapping_add(1);
        }
        stamp.millis = millis as u32;
        self.produce(net, stamp);
    }

    /// Decodes a received TIME frame.
    pub fn on_frame(&self, frame: &CanFrame) -> Option<TimeOfDay> {
        if !self.active || !self.consumer || frame.is_rtr() {
            return None;
        }
        match Value::from_bytes(DataType::TimeOfDay, frame.data()) {
            Ok(Value::TimeOfDay(stamp)) => Some(stamp),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{Object, SubObject};
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    fn time_od(cob: u32) -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(Object::var(
            0x1012,
            "COB-ID time stamp object",
            SubObject::new(0, "COB-ID time stamp object", Value::Unsigned32(cob)),
        ));
        od
    }

    #[test]
    fn test_producer_sends_six_byte_frame() {
        let mut net: CanNet<u8> = CanNet::new();
        let sent = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&sent);
        net.set_send_fn(Box::new(move |f: &CanFrame| {
            sink.borrow_mut().push(*f);
            Ok(())
        }));
        let od = time_od(COB_ID_TIME | COB_TIME_PRODUCE);
        let recv = net.recv_create(0);
        let timer = net.timer_create(0);
        let mut time = TimeService::new(recv, timer);
        time.start(&mut net, &od);
        time.produce(
            &mut net,
            TimeOfDay {
                millis: 1000,
                days: 2,
            },
        );
        let frames = sent.borrow();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x100);
        assert_eq!(frames[0].len(), 6);
    }

    #[test]
    fn test_consumer_decodes_stamp() {
        let mut net: CanNet<u8> = CanNet::new();
        let od = time_od(COB_ID_TIME | COB_TIME_CONSUME);
        let recv = net.recv_create(0);
        let timer = net.timer_create(0);
        let mut time = TimeService::new(recv, timer);
        time.start(&mut net, &od);

        let stamp = TimeOfDay {
            millis: 0x00AB_CDEF,
            days: 777,
        };
        let frame = CanFrame::new(COB_ID_TIME, &Value::TimeOfDay(stamp).to_bytes()).unwrap();
        assert_eq!(time.on_frame(&frame), Some(stamp));
        // A producer-only service ignores frames.
        let od = time_od(COB_ID_TIME | COB_TIME_PRODUCE);
        time.start(&mut net, &od);
        assert_eq!(time.on_frame(&frame), None);
    }
}
