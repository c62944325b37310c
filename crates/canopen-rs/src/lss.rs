//! Layer Setting Services (CiA 305): address-based configuration of
//! unconfigured slaves, including the slowscan and fastscan discovery
//! algorithms.
//!
//! The master transmits on COB-ID 0x7E5 and listens on 0x7E4; slaves do the
//! opposite. Only one slave may be in configuration state at a time.

use crate::frame::CanFrame;
use crate::net::{CanNet, RecvHandle, TimerHandle};
use crate::types::{COB_ID_LSS_REQ, COB_ID_LSS_RES, NodeId};
use alloc::vec::Vec;
use log::{debug, info, trace};

/// Default wait for a slave response, in microseconds.
pub const DEFAULT_TIMEOUT_US: u64 = 100_000;

/// The 128-bit LSS address of a slave: the contents of its identity object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LssAddress {
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub serial: u32,
}

impl LssAddress {
    fn part(&self, sub: u8) -> u32 {
        match sub {
            0 => self.vendor_id,
            1 => self.product_code,
            2 => self.revision,
            _ => self.serial,
        }
    }

    fn set_part(&mut self, sub: u8, value: u32) {
        match sub {
            0 => self.vendor_id = value,
            1 => self.product_code = value,
            2 => self.revision = value,
            _ => self.serial = value,
        }
    }
}

/// Command specifiers. (Reference: CiA 305, Table 1)
mod cs {
    pub const SWITCH_GLOBAL: u8 = 0x04;
    pub const CONFIGURE_NODE_ID: u8 = 0x11;
    pub const CONFIGURE_BIT_TIMING: u8 = 0x13;
    pub const ACTIVATE_BIT_TIMING: u8 = 0x15;
    pub const STORE_CONFIGURATION: u8 = 0x17;
    pub const SWITCH_SELECTIVE_VENDOR: u8 = 0x40;
    pub const SWITCH_SELECTIVE_PRODUCT: u8 = 0x41;
    pub const SWITCH_SELECTIVE_REVISION: u8 = 0x42;
    pub const SWITCH_SELECTIVE_SERIAL: u8 = 0x43;
    pub const SWITCH_SELECTIVE_RESPONSE: u8 = 0x44;
    pub const IDENTIFY_VENDOR: u8 = 0x46;
    pub const IDENTIFY_PRODUCT: u8 = 0x47;
    pub const IDENTIFY_REVISION_LOW: u8 = 0x48;
    pub const IDENTIFY_REVISION_HIGH: u8 = 0x49;
    pub const IDENTIFY_SERIAL_LOW: u8 = 0x4A;
    pub const IDENTIFY_SERIAL_HIGH: u8 = 0x4B;
    pub const IDENTIFY_NON_CONFIGURED: u8 = 0x4C;
    pub const IDENTIFY_RESPONSE: u8 = 0x4F;
    pub const NON_CONFIGURED_RESPONSE: u8 = 0x50;
    pub const FASTSCAN: u8 = 0x51;
    pub const INQUIRE_VENDOR: u8 = 0x5A;
    pub const INQUIRE_PRODUCT: u8 = 0x5B;
    pub const INQUIRE_REVISION: u8 = 0x5C;
    pub const INQUIRE_SERIAL: u8 = 0x5D;
    pub const INQUIRE_NODE_ID: u8 = 0x5E;
}

/// The LSS switch state of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LssMode {
    #[default]
    Waiting,
    Configuration,
}

fn lss_frame(payload: [u8; 8], cob: u32) -> CanFrame {
    CanFrame::new(cob, &payload).expect("fixed LSS COB-ID")
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

// --- Master ---

/// Results delivered by the master to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LssMasterEvent {
    /// Switch selective finished. `true` if the addressed slave confirmed.
    Switched { ok: bool },
    /// A configure/store request finished; the error code byte is 0 on
    /// success.
    Configured { cs: u8, error: u8 },
    /// An inquiry finished with the returned value.
    Inquired { cs: u8, value: u32 },
    /// At least one slave answered an identify request within the timeout.
    Identified { responded: bool },
    /// Slowscan finished with the single detected address, or `None`.
    SlowscanDone { address: Option<LssAddress> },
    /// Fastscan finished with the single detected address, or `None`.
    FastscanDone { address: Option<LssAddress> },
}

/// Phases of the slowscan bisection: the revision is determined first with
/// the serial range wide open, then the serial with the revision pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlowPhase {
    /// Initial probe of the whole range.
    Presence,
    /// Bisecting the revision.
    Revision,
    /// Bisecting the serial number.
    Serial,
    /// Switch-selective to the narrowed-down address.
    Confirm,
}

/// Phases of the fastscan bit determination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FastPhase {
    /// Initial presence probe (bit check 0x80).
    Presence,
    /// Probing one of the bits 31..=1.
    Probe,
    /// Exact probe (bit check 0) with bit 0 assumed 0; doubles as the
    /// confirmation that advances the slaves to the next address part.
    ProbeZero,
    /// Exact probe after a silent [`FastPhase::ProbeZero`], with bit 0
    /// set to 1.
    ConfirmOne,
}

#[derive(Debug)]
enum MasterState {
    Idle,
    /// Waiting for the confirmation frame of a simple request.
    WaitResponse { cs: u8 },
    /// Waiting for the fourth switch-selective confirmation.
    WaitSwitch,
    /// Waiting to see whether any slave answers an identify request.
    WaitIdentify { responded: bool },
    Slowscan {
        vendor_id: u32,
        product_code: u32,
        /// Revision search range (pinned to one value in the serial phase).
        rev_lo: u32,
        rev_hi: u32,
        /// Serial search range.
        ser_lo: u32,
        ser_hi: u32,
        /// Upper bound of the probed lower half.
        probe_hi: u32,
        responded: bool,
        phase: SlowPhase,
    },
    Fastscan {
        address: LssAddress,
        sub: u8,
        /// The bit under test, 31..=1.
        bit: u8,
        responded: bool,
        phase: FastPhase,
    },
}

/// The LSS master.
pub struct LssMaster {
    state: MasterState,
    timeout_us: u64,
    events: Vec<LssMasterEvent>,
    recv: RecvHandle,
    timer: TimerHandle,
    active: bool,
}

impl LssMaster {
    pub fn new(recv: RecvHandle, timer: TimerHandle) -> Self {
        Self {
            state: MasterState::Idle,
            timeout_us: DEFAULT_TIMEOUT_US,
            events: Vec::new(),
            recv,
            timer,
            active: false,
        }
    }

    pub fn set_timeout(&mut self, timeout_us: u64) {
        self.timeout_us = timeout_us;
    }

    pub fn start<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_start(self.recv, COB_ID_LSS_RES, false);
        self.active = true;
    }

    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_stop(self.recv);
        net.timer_stop(self.timer);
        self.state = MasterState::Idle;
        self.active = false;
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, MasterState::Idle)
    }

    pub fn take_events(&mut self) -> Vec<LssMasterEvent> {
        core::mem::take(&mut self.events)
    }

    /// Switch state global: broadcast, no response.
    pub fn switch_global<T: Copy>(&mut self, net: &mut CanNet<T>, mode: LssMode) {
        let mut payload = [0u8; 8];
        payload[0] = cs::SWITCH_GLOBAL;
        payload[1] = match mode {
            LssMode::Waiting => 0,
            LssMode::Configuration => 1,
        };
        let _ = net.send(&lss_frame(payload, COB_ID_LSS_REQ));
    }

    /// Switch state selective: the slave matching all four address parts
    /// enters configuration state and confirms.
    pub fn switch_selective<T: Copy>(&mut self, net: &mut CanNet<T>, address: &LssAddress) {
        if !self.is_idle() {
            return;
        }
        for (command, value) in [
            (cs::SWITCH_SELECTIVE_VENDOR, address.vendor_id),
            (cs::SWITCH_SELECTIVE_PRODUCT, address.product_code),
            (cs::SWITCH_SELECTIVE_REVISION, address.revision),
            (cs::SWITCH_SELECTIVE_SERIAL, address.serial),
        ] {
            let mut payload = [0u8; 8];
            payload[0] = command;
            payload[1..5].copy_from_slice(&value.to_le_bytes());
            let _ = net.send(&lss_frame(payload, COB_ID_LSS_REQ));
        }
        self.state = MasterState::WaitSwitch;
        net.timer_after(self.timer, self.timeout_us);
    }

    /// Configure the node-ID of the slave in configuration state.
    pub fn configure_node_id<T: Copy>(&mut self, net: &mut CanNet<T>, node_id: NodeId) {
        self.simple_request(net, cs::CONFIGURE_NODE_ID, &[node_id.raw()]);
    }

    /// Configure the bit timing of the slave in configuration state.
    pub fn configure_bit_timing<T: Copy>(&mut self, net: &mut CanNet<T>, table: u8, index: u8) {
        self.simple_request(net, cs::CONFIGURE_BIT_TIMING, &[table, index]);
    }

    /// Announce a bit-rate switch after `delay_ms`. No response; between the
    /// two delay windows no frames may be sent, and the host reconfigures
    /// its own controller.
    pub fn activate_bit_timing<T: Copy>(&mut self, net: &mut CanNet<T>, delay_ms: u16) {
        let mut payload = [0u8; 8];
        payload[0] = cs::ACTIVATE_BIT_TIMING;
        payload[1..3].copy_from_slice(&delay_ms.to_le_bytes());
        let _ = net.send(&lss_frame(payload, COB_ID_LSS_REQ));
    }

    /// Persist the pending configuration of the slave in configuration
    /// state.
    pub fn store_configuration<T: Copy>(&mut self, net: &mut CanNet<T>) {
        self.simple_request(net, cs::STORE_CONFIGURATION, &[]);
    }

    /// Inquire an identity part (or the node-ID) of the slave in
    /// configuration state. `command` is one of the `0x5A..=0x5E` command
    /// specifiers.
    pub fn inquire<T: Copy>(&mut self, net: &mut CanNet<T>, command: u8) {
        self.simple_request(net, command, &[]);
    }

    /// Identify remote slaves within a revision/serial range.
    pub fn identify_remote<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        vendor_id: u32,
        product_code: u32,
        revision: (u32, u32),
        serial: (u32, u32),
    ) {
        if !self.is_idle() {
            return;
        }
        for (command, value) in [
            (cs::IDENTIFY_VENDOR, vendor_id),
            (cs::IDENTIFY_PRODUCT, product_code),
            (cs::IDENTIFY_REVISION_LOW, revision.0),
            (cs::IDENTIFY_REVISION_HIGH, revision.1),
            (cs::IDENTIFY_SERIAL_LOW, serial.0),
            (cs::IDENTIFY_SERIAL_HIGH, serial.1),
        ] {
            let mut payload = [0u8; 8];
            payload[0] = command;
            payload[1..5].copy_from_slice(&value.to_le_bytes());
            let _ = net.send(&lss_frame(payload, COB_ID_LSS_REQ));
        }
        self.state = MasterState::WaitIdentify { responded: false };
        net.timer_after(self.timer, self.timeout_us);
    }

    /// Identify slaves that have no node-ID configured.
    pub fn identify_non_configured<T: Copy>(&mut self, net: &mut CanNet<T>) {
        if !self.is_idle() {
            return;
        }
        let mut payload = [0u8; 8];
        payload[0] = cs::IDENTIFY_NON_CONFIGURED;
        let _ = net.send(&lss_frame(payload, COB_ID_LSS_REQ));
        self.state = MasterState::WaitIdentify { responded: false };
        net.timer_after(self.timer, self.timeout_us);
    }

    /// Slowscan: binary search for a single slave within the given
    /// revision/serial range (vendor and product must be known).
    pub fn slowscan<T: Copy>(&mut self, net: &mut CanNet<T>, lo: &LssAddress, hi: &LssAddress) {
        if !self.is_idle() {
            return;
        }
        self.state = MasterState::Slowscan {
            vendor_id: lo.vendor_id,
            product_code: lo.product_code,
            rev_lo: lo.revision,
            rev_hi: hi.revision,
            ser_lo: lo.serial,
            ser_hi: hi.serial,
            probe_hi: hi.revision,
            responded: false,
            phase: SlowPhase::Presence,
        };
        self.send_identify_probe(
            net,
            lo.vendor_id,
            lo.product_code,
            (lo.revision, hi.revision),
            (lo.serial, hi.serial),
        );
    }

    /// Fastscan: bit-by-bit determination of a single unconfigured slave's
    /// address. 128 probes plus a presence check and per-part confirmations.
    pub fn fastscan<T: Copy>(&mut self, net: &mut CanNet<T>) {
        if !self.is_idle() {
            return;
        }
        self.state = MasterState::Fastscan {
            address: LssAddress::default(),
            sub: 0,
            bit: 31,
            responded: false,
            phase: FastPhase::Presence,
        };
        // Bit check 0x80: every unconfigured slave answers.
        self.send_fastscan_probe(net, 0, 0x80, 0, 0);
    }

    /// Processes a frame on the slave-to-master COB-ID.
    pub fn on_frame<T: Copy>(&mut self, frame: &CanFrame, net: &mut CanNet<T>) {
        if !self.active || frame.is_rtr() || frame.len() < 8 {
            return;
        }
        let data = frame.data();
        match &mut self.state {
            MasterState::Idle => {}
            MasterState::WaitResponse { cs: expected } => {
                if data[0] != *expected {
                    return;
                }
                let event = match data[0] {
                    cs::CONFIGURE_NODE_ID | cs::CONFIGURE_BIT_TIMING | cs::STORE_CONFIGURATION => {
                        LssMasterEvent::Configured {
                            cs: data[0],
                            error: data[1],
                        }
                    }
                    cs::INQUIRE_NODE_ID => LssMasterEvent::Inquired {
                        cs: data[0],
                        value: u32::from(data[1]),
                    },
                    _ => LssMasterEvent::Inquired {
                        cs: data[0],
                        value: u32_at(data, 1),
                    },
                };
                net.timer_stop(self.timer);
                self.state = MasterState::Idle;
                self.events.push(event);
            }
            MasterState::WaitSwitch => {
                if data[0] != cs::SWITCH_SELECTIVE_RESPONSE {
                    return;
                }
                net.timer_stop(self.timer);
                self.state = MasterState::Idle;
                self.events.push(LssMasterEvent::Switched { ok: true });
            }
            MasterState::WaitIdentify { responded } => {
                if data[0] == cs::IDENTIFY_RESPONSE || data[0] == cs::NON_CONFIGURED_RESPONSE {
                    *responded = true;
                }
            }
            MasterState::Slowscan { responded, .. } => {
                if data[0] == cs::IDENTIFY_RESPONSE || data[0] == cs::SWITCH_SELECTIVE_RESPONSE {
                    *responded = true;
                }
            }
            MasterState::Fastscan { responded, .. } => {
                if data[0] == cs::IDENTIFY_RESPONSE {
                    *responded = true;
                }
            }
        }
    }

    /// The response timeout elapsed: advance the active operation.
    pub fn on_timeout<T: Copy>(&mut self, net: &mut CanNet<T>) {
        let state = core::mem::replace(&mut self.state, MasterState::Idle);
        match state {
            MasterState::Idle => {}
            MasterState::WaitResponse { cs } => {
                self.events.push(LssMasterEvent::Configured { cs, error: 0xFF });
            }
            MasterState::WaitSwitch => {
                self.events.push(LssMasterEvent::Switched { ok: false });
            }
            MasterState::WaitIdentify { responded } => {
                self.events.push(LssMasterEvent::Identified { responded });
            }
            MasterState::Slowscan {
                vendor_id,
                product_code,
                rev_lo,
                rev_hi,
                ser_lo,
                ser_hi,
                probe_hi,
                responded,
                phase,
            } => self.slowscan_step(
                net,
                vendor_id,
                product_code,
                (rev_lo, rev_hi),
                (ser_lo, ser_hi),
                probe_hi,
                responded,
                phase,
            ),
            MasterState::Fastscan {
                address,
                sub,
                bit,
                responded,
                phase,
            } => self.fastscan_step(net, address, sub, bit, responded, phase),
        }
    }

    // --- Scan internals ---

    #[allow(clippy::too_many_arguments)]
    fn slowscan_step<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        vendor_id: u32,
        product_code: u32,
        (mut rev_lo, mut rev_hi): (u32, u32),
        (mut ser_lo, mut ser_hi): (u32, u32),
        probe_hi: u32,
        responded: bool,
        phase: SlowPhase,
    ) {
        let mut phase = phase;
        match phase {
            SlowPhase::Presence => {
                if !responded {
                    debug!("[LSS] slowscan: no slave in range");
                    self.events.push(LssMasterEvent::SlowscanDone { address: None });
                    return;
                }
                phase = SlowPhase::Revision;
            }
            SlowPhase::Revision => {
                if responded {
                    rev_hi = probe_hi;
                } else {
                    rev_lo = probe_hi + 1;
                }
            }
            SlowPhase::Serial => {
                if responded {
                    ser_hi = probe_hi;
                } else {
                    ser_lo = probe_hi + 1;
                }
            }
            SlowPhase::Confirm => {
                let address = LssAddress {
                    vendor_id,
                    product_code,
                    revision: rev_lo,
                    serial: ser_lo,
                };
                if responded {
                    info!("[LSS] slowscan found {:?}", address);
                }
                self.events.push(LssMasterEvent::SlowscanDone {
                    address: responded.then_some(address),
                });
                return;
            }
        }
        if phase == SlowPhase::Revision && rev_lo == rev_hi {
            phase = SlowPhase::Serial;
        }
        if phase == SlowPhase::Serial && ser_lo == ser_hi {
            // Narrowed to one address: switch to it selectively.
            let address = LssAddress {
                vendor_id,
                product_code,
                revision: rev_lo,
                serial: ser_lo,
            };
            self.state = MasterState::Slowscan {
                vendor_id,
                product_code,
                rev_lo,
                rev_hi,
                ser_lo,
                ser_hi,
                probe_hi: 0,
                responded: false,
                phase: SlowPhase::Confirm,
            };
            for (command, value) in [
                (cs::SWITCH_SELECTIVE_VENDOR, address.vendor_id),
                (cs::SWITCH_SELECTIVE_PRODUCT, address.product_code),
                (cs::SWITCH_SELECTIVE_REVISION, address.revision),
                (cs::SWITCH_SELECTIVE_SERIAL, address.serial),
            ] {
                let mut payload = [0u8; 8];
                payload[0] = command;
                payload[1..5].copy_from_slice(&value.to_le_bytes());
                let _ = net.send(&lss_frame(payload, COB_ID_LSS_REQ));
            }
            net.timer_after(self.timer, self.timeout_us);
            return;
        }
        // Bisect the active dimension and probe its lower half.
        let (probe_hi, rev_range, ser_range) = if phase == SlowPhase::Revision {
            let mid = rev_lo + (rev_hi - rev_lo) / 2;
            (mid, (rev_lo, mid), (ser_lo, ser_hi))
        } else {
            let mid = ser_lo + (ser_hi - ser_lo) / 2;
            (mid, (rev_lo, rev_hi), (ser_lo, mid))
        };
        self.state = MasterState::Slowscan {
            vendor_id,
            product_code,
            rev_lo,
            rev_hi,
            ser_lo,
            ser_hi,
            probe_hi,
            responded: false,
            phase,
        };
        self.send_identify_probe(net, vendor_id, product_code, rev_range, ser_range);
    }

    fn send_identify_probe<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        vendor_id: u32,
        product_code: u32,
        revision: (u32, u32),
        serial: (u32, u32),
    ) {
        for (command, value) in [
            (cs::IDENTIFY_VENDOR, vendor_id),
            (cs::IDENTIFY_PRODUCT, product_code),
            (cs::IDENTIFY_REVISION_LOW, revision.0),
            (cs::IDENTIFY_REVISION_HIGH, revision.1),
            (cs::IDENTIFY_SERIAL_LOW, serial.0),
            (cs::IDENTIFY_SERIAL_HIGH, serial.1),
        ] {
            let mut payload = [0u8; 8];
            payload[0] = command;
            payload[1..5].copy_from_slice(&value.to_le_bytes());
            let _ = net.send(&lss_frame(payload, COB_ID_LSS_REQ));
        }
        net.timer_after(self.timer, self.timeout_us);
    }

    fn fastscan_step<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        mut address: LssAddress,
        mut sub: u8,
        mut bit: u8,
        responded: bool,
        phase: FastPhase,
    ) {
        let next_part = |sub: u8| if sub < 3 { sub + 1 } else { 0 };
        match phase {
            FastPhase::Presence => {
                if !responded {
                    debug!("[LSS] fastscan: no unconfigured slave");
                    self.events.push(LssMasterEvent::FastscanDone { address: None });
                    return;
                }
                // Start probing bit 31 of the vendor-ID.
            }
            FastPhase::Probe => {
                if !responded {
                    // No slave matches a 0 at this bit: it is 1.
                    let value = address.part(sub) | (1u32 << bit);
                    address.set_part(sub, value);
                }
                if bit == 1 {
                    // The exact probe doubles as the bit-0 test: a response
                    // means bit 0 is 0 and advances the slaves to the next
                    // part.
                    self.state = MasterState::Fastscan {
                        address,
                        sub,
                        bit: 0,
                        responded: false,
                        phase: FastPhase::ProbeZero,
                    };
                    self.send_fastscan_probe(net, address.part(sub), 0, sub, next_part(sub));
                    return;
                }
                bit -= 1;
            }
            FastPhase::ProbeZero => {
                if responded {
                    return self.fastscan_part_done(net, address, sub);
                }
                // Bit 0 is 1: re-issue the exact probe, which must match.
                let value = address.part(sub) | 1;
                address.set_part(sub, value);
                self.state = MasterState::Fastscan {
                    address,
                    sub,
                    bit: 0,
                    responded: false,
                    phase: FastPhase::ConfirmOne,
                };
                self.send_fastscan_probe(net, address.part(sub), 0, sub, next_part(sub));
                return;
            }
            FastPhase::ConfirmOne => {
                if !responded {
                    debug!("[LSS] fastscan: verification of part {} failed", sub);
                    self.events.push(LssMasterEvent::FastscanDone { address: None });
                    return;
                }
                return self.fastscan_part_done(net, address, sub);
            }
        }
        self.state = MasterState::Fastscan {
            address,
            sub,
            bit,
            responded: false,
            phase: FastPhase::Probe,
        };
        self.send_fastscan_probe(net, address.part(sub), bit, sub, next_part(sub));
    }

    /// One address part is fully determined and acknowledged.
    fn fastscan_part_done<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        address: LssAddress,
        sub: u8,
    ) {
        if sub == 3 {
            // The matching slave entered configuration state.
            info!("[LSS] fastscan found {:?}", address);
            self.events.push(LssMasterEvent::FastscanDone {
                address: Some(address),
            });
            return;
        }
        self.state = MasterState::Fastscan {
            address,
            sub: sub + 1,
            bit: 31,
            responded: false,
            phase: FastPhase::Probe,
        };
        let next = if sub + 1 < 3 { sub + 2 } else { 0 };
        self.send_fastscan_probe(net, address.part(sub + 1), 31, sub + 1, next);
    }

    fn send_fastscan_probe<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        id_number: u32,
        bit_check: u8,
        lss_sub: u8,
        lss_next: u8,
    ) {
        let mut payload = [0u8; 8];
        payload[0] = cs::FASTSCAN;
        payload[1..5].copy_from_slice(&id_number.to_le_bytes());
        payload[5] = bit_check;
        payload[6] = lss_sub;
        payload[7] = lss_next;
        trace!(
            "[LSS] fastscan probe sub {} bit {} id {:#010X}",
            lss_sub, bit_check, id_number
        );
        let _ = net.send(&lss_frame(payload, COB_ID_LSS_REQ));
        net.timer_after(self.timer, self.timeout_us);
    }

    fn simple_request<T: Copy>(&mut self, net: &mut CanNet<T>, command: u8, args: &[u8]) {
        if !self.is_idle() {
            return;
        }
        let mut payload = [0u8; 8];
        payload[0] = command;
        payload[1..1 + args.len()].copy_from_slice(args);
        let _ = net.send(&lss_frame(payload, COB_ID_LSS_REQ));
        self.state = MasterState::WaitResponse { cs: command };
        net.timer_after(self.timer, self.timeout_us);
    }
}

// --- Slave ---

/// Notifications the slave role raises towards the owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LssSlaveEvent {
    /// A new pending node-ID was configured; it takes effect at the next
    /// reset-communication.
    PendingNodeId(NodeId),
    /// The master requested persisting the pending configuration.
    StoreRequested,
    /// A bit-rate switch was announced; the host reconfigures the
    /// controller after the delay.
    ActivateBitTiming { delay_ms: u16 },
}

/// The LSS slave role.
pub struct LssSlave {
    address: LssAddress,
    mode: LssMode,
    /// Progress of the switch-selective sequence (number of matched parts).
    selective_matched: u8,
    /// Progress of an identify-remote sequence.
    identify: [Option<u32>; 6],
    /// The sub-part fastscan verifies next.
    fastscan_sub: u8,
    node_id: NodeId,
    pending_node_id: NodeId,
    recv: RecvHandle,
    active: bool,
}

impl LssSlave {
    pub fn new(address: LssAddress, node_id: NodeId, recv: RecvHandle) -> Self {
        Self {
            address,
            mode: LssMode::Waiting,
            selective_matched: 0,
            identify: [None; 6],
            fastscan_sub: 0,
            node_id,
            pending_node_id: node_id,
            recv,
            active: false,
        }
    }

    pub fn start<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_start(self.recv, COB_ID_LSS_REQ, false);
        self.mode = LssMode::Waiting;
        self.selective_matched = 0;
        self.fastscan_sub = 0;
        self.active = true;
    }

    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_stop(self.recv);
        self.active = false;
    }

    pub fn mode(&self) -> LssMode {
        self.mode
    }

    /// The node-ID that takes effect at the next reset-communication.
    pub fn pending_node_id(&self) -> NodeId {
        self.pending_node_id
    }

    /// Called on reset-communication: the pending node-ID becomes current.
    pub fn apply_pending(&mut self) -> NodeId {
        self.node_id = self.pending_node_id;
        self.node_id
    }

    /// Processes a frame on the master-to-slave COB-ID.
    pub fn on_frame<T: Copy>(
        &mut self,
        frame: &CanFrame,
        net: &mut CanNet<T>,
    ) -> Option<LssSlaveEvent> {
        if !self.active || frame.is_rtr() || frame.len() < 8 {
            return None;
        }
        let data = frame.data();
        match data[0] {
            cs::SWITCH_GLOBAL => {
                self.mode = if data[1] == 1 {
                    LssMode::Configuration
                } else {
                    LssMode::Waiting
                };
                None
            }
            command @ cs::SWITCH_SELECTIVE_VENDOR..=cs::SWITCH_SELECTIVE_SERIAL => {
                let part = command - cs::SWITCH_SELECTIVE_VENDOR;
                let value = u32_at(data, 1);
                if part == self.selective_matched && value == self.address.part(part) {
                    self.selective_matched += 1;
                    if self.selective_matched == 4 {
                        self.selective_matched = 0;
                        self.mode = LssMode::Configuration;
                        let mut payload = [0u8; 8];
                        payload[0] = cs::SWITCH_SELECTIVE_RESPONSE;
                        let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
                    }
                } else {
                    self.selective_matched = 0;
                }
                None
            }
            cs::CONFIGURE_NODE_ID => {
                if self.mode != LssMode::Configuration {
                    return None;
                }
                let mut payload = [0u8; 8];
                payload[0] = cs::CONFIGURE_NODE_ID;
                match NodeId::try_from(data[1]) {
                    Ok(node_id) => {
                        self.pending_node_id = node_id;
                        payload[1] = 0;
                        let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
                        Some(LssSlaveEvent::PendingNodeId(node_id))
                    }
                    Err(_) => {
                        payload[1] = 1;
                        let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
                        None
                    }
                }
            }
            cs::CONFIGURE_BIT_TIMING => {
                if self.mode != LssMode::Configuration {
                    return None;
                }
                let mut payload = [0u8; 8];
                payload[0] = cs::CONFIGURE_BIT_TIMING;
                let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
                None
            }
            cs::ACTIVATE_BIT_TIMING => {
                if self.mode != LssMode::Configuration {
                    return None;
                }
                let delay_ms = u16::from_le_bytes([data[1], data[2]]);
                Some(LssSlaveEvent::ActivateBitTiming { delay_ms })
            }
            cs::STORE_CONFIGURATION => {
                if self.mode != LssMode::Configuration {
                    return None;
                }
                let mut payload = [0u8; 8];
                payload[0] = cs::STORE_CONFIGURATION;
                let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
                Some(LssSlaveEvent::StoreRequested)
            }
            command @ cs::INQUIRE_VENDOR..=cs::INQUIRE_NODE_ID => {
                if self.mode != LssMode::Configuration {
                    return None;
                }
                let mut payload = [0u8; 8];
                payload[0] = command;
                match command {
                    cs::INQUIRE_NODE_ID => payload[1] = self.node_id.raw(),
                    _ => {
                        let part = command - cs::INQUIRE_VENDOR;
                        payload[1..5]
                            .copy_from_slice(&self.address.part(part).to_le_bytes());
                    }
                }
                let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
                None
            }
            command @ cs::IDENTIFY_VENDOR..=cs::IDENTIFY_SERIAL_HIGH => {
                let slot = usize::from(command - cs::IDENTIFY_VENDOR);
                self.identify[slot] = Some(u32_at(data, 1));
                if slot == 5 {
                    let matched = self.identify_matches();
                    self.identify = [None; 6];
                    if matched {
                        let mut payload = [0u8; 8];
                        payload[0] = cs::IDENTIFY_RESPONSE;
                        let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
                    }
                }
                None
            }
            cs::IDENTIFY_NON_CONFIGURED => {
                if self.node_id.is_unconfigured() {
                    let mut payload = [0u8; 8];
                    payload[0] = cs::NON_CONFIGURED_RESPONSE;
                    let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
                }
                None
            }
            cs::FASTSCAN => self.on_fastscan(data, net),
            _ => None,
        }
    }

    fn identify_matches(&self) -> bool {
        let (Some(vendor), Some(product), Some(rev_lo), Some(rev_hi), Some(ser_lo), Some(ser_hi)) = (
            self.identify[0],
            self.identify[1],
            self.identify[2],
            self.identify[3],
            self.identify[4],
            self.identify[5],
        ) else {
            return false;
        };
        vendor == self.address.vendor_id
            && product == self.address.product_code
            && (rev_lo..=rev_hi).contains(&self.address.revision)
            && (ser_lo..=ser_hi).contains(&self.address.serial)
    }

    fn on_fastscan<T: Copy>(
        &mut self,
        data: &[u8],
        net: &mut CanNet<T>,
    ) -> Option<LssSlaveEvent> {
        // Only unconfigured slaves in waiting state take part.
        if !self.node_id.is_unconfigured() || self.mode == LssMode::Configuration {
            return None;
        }
        let id_number = u32_at(data, 1);
        let bit_check = data[5];
        let lss_sub = data[6];
        let lss_next = data[7];
        if bit_check == 0x80 {
            // Presence probe: reset and answer.
            self.fastscan_sub = 0;
            let mut payload = [0u8; 8];
            payload[0] = cs::IDENTIFY_RESPONSE;
            let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
            return None;
        }
        if bit_check > 31 || lss_sub > 3 || lss_sub != self.fastscan_sub {
            return None;
        }
        let own = self.address.part(lss_sub);
        // Compare the bits above (and including) the bit under test.
        if (own ^ id_number) >> bit_check != 0 {
            return None;
        }
        let mut payload = [0u8; 8];
        payload[0] = cs::IDENTIFY_RESPONSE;
        let _ = net.send(&lss_frame(payload, COB_ID_LSS_RES));
        if bit_check == 0 {
            self.fastscan_sub = lss_next;
            if lss_sub == 3 {
                // Address fully verified: enter configuration state.
                self.mode = LssMode::Configuration;
                info!("[LSS] fastscan selected this slave");
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    const ADDR_A: LssAddress = LssAddress {
        vendor_id: 1,
        product_code: 2,
        revision: 3,
        serial: 4,
    };
    const ADDR_B: LssAddress = LssAddress {
        vendor_id: 1,
        product_code: 2,
        revision: 3,
        serial: 5,
    };

    struct Bench {
        net: CanNet<u8>,
        master: LssMaster,
        slaves: Vec<LssSlave>,
        master_tx: Rc<RefCell<Vec<CanFrame>>>,
    }

    /// Wires a master and a set of slaves onto one in-memory bus: frames
    /// sent by anyone are delivered to every matching peer synchronously.
    fn bench(addresses: &[LssAddress]) -> Bench {
        let mut net: CanNet<u8> = CanNet::new();
        let master_tx = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&master_tx);
        net.set_send_fn(Box::new(move |f| {
            sink.borrow_mut().push(*f);
            Ok(())
        }));
        let recv = net.recv_create(0);
        let timer = net.timer_create(0);
        let mut master = LssMaster::new(recv, timer);
        master.start(&mut net);
        let mut slaves = Vec::new();
        for (i, addr) in addresses.iter().enumerate() {
            let recv = net.recv_create(10 + i as u8);
            let mut slave = LssSlave::new(*addr, NodeId::UNCONFIGURED, recv);
            slave.start(&mut net);
            slaves.push(slave);
        }
        Bench {
            net,
            master,
            slaves,
            master_tx,
        }
    }

    /// Delivers master-sent frames to the slaves and slave responses back
    /// to the master until the bus is quiet, then fires the master timeout.
    fn pump(bench: &mut Bench) {
        loop {
            let outgoing: Vec<CanFrame> = bench.master_tx.borrow_mut().drain(..).collect();
            if outgoing.is_empty() {
                break;
            }
            for frame in outgoing {
                if frame.id == COB_ID_LSS_REQ {
                    for slave in bench.slaves.iter_mut() {
                        slave.on_frame(&frame, &mut bench.net);
                    }
                } else if frame.id == COB_ID_LSS_RES {
                    bench.master.on_frame(&frame, &mut bench.net);
                }
            }
        }
        // Advance past the response window.
        let now = bench.net.time() + DEFAULT_TIMEOUT_US + 1;
        bench.net.set_time(now);
        while bench.net.pop_expired().is_some() {}
        bench.master.on_timeout(&mut bench.net);
    }

    fn run_scan(bench: &mut Bench, max_rounds: usize) -> Vec<LssMasterEvent> {
        for _ in 0..max_rounds {
            pump(bench);
            let events = bench.master.take_events();
            if !events.is_empty() {
                return events;
            }
        }
        Vec::new()
    }

    #[test]
    fn test_switch_selective_targets_single_slave() {
        let mut b = bench(&[ADDR_A, ADDR_B]);
        b.master.switch_selective(&mut b.net, &ADDR_A);
        pump(&mut b);
        assert_eq!(
            b.master.take_events(),
            alloc::vec![LssMasterEvent::Switched { ok: true }]
        );
        assert_eq!(b.slaves[0].mode(), LssMode::Configuration);
        assert_eq!(b.slaves[1].mode(), LssMode::Waiting);
    }

    #[test]
    fn test_switch_selective_no_match_times_out() {
        let mut b = bench(&[ADDR_B]);
        b.master.switch_selective(&mut b.net, &ADDR_A);
        pump(&mut b);
        assert_eq!(
            b.master.take_events(),
            alloc::vec![LssMasterEvent::Switched { ok: false }]
        );
    }

    #[test]
    fn test_configure_node_id_round_trip() {
        let mut b = bench(&[ADDR_A]);
        b.master.switch_selective(&mut b.net, &ADDR_A);
        pump(&mut b);
        b.master.take_events();
        b.master
            .configure_node_id(&mut b.net, NodeId::try_from(11).unwrap());
        pump(&mut b);
        assert_eq!(
            b.master.take_events(),
            alloc::vec![LssMasterEvent::Configured {
                cs: 0x11,
                error: 0
            }]
        );
        assert_eq!(
            b.slaves[0].pending_node_id(),
            NodeId::try_from(11).unwrap()
        );
    }

    #[test]
    fn test_switch_global() {
        let mut b = bench(&[ADDR_A, ADDR_B]);
        b.master.switch_global(&mut b.net, LssMode::Configuration);
        // Broadcast: no response expected, both slaves switch.
        let frames: Vec<CanFrame> = b.master_tx.borrow_mut().drain(..).collect();
        for frame in frames {
            for slave in b.slaves.iter_mut() {
                slave.on_frame(&frame, &mut b.net);
            }
        }
        assert_eq!(b.slaves[0].mode(), LssMode::Configuration);
        assert_eq!(b.slaves[1].mode(), LssMode::Configuration);
    }

    #[test]
    fn test_identify_non_configured() {
        let mut b = bench(&[ADDR_A]);
        b.master.identify_non_configured(&mut b.net);
        pump(&mut b);
        assert_eq!(
            b.master.take_events(),
            alloc::vec![LssMasterEvent::Identified { responded: true }]
        );
    }

    #[test]
    fn test_fastscan_determines_address() {
        let address = LssAddress {
            vendor_id: 0x0000_0001,
            product_code: 0xDEAD_BEEF,
            revision: 0x0001_0002,
            serial: 0xCAFE_F00D,
        };
        let mut b = bench(&[address]);
        b.master.fastscan(&mut b.net);
        // 1 presence + 4 * (32 bit probes + 1 confirm) rounds.
        let events = run_scan(&mut b, 1 + 4 * 33 + 1);
        assert_eq!(
            events,
            alloc::vec![LssMasterEvent::FastscanDone {
                address: Some(address)
            }]
        );
        assert_eq!(b.slaves[0].mode(), LssMode::Configuration);
    }

    #[test]
    fn test_fastscan_empty_bus() {
        let mut b = bench(&[]);
        b.master.fastscan(&mut b.net);
        let events = run_scan(&mut b, 2);
        assert_eq!(
            events,
            alloc::vec![LssMasterEvent::FastscanDone { address: None }]
        );
    }

    #[test]
    fn test_slowscan_finds_single_slave() {
        let mut b = bench(&[ADDR_A]);
        let lo = LssAddress {
            vendor_id: 1,
            product_code: 2,
            revision: 0,
            serial: 0,
        };
        let hi = LssAddress {
            vendor_id: 1,
            product_code: 2,
            revision: 0xFFFF_FFFF,
            serial: 0xFFFF_FFFF,
        };
        b.master.slowscan(&mut b.net, &lo, &hi);
        // Presence + up to 64 bisection rounds + confirmation.
        let events = run_scan(&mut b, 70);
        assert_eq!(
            events,
            alloc::vec![LssMasterEvent::SlowscanDone {
                address: Some(ADDR_A)
            }]
        );
    }

    #[test]
    fn test_slowscan_empty_range() {
        let mut b = bench(&[]);
        let lo = LssAddress::default();
        let hi = LssAddress {
            revision: 10,
            serial: 10,
            ..LssAddress::default()
        };
        b.master.slowscan(&mut b.net, &lo, &hi);
        let events = run_scan(&mut b, 2);
        assert_eq!(
            events,
            alloc::vec![LssMasterEvent::SlowscanDone { address: None }]
        );
    }

    #[test]
    fn test_pending_node_id_applies_on_reset() {
        let mut b = bench(&[ADDR_A]);
        b.master.switch_selective(&mut b.net, &ADDR_A);
        pump(&mut b);
        b.master
            .configure_node_id(&mut b.net, NodeId::try_from(42).unwrap());
        pump(&mut b);
        let slave = &mut b.slaves[0];
        assert_eq!(slave.apply_pending(), NodeId::try_from(42).unwrap());
    }
}
