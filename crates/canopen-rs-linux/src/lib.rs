//! SocketCAN backend for `canopen-rs`.
//!
//! Implements the driver contract of the core: installs the send hook on a
//! node, delivers received frames one at a time, feeds bus errors, and
//! drives the node's clock from the OS monotonic clock. The whole core runs
//! on the thread that calls [`SocketCanDriver::poll`].

use canopen_rs::frame::{BusErrorFlags, BusErrorFrame, BusState, CanFlags};
use canopen_rs::{CanFrame, CanOpenError, Node};
use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised by the SocketCAN backend.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to open CAN interface {interface}: {source}")]
    Open {
        interface: String,
        source: std::io::Error,
    },
    #[error("I/O error on CAN interface: {0}")]
    Io(#[from] std::io::Error),
}

/// A CANopen driver bound to one SocketCAN interface.
pub struct SocketCanDriver {
    socket: Rc<RefCell<CanSocket>>,
    epoch: Instant,
}

impl SocketCanDriver {
    /// Opens the interface (e.g. `"can0"`) in non-blocking mode.
    pub fn open(interface: &str) -> Result<Self, DriverError> {
        let socket = CanSocket::open(interface).map_err(|e| DriverError::Open {
            interface: interface.into(),
            source: e.into(),
        })?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Rc::new(RefCell::new(socket)),
            epoch: Instant::now(),
        })
    }

    /// Installs this driver's send hook on a node. Call before
    /// `Node::start`.
    pub fn attach(&self, node: &mut Node) {
        let socket = Rc::clone(&self.socket);
        node.set_send_fn(Box::new(move |frame| {
            let wire = to_socketcan(frame).ok_or(CanOpenError::FrameTooLarge)?;
            socket
                .borrow()
                .write_frame(&wire)
                .map_err(|_| CanOpenError::IoError)
        }));
    }

    /// Microseconds elapsed since the driver was opened; the time base of
    /// the node's clock.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// One scheduler iteration: advances the node's clock, delivers every
    /// readable frame, and returns how long the caller may sleep before the
    /// next timer is due.
    pub fn poll(&self, node: &mut Node) -> Result<Duration, DriverError> {
        node.set_time(self.now_us());
        loop {
            let result = self.socket.borrow().read_frame();
            match result {
                Ok(socketcan::CanFrame::Data(frame)) => {
                    if let Some(frame) = from_socketcan_data(&frame) {
                        node.recv(&frame);
                    }
                }
                Ok(socketcan::CanFrame::Remote(frame)) => {
                    if let Ok(rtr) = CanFrame::rtr(frame.raw_id(), frame.dlc() as u8) {
                        node.recv(&rtr);
                    }
                }
                Ok(socketcan::CanFrame::Error(frame)) => {
                    node.on_bus_error(&map_error_frame(&frame));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        let now = self.now_us();
        let sleep = match node.next_deadline() {
            Some(deadline) if deadline > now => Duration::from_micros(deadline - now),
            Some(_) => Duration::ZERO,
            None => Duration::from_millis(10),
        };
        Ok(sleep)
    }

    /// Runs the node until the process is interrupted.
    pub fn run(&self, node: &mut Node) -> Result<(), DriverError> {
        loop {
            let sleep = self.poll(node)?;
            if !sleep.is_zero() {
                std::thread::sleep(sleep.min(Duration::from_millis(10)));
            }
        }
    }
}

fn to_socketcan(frame: &CanFrame) -> Option<socketcan::CanFrame> {
    let id: socketcan::Id = if frame.flags.contains(CanFlags::IDE) {
        socketcan::ExtendedId::new(frame.id)?.into()
    } else {
        socketcan::StandardId::new(frame.id as u16)?.into()
    };
    if frame.is_rtr() {
        socketcan::CanRemoteFrame::new_remote(id, frame.len())
            .map(socketcan::CanFrame::Remote)
    } else {
        socketcan::CanDataFrame::new(id, frame.data()).map(socketcan::CanFrame::Data)
    }
}

fn from_socketcan_data(frame: &socketcan::CanDataFrame) -> Option<CanFrame> {
    let (id, flags) = match frame.id() {
        socketcan::Id::Standard(id) => (u32::from(id.as_raw()), CanFlags::empty()),
        socketcan::Id::Extended(id) => (id.as_raw(), CanFlags::IDE),
    };
    CanFrame::with_flags(id, flags, frame.data()).ok()
}

fn map_error_frame(frame: &socketcan::CanErrorFrame) -> BusErrorFrame {
    // The raw error class lives in the frame identifier bits; a coarse
    // mapping suffices for the EMCY generation rules of the core.
    let class = frame.raw_id();
    let mut errors = BusErrorFlags::empty();
    let state = if class & 0x0040 != 0 {
        // CAN_ERR_BUSOFF
        BusState::BusOff
    } else if class & 0x0004 != 0 {
        // CAN_ERR_CRTL (controller problems: warning/passive levels)
        errors.insert(BusErrorFlags::OTHER);
        BusState::ErrorPassive
    } else {
        errors.insert(BusErrorFlags::OTHER);
        BusState::ErrorActive
    };
    if class & 0x0008 != 0 {
        // CAN_ERR_PROT
        errors.insert(BusErrorFlags::BIT);
    }
    if class & 0x0001 != 0 {
        // CAN_ERR_TX_TIMEOUT
        errors.insert(BusErrorFlags::ACK);
    }
    BusErrorFrame { state, errors }
}
