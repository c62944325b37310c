//! The server-side SDO state machine (SSDO).
//!
//! One instance serves one SDO channel: it listens on the client-to-server
//! COB-ID of its pair, transmits on the server-to-client COB-ID, and runs at
//! most one session at a time. Supports expedited, segmented and block
//! transfers, the latter with optional CRC-16 protection.
//! (Reference: CiA 301, Section 7.2.4)

use super::{
    BLK_CRC, BLK_MAX_SEQNO, BLK_SEQ_LAST, BLK_SIZE, CS_MASK, INI_EXPEDITED, INI_SIZE, SEG_DATA_LEN,
    SEG_LAST, SEG_TOGGLE, SdoAbort, TransferBuffer, abort_payload, blk, ccs, crc16,
    get_multiplexer, put_multiplexer, scs,
};
use crate::frame::CanFrame;
use crate::net::{CanNet, RecvHandle, TimerHandle};
use crate::od::ObjectDictionary;
use crate::types::{COB_ID_SDO_RX_BASE, COB_ID_SDO_TX_BASE, NodeId};
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// Default session timeout: 1 s of client silence aborts the transfer.
pub const DEFAULT_TIMEOUT_US: u64 = 1_000_000;

/// Block size offered to clients during block downloads.
const SERVER_BLKSIZE: u8 = BLK_MAX_SEQNO;

#[derive(Debug)]
enum State {
    Idle,
    DownloadSegment {
        index: u16,
        sub_index: u8,
        toggle: bool,
        buf: TransferBuffer,
    },
    UploadSegment {
        index: u16,
        sub_index: u8,
        toggle: bool,
        buf: TransferBuffer,
    },
    /// Receiving the sub-frames of one block.
    BlockDownload {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        /// Total size announced in the initiate frame.
        size: Option<u32>,
        blksize: u8,
        /// Last in-order sequence number received in the current block.
        seqno: u8,
        /// Sub-frames of the current block, committed on acknowledgement.
        block: Vec<u8>,
        /// Whether the current block contained the last sub-frame.
        last: bool,
        buf: TransferBuffer,
    },
    /// Last block acknowledged; awaiting the end-of-transfer frame.
    BlockDownloadEnd {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        size: Option<u32>,
        buf: TransferBuffer,
    },
    /// Block upload negotiated; awaiting the client's start command.
    BlockUploadStart {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        buf: TransferBuffer,
    },
    /// One block of sub-frames sent; awaiting the acknowledgement.
    BlockUploadAck {
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        /// Sub-frames sent in the current block.
        frames_sent: u8,
        buf: TransferBuffer,
    },
    /// End-of-transfer frame sent; awaiting the client's confirmation.
    BlockUploadEnd,
}

/// A server SDO channel.
pub struct SdoServer {
    /// Zero-based channel number (object 0x1200 + num).
    num: u8,
    cob_rx: u32,
    cob_tx: u32,
    timeout_us: u64,
    state: State,
    recv: RecvHandle,
    timer: TimerHandle,
}

impl SdoServer {
    /// Creates a stopped server for channel `num`, owning the given receiver
    /// and timer records.
    pub fn new(num: u8, recv: RecvHandle, timer: TimerHandle) -> Self {
        Self {
            num,
            cob_rx: 0,
            cob_tx: 0,
            timeout_us: DEFAULT_TIMEOUT_US,
            state: State::Idle,
            recv,
            timer,
        }
    }

    pub fn num(&self) -> u8 {
        self.num
    }

    /// Overrides the session timeout.
    pub fn set_timeout(&mut self, timeout_us: u64) {
        self.timeout_us = timeout_us;
    }

    /// Binds the server to its COB-ID pair and starts listening.
    ///
    /// The production values come from the SDO server parameter record
    /// (object 0x1200 + num) when present; channel 0 falls back to the
    /// pre-defined connection set.
    pub fn start<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &ObjectDictionary,
        node_id: NodeId,
    ) {
        let param = 0x1200u16 + u16::from(self.num);
        let (rx, tx) = match (od.read_u32(param, 1), od.read_u32(param, 2)) {
            (Some(rx), Some(tx)) => (rx, tx),
            _ if self.num == 0 && !node_id.is_unconfigured() => (
                COB_ID_SDO_RX_BASE + u32::from(node_id.raw()),
                COB_ID_SDO_TX_BASE + u32::from(node_id.raw()),
            ),
            _ => return,
        };
        // Bit 31 marks an invalid COB-ID.
        if rx & 0x8000_0000 != 0 || tx & 0x8000_0000 != 0 {
            return;
        }
        self.cob_rx = rx & 0x7FF;
        self.cob_tx = tx & 0x7FF;
        net.recv_start(self.recv, self.cob_rx, false);
        trace!(
            "[SSDO {}] listening on {:#05X}, replying on {:#05X}",
            self.num, self.cob_rx, self.cob_tx
        );
    }

    /// Stops listening and drops any session without a response.
    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_stop(self.recv);
        net.timer_stop(self.timer);
        self.state = State::Idle;
    }

    /// Handles the session timeout.
    pub fn on_timeout<T: Copy>(&mut self, net: &mut CanNet<T>) {
        if matches!(self.state, State::Idle) {
            return;
        }
        warn!("[SSDO {}] session timed out", self.num);
        let (index, sub_index) = self.session_multiplexer();
        self.send_abort(net, index, sub_index, SdoAbort::Timeout);
    }

    /// Processes a frame received on the client-to-server COB-ID.
    pub fn on_frame<T: Copy>(
        &mut self,
        frame: &CanFrame,
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
    ) {
        if frame.is_rtr() {
            return;
        }
        let data = frame.data();
        if data.is_empty() {
            return;
        }
        let cs = data[0] & CS_MASK;

        // An abort ends the session without a response, in any state.
        if cs == ccs::ABORT {
            if !matches!(self.state, State::Idle) {
                debug!(
                    "[SSDO {}] client aborted with {:#010X}",
                    self.num,
                    data.get(4..8)
                        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                        .unwrap_or(0)
                );
                net.timer_stop(self.timer);
                self.state = State::Idle;
            }
            return;
        }

        let state = core::mem::replace(&mut self.state, State::Idle);
        match state {
            State::Idle => self.on_idle(cs, data, net, od),
            State::DownloadSegment {
                index,
                sub_index,
                toggle,
                buf,
            } => self.on_download_segment(cs, data, index, sub_index, toggle, buf, net, od),
            State::UploadSegment {
                index,
                sub_index,
                toggle,
                buf,
            } => self.on_upload_segment(cs, data, index, sub_index, toggle, buf, net),
            State::BlockDownload {
                index,
                sub_index,
                crc_enabled,
                size,
                blksize,
                seqno,
                block,
                last,
                buf,
            } => self.on_block_download_sub(
                data, index, sub_index, crc_enabled, size, blksize, seqno, block, last, buf, net,
            ),
            State::BlockDownloadEnd {
                index,
                sub_index,
                crc_enabled,
                size,
                buf,
            } => self.on_block_download_end(
                cs, data, index, sub_index, crc_enabled, size, buf, net, od,
            ),
            State::BlockUploadStart {
                index,
                sub_index,
                crc_enabled,
                blksize,
                buf,
            } => self.on_block_upload_start(
                cs, data, index, sub_index, crc_enabled, blksize, buf, net,
            ),
            State::BlockUploadAck {
                index,
                sub_index,
                crc_enabled,
                blksize,
                frames_sent,
                buf,
            } => self.on_block_upload_ack(
                cs, data, index, sub_index, crc_enabled, blksize, frames_sent, buf, net,
            ),
            State::BlockUploadEnd => {
                // Any confirmation (ccs=5, cs=1) ends the transfer; anything
                // else is a protocol error already handled by returning to
                // Idle.
                if cs != ccs::BLOCK_UPLOAD || data[0] & 0x03 != blk::END {
                    self.send_abort(net, 0, 0, SdoAbort::InvalidCommandSpecifier);
                }
                net.timer_stop(self.timer);
            }
        }
    }

    // --- Idle: initiate requests ---

    #[allow(clippy::too_many_arguments)]
    fn on_idle<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
    ) {
        if data.len() < 8 {
            self.send_abort(net, 0, 0, SdoAbort::InvalidCommandSpecifier);
            return;
        }
        let (index, sub_index) = get_multiplexer(data);
        match cs {
            ccs::INITIATE_DOWNLOAD => self.initiate_download(data, index, sub_index, net, od),
            ccs::INITIATE_UPLOAD => self.initiate_upload(index, sub_index, net, od),
            ccs::BLOCK_DOWNLOAD if data[0] & 0x01 == blk::INITIATE => {
                self.initiate_block_download(data, index, sub_index, net)
            }
            ccs::BLOCK_UPLOAD if data[0] & 0x03 == blk::INITIATE => {
                self.initiate_block_upload(data, index, sub_index, net, od)
            }
            _ => self.send_abort(net, index, sub_index, SdoAbort::InvalidCommandSpecifier),
        }
    }

    fn initiate_download<T: Copy>(
        &mut self,
        data: &[u8],
        index: u16,
        sub_index: u8,
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
    ) {
        if data[0] & INI_EXPEDITED != 0 {
            let len = if data[0] & INI_SIZE != 0 {
                4 - usize::from((data[0] >> 2) & 0x03)
            } else {
                4
            };
            match od.download(index, sub_index, &data[4..4 + len]) {
                Ok(()) => self.send_download_response(net, index, sub_index),
                Err(code) => self.send_abort(net, index, sub_index, code),
            }
            return;
        }
        // Segmented: the size, if indicated, is in bytes 4..7.
        let buf = if data[0] & INI_SIZE != 0 {
            TransferBuffer::with_size(u32::from_le_bytes(data[4..8].try_into().unwrap()))
        } else {
            TransferBuffer::new()
        };
        self.send_download_response(net, index, sub_index);
        self.state = State::DownloadSegment {
            index,
            sub_index,
            toggle: false,
            buf,
        };
        self.arm_timer(net);
    }

    fn initiate_upload<T: Copy>(
        &mut self,
        index: u16,
        sub_index: u8,
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
    ) {
        let payload = match od.upload(index, sub_index) {
            Ok(payload) => payload,
            Err(code) => return self.send_abort(net, index, sub_index, code),
        };
        let mut response = [0u8; 8];
        put_multiplexer(&mut response, index, sub_index);
        if payload.len() <= 4 {
            // Expedited, size indicated.
            let n = (4 - payload.len()) as u8;
            response[0] = scs::INITIATE_UPLOAD | (n << 2) | INI_EXPEDITED | INI_SIZE;
            response[4..4 + payload.len()].copy_from_slice(&payload);
            self.send(net, &response);
        } else {
            response[0] = scs::INITIATE_UPLOAD | INI_SIZE;
            response[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            self.send(net, &response);
            self.state = State::UploadSegment {
                index,
                sub_index,
                toggle: false,
                buf: TransferBuffer::from_payload(payload),
            };
            self.arm_timer(net);
        }
    }

    fn initiate_block_download<T: Copy>(
        &mut self,
        data: &[u8],
        index: u16,
        sub_index: u8,
        net: &mut CanNet<T>,
    ) {
        let crc_enabled = data[0] & BLK_CRC != 0;
        let size = (data[0] & BLK_SIZE != 0)
            .then(|| u32::from_le_bytes(data[4..8].try_into().unwrap()));
        let mut response = [0u8; 8];
        response[0] = scs::BLOCK_DOWNLOAD | BLK_CRC | blk::INITIATE;
        put_multiplexer(&mut response, index, sub_index);
        response[4] = SERVER_BLKSIZE;
        self.send(net, &response);
        self.state = State::BlockDownload {
            index,
            sub_index,
            crc_enabled,
            size,
            blksize: SERVER_BLKSIZE,
            seqno: 0,
            block: Vec::new(),
            last: false,
            buf: TransferBuffer::new(),
        };
        self.arm_timer(net);
    }

    fn initiate_block_upload<T: Copy>(
        &mut self,
        data: &[u8],
        index: u16,
        sub_index: u8,
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
    ) {
        if data.len() < 5 || data[4] == 0 || data[4] > BLK_MAX_SEQNO {
            return self.send_abort(net, index, sub_index, SdoAbort::InvalidBlockSize);
        }
        let blksize = data[4];
        let crc_enabled = data[0] & BLK_CRC != 0;
        let payload = match od.upload(index, sub_index) {
            Ok(payload) => payload,
            Err(code) => return self.send_abort(net, index, sub_index, code),
        };
        let mut response = [0u8; 8];
        response[0] = scs::BLOCK_UPLOAD | BLK_CRC | BLK_SIZE | blk::INITIATE;
        put_multiplexer(&mut response, index, sub_index);
        response[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.send(net, &response);
        self.state = State::BlockUploadStart {
            index,
            sub_index,
            crc_enabled,
            blksize,
            buf: TransferBuffer::from_payload(payload),
        };
        self.arm_timer(net);
    }

    // --- Segmented transfer ---

    #[allow(clippy::too_many_arguments)]
    fn on_download_segment<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        index: u16,
        sub_index: u8,
        toggle: bool,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
    ) {
        if cs != ccs::DOWNLOAD_SEGMENT || data.len() < 8 {
            return self.send_abort(net, index, sub_index, SdoAbort::InvalidCommandSpecifier);
        }
        if (data[0] & SEG_TOGGLE != 0) != toggle {
            return self.send_abort(net, index, sub_index, SdoAbort::ToggleNotAlternated);
        }
        let n = usize::from((data[0] >> 1) & 0x07);
        if !buf.push(&data[1..1 + (SEG_DATA_LEN - n)]) {
            return self.send_abort(net, index, sub_index, SdoAbort::TypeLengthTooHigh);
        }
        let mut response = [0u8; 8];
        response[0] = scs::DOWNLOAD_SEGMENT | if toggle { SEG_TOGGLE } else { 0 };
        if data[0] & SEG_LAST != 0 {
            if !buf.is_complete() {
                return self.send_abort(net, index, sub_index, SdoAbort::TypeLengthTooLow);
            }
            match od.download(index, sub_index, buf.payload()) {
                Ok(()) => {
                    self.send(net, &response);
                    net.timer_stop(self.timer);
                }
                Err(code) => self.send_abort(net, index, sub_index, code),
            }
        } else {
            self.send(net, &response);
            self.state = State::DownloadSegment {
                index,
                sub_index,
                toggle: !toggle,
                buf,
            };
            self.arm_timer(net);
        }
    }

    fn on_upload_segment<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        index: u16,
        sub_index: u8,
        toggle: bool,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        if cs != ccs::UPLOAD_SEGMENT {
            return self.send_abort(net, index, sub_index, SdoAbort::InvalidCommandSpecifier);
        }
        if (data[0] & SEG_TOGGLE != 0) != toggle {
            return self.send_abort(net, index, sub_index, SdoAbort::ToggleNotAlternated);
        }
        let fragment = buf.next_fragment(SEG_DATA_LEN);
        let n = (SEG_DATA_LEN - fragment.len()) as u8;
        let mut response = [0u8; 8];
        response[0] = scs::UPLOAD_SEGMENT | if toggle { SEG_TOGGLE } else { 0 } | (n << 1);
        response[1..1 + fragment.len()].copy_from_slice(fragment);
        let done = buf.remaining() == 0;
        if done {
            response[0] |= SEG_LAST;
            net.timer_stop(self.timer);
        } else {
            self.state = State::UploadSegment {
                index,
                sub_index,
                toggle: !toggle,
                buf,
            };
            self.arm_timer(net);
        }
        self.send(net, &response);
    }

    // --- Block download ---

    #[allow(clippy::too_many_arguments)]
    fn on_block_download_sub<T: Copy>(
        &mut self,
        data: &[u8],
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        size: Option<u32>,
        blksize: u8,
        mut seqno: u8,
        mut block: Vec<u8>,
        mut last: bool,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        let frame_seqno = data[0] & !BLK_SEQ_LAST;
        if frame_seqno == 0 || frame_seqno > blksize {
            return self.send_abort(net, index, sub_index, SdoAbort::InvalidSequenceNumber);
        }
        if frame_seqno == seqno + 1 {
            // In-order sub-frame: stage its bytes.
            seqno = frame_seqno;
            block.extend_from_slice(&data[1..8.min(data.len())]);
            if data[0] & BLK_SEQ_LAST != 0 {
                last = true;
            }
        }
        // Out-of-order frames are dropped; the acknowledgement below carries
        // the last in-order sequence number and the client re-sends from
        // there.
        if frame_seqno == blksize || data[0] & BLK_SEQ_LAST != 0 {
            let mut response = [0u8; 8];
            response[0] = scs::BLOCK_DOWNLOAD | blk::RESPONSE;
            response[1] = seqno;
            response[2] = SERVER_BLKSIZE;
            self.send(net, &response);
            let _ = buf.push(&block);
            if last && seqno == frame_seqno {
                self.state = State::BlockDownloadEnd {
                    index,
                    sub_index,
                    crc_enabled,
                    size,
                    buf,
                };
            } else {
                self.state = State::BlockDownload {
                    index,
                    sub_index,
                    crc_enabled,
                    size,
                    blksize,
                    seqno: 0,
                    block: Vec::new(),
                    last: false,
                    buf,
                };
            }
        } else {
            self.state = State::BlockDownload {
                index,
                sub_index,
                crc_enabled,
                size,
                blksize,
                seqno,
                block,
                last,
                buf,
            };
        }
        self.arm_timer(net);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_block_download_end<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        size: Option<u32>,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
    ) {
        if cs != ccs::BLOCK_DOWNLOAD || data[0] & 0x01 != blk::END || data.len() < 3 {
            return self.send_abort(net, index, sub_index, SdoAbort::InvalidCommandSpecifier);
        }
        // n = number of padding bytes in the final sub-frame.
        let n = usize::from((data[0] >> 2) & 0x07);
        buf.truncate_tail(n);
        if let Some(size) = size {
            if (buf.len() as u32) < size {
                return self.send_abort(net, index, sub_index, SdoAbort::TypeLengthTooLow);
            }
            // Sub-frame padding beyond the n bookkeeping.
            buf.truncate_tail(buf.len() - size as usize);
        }
        if crc_enabled {
            let expected = u16::from_le_bytes([data[1], data[2]]);
            let actual = crc16(0, buf.payload());
            if expected != actual {
                debug!(
                    "[SSDO {}] block CRC mismatch: got {:#06X}, computed {:#06X}",
                    self.num, expected, actual
                );
                return self.send_abort(net, index, sub_index, SdoAbort::CrcError);
            }
        }
        match od.download(index, sub_index, buf.payload()) {
            Ok(()) => {
                let mut response = [0u8; 8];
                response[0] = scs::BLOCK_DOWNLOAD | blk::END;
                self.send(net, &response);
                net.timer_stop(self.timer);
            }
            Err(code) => self.send_abort(net, index, sub_index, code),
        }
    }

    // --- Block upload ---

    #[allow(clippy::too_many_arguments)]
    fn on_block_upload_start<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        if cs != ccs::BLOCK_UPLOAD || data[0] & 0x03 != blk::START {
            return self.send_abort(net, index, sub_index, SdoAbort::InvalidCommandSpecifier);
        }
        self.send_upload_block(index, sub_index, crc_enabled, blksize, buf, net);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_block_upload_ack<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        frames_sent: u8,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        if cs != ccs::BLOCK_UPLOAD || data[0] & 0x03 != blk::RESPONSE || data.len() < 3 {
            return self.send_abort(net, index, sub_index, SdoAbort::InvalidCommandSpecifier);
        }
        let ackseq = data[1];
        let next_blksize = data[2];
        if next_blksize == 0 || next_blksize > BLK_MAX_SEQNO {
            return self.send_abort(net, index, sub_index, SdoAbort::InvalidBlockSize);
        }
        if ackseq < frames_sent {
            // The client missed some sub-frames; rewind and re-send from the
            // first unacknowledged one.
            let lost = usize::from(frames_sent - ackseq);
            buf.rewind(lost * SEG_DATA_LEN);
        }
        if buf.remaining() == 0 {
            // All data acknowledged: send the end-of-transfer frame.
            let payload_len = buf.payload().len();
            let n = if payload_len == 0 {
                0
            } else {
                (SEG_DATA_LEN - 1 - ((payload_len - 1) % SEG_DATA_LEN)) as u8
            };
            let mut response = [0u8; 8];
            response[0] = scs::BLOCK_UPLOAD | (n << 2) | blk::END;
            if crc_enabled {
                let crc = crc16(0, buf.payload());
                response[1..3].copy_from_slice(&crc.to_le_bytes());
            }
            self.send(net, &response);
            self.state = State::BlockUploadEnd;
            self.arm_timer(net);
        } else {
            self.send_upload_block(index, sub_index, crc_enabled, next_blksize, buf, net);
        }
    }

    /// Streams one block of sub-frames and transitions to the ack wait.
    fn send_upload_block<T: Copy>(
        &mut self,
        index: u16,
        sub_index: u8,
        crc_enabled: bool,
        blksize: u8,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        let mut frames_sent = 0u8;
        while frames_sent < blksize {
            let fragment = buf.next_fragment(SEG_DATA_LEN);
            if fragment.is_empty() && frames_sent > 0 {
                break;
            }
            frames_sent += 1;
            let mut payload = [0u8; 8];
            payload[0] = frames_sent;
            payload[1..1 + fragment.len()].copy_from_slice(fragment);
            if buf.remaining() == 0 {
                payload[0] |= BLK_SEQ_LAST;
            }
            self.send(net, &payload);
            if payload[0] & BLK_SEQ_LAST != 0 {
                break;
            }
        }
        self.state = State::BlockUploadAck {
            index,
            sub_index,
            crc_enabled,
            blksize,
            frames_sent,
            buf,
        };
        self.arm_timer(net);
    }

    // --- Helpers ---

    fn session_multiplexer(&self) -> (u16, u8) {
        match &self.state {
            State::DownloadSegment {
                index, sub_index, ..
            }
            | State::UploadSegment {
                index, sub_index, ..
            }
            | State::BlockDownload {
                index, sub_index, ..
            }
            | State::BlockDownloadEnd {
                index, sub_index, ..
            }
            | State::BlockUploadStart {
                index, sub_index, ..
            }
            | State::BlockUploadAck {
                index, sub_index, ..
            } => (*index, *sub_index),
            _ => (0, 0),
        }
    }

    fn send_download_response<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        index: u16,
        sub_index: u8,
    ) {
        let mut response = [0u8; 8];
        response[0] = scs::INITIATE_DOWNLOAD;
        put_multiplexer(&mut response, index, sub_index);
        self.send(net, &response);
    }

    fn send_abort<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        index: u16,
        sub_index: u8,
        code: SdoAbort,
    ) {
        let payload = abort_payload(scs::ABORT, index, sub_index, code);
        self.send(net, &payload);
        net.timer_stop(self.timer);
        self.state = State::Idle;
    }

    fn send<T: Copy>(&self, net: &mut CanNet<T>, payload: &[u8; 8]) {
        if let Ok(frame) = CanFrame::new(self.cob_tx, payload) {
            let _ = net.send(&frame);
        }
    }

    fn arm_timer<T: Copy>(&self, net: &mut CanNet<T>) {
        net.timer_after(self.timer, self.timeout_us);
    }
}
