//! The client-side SDO state machine (CSDO).
//!
//! The client owns a request queue and executes one request at a time
//! against a remote server. Every submitted request produces exactly one
//! confirmation, carrying either the uploaded payload or an abort code.
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
use crate::CanOpenError;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// Default request timeout in microseconds.
pub const DEFAULT_TIMEOUT_US: u64 = 1_000_000;

/// Preferred transfer protocol of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Expedited when the payload fits four bytes, segmented otherwise.
    #[default]
    Segmented,
    /// Block transfer. With `fallback` the request silently downgrades to
    /// segmented mode if the server rejects the block initiate.
    Block { fallback: bool },
}

/// The operation of a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    /// Write the payload to the remote entry.
    Download(Vec<u8>),
    /// Read the remote entry.
    Upload,
    /// Walk a concise DCF stream and download every record in order.
    /// (Reference: CiA 302-3, Section 4.3 and CiA 301 object 0x1F22)
    DownloadDcf(Vec<u8>),
}

/// A queued client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoClientRequest {
    pub index: u16,
    pub sub_index: u8,
    pub op: ClientOp,
    pub mode: TransferMode,
    pub timeout_us: u64,
}

impl SdoClientRequest {
    pub fn download(index: u16, sub_index: u8, data: Vec<u8>) -> Self {
        Self {
            index,
            sub_index,
            op: ClientOp::Download(data),
            mode: TransferMode::Segmented,
            timeout_us: DEFAULT_TIMEOUT_US,
        }
    }

    pub fn upload(index: u16, sub_index: u8) -> Self {
        Self {
            index,
            sub_index,
            op: ClientOp::Upload,
            mode: TransferMode::Segmented,
            timeout_us: DEFAULT_TIMEOUT_US,
        }
    }

    pub fn download_dcf(stream: Vec<u8>) -> Self {
        Self {
            index: 0,
            sub_index: 0,
            op: ClientOp::DownloadDcf(stream),
            mode: TransferMode::Segmented,
            timeout_us: DEFAULT_TIMEOUT_US,
        }
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout_us: u64) -> Self {
        self.timeout_us = timeout_us;
        self
    }
}

/// The completion of a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoConfirm {
    /// Zero-based client channel number.
    pub num: u8,
    /// The remote server the request addressed.
    pub server: NodeId,
    pub index: u16,
    pub sub_index: u8,
    /// `Ok(Some(payload))` for uploads, `Ok(None)` for downloads.
    pub result: Result<Option<Vec<u8>>, SdoAbort>,
}

/// Remaining records of a concise DCF stream being walked.
#[derive(Debug)]
struct DcfWalk {
    stream: Vec<u8>,
    pos: usize,
    remaining: u32,
}

impl DcfWalk {
    /// Parses the 32-bit record count off the head of the stream.
    fn new(stream: Vec<u8>) -> Result<Self, SdoAbort> {
        if stream.len() < 4 {
            return Err(SdoAbort::TypeLengthTooLow);
        }
        let remaining = u32::from_le_bytes(stream[0..4].try_into().unwrap());
        Ok(Self {
            stream,
            pos: 4,
            remaining,
        })
    }

    /// Yields the next (index, sub-index, payload) record.
    fn next_record(&mut self) -> Result<Option<(u16, u8, Vec<u8>)>, SdoAbort> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let head = self
            .stream
            .get(self.pos..self.pos + 7)
            .ok_or(SdoAbort::TypeLengthTooLow)?;
        let index = u16::from_le_bytes([head[0], head[1]]);
        let sub_index = head[2];
        let size = u32::from_le_bytes(head[3..7].try_into().unwrap()) as usize;
        let start = self.pos + 7;
        let data = self
            .stream
            .get(start..start + size)
            .ok_or(SdoAbort::TypeLengthTooLow)?
            .to_vec();
        self.pos = start + size;
        self.remaining -= 1;
        Ok(Some((index, sub_index, data)))
    }
}

#[derive(Debug)]
enum State {
    Idle,
    DownloadIniWait {
        buf: TransferBuffer,
    },
    DownloadSegWait {
        toggle: bool,
        buf: TransferBuffer,
    },
    UploadIniWait,
    UploadSegWait {
        toggle: bool,
        buf: TransferBuffer,
    },
    BlockDownloadIniWait {
        fallback: bool,
        buf: TransferBuffer,
    },
    BlockDownloadAckWait {
        blksize: u8,
        frames_sent: u8,
        buf: TransferBuffer,
    },
    BlockDownloadEndWait,
    BlockUploadIniWait,
    BlockUploadStream {
        blksize: u8,
        seqno: u8,
        block: Vec<u8>,
        last: bool,
        /// Total size announced by the server, checked at end-of-transfer.
        size: Option<u32>,
        buf: TransferBuffer,
    },
    BlockUploadEndWait {
        size: Option<u32>,
        buf: TransferBuffer,
    },
}

/// A client SDO channel.
pub struct SdoClient {
    /// Zero-based channel number (object 0x1280 + num).
    num: u8,
    server: NodeId,
    cob_tx: u32,
    cob_rx: u32,
    state: State,
    current: Option<SdoClientRequest>,
    dcf: Option<DcfWalk>,
    queue: VecDeque<SdoClientRequest>,
    confirms: Vec<SdoConfirm>,
    recv: RecvHandle,
    timer: TimerHandle,
}

impl SdoClient {
    /// Creates a stopped client for channel `num`, owning the given receiver
    /// and timer records.
    pub fn new(num: u8, recv: RecvHandle, timer: TimerHandle) -> Self {
        Self {
            num,
            server: NodeId::UNCONFIGURED,
            cob_tx: 0,
            cob_rx: 0,
            state: State::Idle,
            current: None,
            dcf: None,
            queue: VecDeque::new(),
            confirms: Vec::new(),
            recv,
            timer,
        }
    }

    pub fn num(&self) -> u8 {
        self.num
    }

    /// The remote server this client is bound to.
    pub fn server(&self) -> NodeId {
        self.server
    }

    /// Returns `true` if no request is in flight or queued.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle) && self.queue.is_empty()
    }

    /// Binds the client per its SDO client parameter record (object
    /// 0x1280 + num) and starts listening.
    pub fn start<T: Copy>(&mut self, net: &mut CanNet<T>, od: &ObjectDictionary) {
        let param = 0x1280u16 + u16::from(self.num);
        let (Some(tx), Some(rx), Some(server)) = (
            od.read_u32(param, 1),
            od.read_u32(param, 2),
            od.read_u8(param, 3),
        ) else {
            return;
        };
        if tx & 0x8000_0000 != 0 || rx & 0x8000_0000 != 0 {
            return;
        }
        let Ok(server) = NodeId::try_from(server) else {
            return;
        };
        self.server = server;
        self.cob_tx = tx & 0x7FF;
        self.cob_rx = rx & 0x7FF;
        net.recv_start(self.recv, self.cob_rx, false);
    }

    /// Binds the client to a remote node using the pre-defined connection
    /// set, as the NMT master does when booting slaves.
    pub fn set_remote<T: Copy>(&mut self, net: &mut CanNet<T>, server: NodeId) {
        self.server = server;
        self.cob_tx = COB_ID_SDO_RX_BASE + u32::from(server.raw());
        self.cob_rx = COB_ID_SDO_TX_BASE + u32::from(server.raw());
        net.recv_start(self.recv, self.cob_rx, false);
    }

    /// Stops the client. In-flight and queued requests complete with a
    /// `DeviceState` abort.
    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_stop(self.recv);
        net.timer_stop(self.timer);
        // Flush the queue first so that completing the in-flight request
        // does not start the next one.
        let queued: Vec<SdoClientRequest> = self.queue.drain(..).collect();
        if self.current.is_some() {
            self.finish(net, Err(SdoAbort::DeviceState));
        }
        for req in queued {
            self.confirms.push(SdoConfirm {
                num: self.num,
                server: self.server,
                index: req.index,
                sub_index: req.sub_index,
                result: Err(SdoAbort::DeviceState),
            });
        }
    }

    /// Drains the confirmations produced since the last call.
    pub fn take_confirms(&mut self) -> Vec<SdoConfirm> {
        core::mem::take(&mut self.confirms)
    }

    /// Submits a request. Starts immediately when idle, otherwise queues.
    pub fn submit<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        request: SdoClientRequest,
    ) -> Result<(), CanOpenError> {
        if self.cob_tx == 0 {
            return Err(CanOpenError::NotReady);
        }
        if matches!(self.state, State::Idle) && self.current.is_none() {
            self.begin(net, request);
        } else {
            self.queue.push_back(request);
        }
        Ok(())
    }

    /// Cancels the in-flight request with the given abort code. The
    /// confirmation still fires, once, with that code.
    pub fn abort_request<T: Copy>(&mut self, net: &mut CanNet<T>, code: SdoAbort) {
        let Some(req) = &self.current else {
            return;
        };
        let payload = abort_payload(ccs::ABORT, req.index, req.sub_index, code);
        self.send(net, &payload);
        self.finish(net, Err(code));
    }

    /// Handles the request timeout.
    pub fn on_timeout<T: Copy>(&mut self, net: &mut CanNet<T>) {
        if self.current.is_none() {
            return;
        }
        warn!("[CSDO {}] request timed out", self.num);
        self.abort_request(net, SdoAbort::Timeout);
    }

    /// Processes a frame received on the server-to-client COB-ID.
    pub fn on_frame<T: Copy>(&mut self, frame: &CanFrame, net: &mut CanNet<T>) {
        if frame.is_rtr() || self.current.is_none() {
            return;
        }
        let data = frame.data();
        if data.is_empty() {
            return;
        }
        let cs = data[0] & CS_MASK;

        if cs == scs::ABORT {
            let code = data
                .get(4..8)
                .map(|b| SdoAbort::from_code(u32::from_le_bytes(b.try_into().unwrap())))
                .unwrap_or(SdoAbort::GeneralError);
            // A refused block initiate may downgrade to segmented mode.
            if let State::BlockDownloadIniWait {
                fallback: true,
                buf,
            } = core::mem::replace(&mut self.state, State::Idle)
            {
                debug!(
                    "[CSDO {}] block download refused ({}), falling back to segmented",
                    self.num, code
                );
                self.begin_download_segmented(net, buf);
                return;
            }
            self.finish(net, Err(code));
            return;
        }

        let state = core::mem::replace(&mut self.state, State::Idle);
        match state {
            State::Idle => {}
            State::DownloadIniWait { buf } => self.on_download_ini(cs, data, buf, net),
            State::DownloadSegWait { toggle, buf } => {
                self.on_download_seg(cs, data, toggle, buf, net)
            }
            State::UploadIniWait => self.on_upload_ini(cs, data, net),
            State::UploadSegWait { toggle, buf } => self.on_upload_seg(cs, data, toggle, buf, net),
            State::BlockDownloadIniWait { buf, .. } => self.on_block_download_ini(cs, data, buf, net),
            State::BlockDownloadAckWait {
                blksize,
                frames_sent,
                buf,
            } => self.on_block_download_ack(cs, data, blksize, frames_sent, buf, net),
            State::BlockDownloadEndWait => self.on_block_download_end(cs, data, net),
            State::BlockUploadIniWait => self.on_block_upload_ini(cs, data, net),
            State::BlockUploadStream {
                blksize,
                seqno,
                block,
                last,
                size,
                buf,
            } => self.on_block_upload_sub(data, blksize, seqno, block, last, size, buf, net),
            State::BlockUploadEndWait { size, buf } => {
                self.on_block_upload_end(cs, data, size, buf, net)
            }
        }
    }

    // --- Request startup ---

    fn begin<T: Copy>(&mut self, net: &mut CanNet<T>, request: SdoClientRequest) {
        trace!(
            "[CSDO {}] starting request for {:#06X}:{:02X} at node {}",
            self.num, request.index, request.sub_index, self.server
        );
        match &request.op {
            ClientOp::DownloadDcf(stream) => {
                let stream = stream.clone();
                self.current = Some(request);
                match DcfWalk::new(stream) {
                    Ok(walk) => {
                        self.dcf = Some(walk);
                        self.next_dcf_record(net);
                    }
                    Err(code) => self.finish(net, Err(code)),
                }
            }
            ClientOp::Download(data) => {
                let buf = TransferBuffer::from_payload(data.clone());
                let mode = request.mode;
                self.current = Some(request);
                match mode {
                    TransferMode::Block { fallback } if buf.len() > 4 => {
                        self.begin_download_block(net, buf, fallback)
                    }
                    _ => self.begin_download_segmented(net, buf),
                }
            }
            ClientOp::Upload => {
                let mode = request.mode;
                self.current = Some(request);
                match mode {
                    TransferMode::Block { .. } => self.begin_upload_block(net),
                    TransferMode::Segmented => self.begin_upload(net),
                }
            }
        }
    }

    fn begin_download_segmented<T: Copy>(&mut self, net: &mut CanNet<T>, mut buf: TransferBuffer) {
        let req = self.current.as_ref().expect("request in flight");
        let (index, sub_index) = (req.index, req.sub_index);
        let mut payload = [0u8; 8];
        put_multiplexer(&mut payload, index, sub_index);
        if buf.len() <= 4 {
            let n = (4 - buf.len()) as u8;
            payload[0] = ccs::INITIATE_DOWNLOAD | (n << 2) | INI_EXPEDITED | INI_SIZE;
            let fragment = buf.next_fragment(4);
            payload[4..4 + fragment.len()].copy_from_slice(fragment);
            self.send(net, &payload);
            self.state = State::DownloadIniWait {
                buf: TransferBuffer::new(),
            };
        } else {
            payload[0] = ccs::INITIATE_DOWNLOAD | INI_SIZE;
            payload[4..8].copy_from_slice(&(buf.len() as u32).to_le_bytes());
            self.send(net, &payload);
            self.state = State::DownloadIniWait { buf };
        }
        self.arm_timer(net);
    }

    fn begin_download_block<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        buf: TransferBuffer,
        fallback: bool,
    ) {
        let req = self.current.as_ref().expect("request in flight");
        let mut payload = [0u8; 8];
        payload[0] = ccs::BLOCK_DOWNLOAD | BLK_CRC | BLK_SIZE | blk::INITIATE;
        put_multiplexer(&mut payload, req.index, req.sub_index);
        payload[4..8].copy_from_slice(&(buf.len() as u32).to_le_bytes());
        self.send(net, &payload);
        self.state = State::BlockDownloadIniWait { fallback, buf };
        self.arm_timer(net);
    }

    fn begin_upload<T: Copy>(&mut self, net: &mut CanNet<T>) {
        let req = self.current.as_ref().expect("request in flight");
        let mut payload = [0u8; 8];
        payload[0] = ccs::INITIATE_UPLOAD;
        put_multiplexer(&mut payload, req.index, req.sub_index);
        self.send(net, &payload);
        self.state = State::UploadIniWait;
        self.arm_timer(net);
    }

    fn begin_upload_block<T: Copy>(&mut self, net: &mut CanNet<T>) {
        let req = self.current.as_ref().expect("request in flight");
        let mut payload = [0u8; 8];
        payload[0] = ccs::BLOCK_UPLOAD | BLK_CRC | blk::INITIATE;
        put_multiplexer(&mut payload, req.index, req.sub_index);
        payload[4] = BLK_MAX_SEQNO;
        // Protocol switch threshold 0: never fall back to segmented.
        payload[5] = 0;
        self.send(net, &payload);
        self.state = State::BlockUploadIniWait;
        self.arm_timer(net);
    }

    // --- Download (client to server) ---

    fn on_download_ini<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        if cs != scs::INITIATE_DOWNLOAD || data.len() < 4 {
            return self.protocol_error(net);
        }
        if buf.remaining() == 0 {
            // Expedited download acknowledged.
            self.finish(net, Ok(None));
            return;
        }
        self.send_download_segment(net, false, &mut buf);
    }

    fn on_download_seg<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        toggle: bool,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        if cs != scs::DOWNLOAD_SEGMENT {
            return self.protocol_error(net);
        }
        if (data[0] & SEG_TOGGLE != 0) != toggle {
            return self.abort_with(net, SdoAbort::ToggleNotAlternated);
        }
        if buf.remaining() == 0 {
            self.finish(net, Ok(None));
            return;
        }
        self.send_download_segment(net, !toggle, &mut buf);
    }

    fn send_download_segment<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        toggle: bool,
        buf: &mut TransferBuffer,
    ) {
        let fragment = buf.next_fragment(SEG_DATA_LEN);
        let n = (SEG_DATA_LEN - fragment.len()) as u8;
        let mut payload = [0u8; 8];
        payload[0] = ccs::DOWNLOAD_SEGMENT | if toggle { SEG_TOGGLE } else { 0 } | (n << 1);
        payload[1..1 + fragment.len()].copy_from_slice(fragment);
        if buf.remaining() == 0 {
            payload[0] |= SEG_LAST;
        }
        self.send(net, &payload);
        self.state = State::DownloadSegWait {
            toggle,
            buf: core::mem::take(buf),
        };
        self.arm_timer(net);
    }

    // --- Upload (server to client) ---

    fn on_upload_ini<T: Copy>(&mut self, cs: u8, data: &[u8], net: &mut CanNet<T>) {
        if cs != scs::INITIATE_UPLOAD || data.len() < 8 {
            return self.protocol_error(net);
        }
        let req = self.current.as_ref().expect("request in flight");
        let (index, sub_index) = get_multiplexer(data);
        if (index, sub_index) != (req.index, req.sub_index) {
            return self.abort_with(net, SdoAbort::GeneralError);
        }
        if data[0] & INI_EXPEDITED != 0 {
            let len = if data[0] & INI_SIZE != 0 {
                4 - usize::from((data[0] >> 2) & 0x03)
            } else {
                4
            };
            let payload = data[4..4 + len].to_vec();
            self.finish(net, Ok(Some(payload)));
            return;
        }
        let buf = if data[0] & INI_SIZE != 0 {
            TransferBuffer::with_size(u32::from_le_bytes(data[4..8].try_into().unwrap()))
        } else {
            TransferBuffer::new()
        };
        self.send_upload_request(net, false, buf);
    }

    fn on_upload_seg<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        toggle: bool,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        if cs != scs::UPLOAD_SEGMENT || data.len() < 8 {
            return self.protocol_error(net);
        }
        if (data[0] & SEG_TOGGLE != 0) != toggle {
            return self.abort_with(net, SdoAbort::ToggleNotAlternated);
        }
        let n = usize::from((data[0] >> 1) & 0x07);
        if !buf.push(&data[1..1 + (SEG_DATA_LEN - n)]) {
            return self.abort_with(net, SdoAbort::TypeLengthTooHigh);
        }
        if data[0] & SEG_LAST != 0 {
            if !buf.is_complete() {
                return self.abort_with(net, SdoAbort::TypeLengthTooLow);
            }
            self.finish(net, Ok(Some(buf.into_payload())));
            return;
        }
        self.send_upload_request(net, !toggle, buf);
    }

    fn send_upload_request<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        toggle: bool,
        buf: TransferBuffer,
    ) {
        let mut payload = [0u8; 8];
        payload[0] = ccs::UPLOAD_SEGMENT | if toggle { SEG_TOGGLE } else { 0 };
        self.send(net, &payload);
        self.state = State::UploadSegWait { toggle, buf };
        self.arm_timer(net);
    }

    // --- Block download ---

    fn on_block_download_ini<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        if cs != scs::BLOCK_DOWNLOAD || data[0] & 0x03 != blk::INITIATE || data.len() < 5 {
            return self.protocol_error(net);
        }
        let blksize = data[4];
        if blksize == 0 || blksize > BLK_MAX_SEQNO {
            return self.abort_with(net, SdoAbort::InvalidBlockSize);
        }
        self.stream_download_block(net, blksize, buf);
    }

    fn stream_download_block<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        blksize: u8,
        mut buf: TransferBuffer,
    ) {
        let mut frames_sent = 0u8;
        while frames_sent < blksize {
            let fragment = buf.next_fragment(SEG_DATA_LEN);
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
        self.state = State::BlockDownloadAckWait {
            blksize,
            frames_sent,
            buf,
        };
        self.arm_timer(net);
    }

    fn on_block_download_ack<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        _blksize: u8,
        frames_sent: u8,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        if cs != scs::BLOCK_DOWNLOAD || data[0] & 0x03 != blk::RESPONSE || data.len() < 3 {
            return self.protocol_error(net);
        }
        let ackseq = data[1];
        let next_blksize = data[2];
        if next_blksize == 0 || next_blksize > BLK_MAX_SEQNO {
            return self.abort_with(net, SdoAbort::InvalidBlockSize);
        }
        if ackseq < frames_sent {
            // The server missed some sub-frames; re-send from the first
            // unacknowledged one.
            let lost = usize::from(frames_sent - ackseq);
            buf.rewind(lost * SEG_DATA_LEN);
        }
        if buf.remaining() == 0 {
            let payload_len = buf.payload().len();
            let n = if payload_len == 0 {
                0
            } else {
                (SEG_DATA_LEN - 1 - ((payload_len - 1) % SEG_DATA_LEN)) as u8
            };
            let crc = crc16(0, buf.payload());
            let mut payload = [0u8; 8];
            payload[0] = ccs::BLOCK_DOWNLOAD | (n << 2) | blk::END;
            payload[1..3].copy_from_slice(&crc.to_le_bytes());
            self.send(net, &payload);
            self.state = State::BlockDownloadEndWait;
            self.arm_timer(net);
        } else {
            self.stream_download_block(net, next_blksize, buf);
        }
    }

    fn on_block_download_end<T: Copy>(&mut self, cs: u8, data: &[u8], net: &mut CanNet<T>) {
        if cs != scs::BLOCK_DOWNLOAD || data[0] & 0x03 != blk::END {
            return self.protocol_error(net);
        }
        self.finish(net, Ok(None));
    }

    // --- Block upload ---

    fn on_block_upload_ini<T: Copy>(&mut self, cs: u8, data: &[u8], net: &mut CanNet<T>) {
        if cs != scs::BLOCK_UPLOAD || data[0] & 0x03 != blk::INITIATE || data.len() < 8 {
            return self.protocol_error(net);
        }
        let size = (data[0] & BLK_SIZE != 0)
            .then(|| u32::from_le_bytes(data[4..8].try_into().unwrap()));
        let mut payload = [0u8; 8];
        payload[0] = ccs::BLOCK_UPLOAD | blk::START;
        self.send(net, &payload);
        self.state = State::BlockUploadStream {
            blksize: BLK_MAX_SEQNO,
            seqno: 0,
            block: Vec::new(),
            last: false,
            size,
            buf: TransferBuffer::new(),
        };
        self.arm_timer(net);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_block_upload_sub<T: Copy>(
        &mut self,
        data: &[u8],
        blksize: u8,
        mut seqno: u8,
        mut block: Vec<u8>,
        mut last: bool,
        size: Option<u32>,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        let frame_seqno = data[0] & !BLK_SEQ_LAST;
        if frame_seqno == 0 || frame_seqno > blksize {
            return self.abort_with(net, SdoAbort::InvalidSequenceNumber);
        }
        if frame_seqno == seqno + 1 {
            seqno = frame_seqno;
            block.extend_from_slice(&data[1..8.min(data.len())]);
            if data[0] & BLK_SEQ_LAST != 0 {
                last = true;
            }
        }
        if frame_seqno == blksize || data[0] & BLK_SEQ_LAST != 0 {
            let mut payload = [0u8; 8];
            payload[0] = ccs::BLOCK_UPLOAD | blk::RESPONSE;
            payload[1] = seqno;
            payload[2] = blksize;
            self.send(net, &payload);
            let _ = buf.push(&block);
            if last && seqno == frame_seqno {
                self.state = State::BlockUploadEndWait { size, buf };
            } else {
                self.state = State::BlockUploadStream {
                    blksize,
                    seqno: 0,
                    block: Vec::new(),
                    last: false,
                    size,
                    buf,
                };
            }
        } else {
            self.state = State::BlockUploadStream {
                blksize,
                seqno,
                block,
                last,
                size,
                buf,
            };
        }
        self.arm_timer(net);
    }

    fn on_block_upload_end<T: Copy>(
        &mut self,
        cs: u8,
        data: &[u8],
        size: Option<u32>,
        mut buf: TransferBuffer,
        net: &mut CanNet<T>,
    ) {
        if cs != scs::BLOCK_UPLOAD || data[0] & 0x03 != blk::END || data.len() < 3 {
            return self.protocol_error(net);
        }
        let n = usize::from((data[0] >> 2) & 0x07);
        buf.truncate_tail(n);
        if let Some(size) = size {
            if (buf.len() as u32) < size {
                return self.abort_with(net, SdoAbort::TypeLengthTooLow);
            }
            // Sub-frame padding beyond the n bookkeeping.
            buf.truncate_tail(buf.len() - size as usize);
        }
        let expected = u16::from_le_bytes([data[1], data[2]]);
        if expected != crc16(0, buf.payload()) {
            return self.abort_with(net, SdoAbort::CrcError);
        }
        let mut payload = [0u8; 8];
        payload[0] = ccs::BLOCK_UPLOAD | blk::END;
        self.send(net, &payload);
        self.finish(net, Ok(Some(buf.into_payload())));
    }

    // --- Completion and the DCF walk ---

    /// Starts the next record of the concise DCF stream, or confirms the
    /// bulk request when the stream is exhausted.
    fn next_dcf_record<T: Copy>(&mut self, net: &mut CanNet<T>) {
        let Some(walk) = &mut self.dcf else {
            return;
        };
        match walk.next_record() {
            Ok(Some((index, sub_index, data))) => {
                if let Some(req) = &mut self.current {
                    req.index = index;
                    req.sub_index = sub_index;
                }
                let buf = TransferBuffer::from_payload(data);
                self.begin_download_segmented(net, buf);
            }
            Ok(None) => {
                self.dcf = None;
                self.finish(net, Ok(None));
            }
            Err(code) => {
                self.dcf = None;
                self.finish(net, Err(code));
            }
        }
    }

    /// Completes the in-flight request, emits the confirmation and starts
    /// the next queued request.
    fn finish<T: Copy>(&mut self, net: &mut CanNet<T>, result: Result<Option<Vec<u8>>, SdoAbort>) {
        net.timer_stop(self.timer);
        self.state = State::Idle;
        let Some(req) = self.current.take() else {
            return;
        };
        // A successful record of a DCF walk continues the walk instead of
        // confirming.
        if self.dcf.is_some() {
            if result.is_ok() {
                self.current = Some(req);
                self.next_dcf_record(net);
                return;
            }
            self.dcf = None;
        }
        self.confirms.push(SdoConfirm {
            num: self.num,
            server: self.server,
            index: req.index,
            sub_index: req.sub_index,
            result,
        });
        if let Some(next) = self.queue.pop_front() {
            self.begin(net, next);
        }
    }

    fn protocol_error<T: Copy>(&mut self, net: &mut CanNet<T>) {
        self.abort_with(net, SdoAbort::InvalidCommandSpecifier);
    }

    fn abort_with<T: Copy>(&mut self, net: &mut CanNet<T>, code: SdoAbort) {
        let (index, sub_index) = self
            .current
            .as_ref()
            .map(|r| (r.index, r.sub_index))
            .unwrap_or((0, 0));
        let payload = abort_payload(ccs::ABORT, index, sub_index, code);
        self.send(net, &payload);
        self.finish(net, Err(code));
    }

    fn send<T: Copy>(&self, net: &mut CanNet<T>, payload: &[u8; 8]) {
        if let Ok(frame) = CanFrame::new(self.cob_tx, payload) {
            let _ = net.send(&frame);
        }
    }

    fn arm_timer<T: Copy>(&self, net: &mut CanNet<T>) {
        let timeout = self
            .current
            .as_ref()
            .map(|r| r.timeout_us)
            .unwrap_or(DEFAULT_TIMEOUT_US);
        net.timer_after(self.timer, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use core::cell::RefCell;

    struct Harness {
        net: CanNet<u8>,
        client: SdoClient,
        sent: Rc<RefCell<Vec<CanFrame>>>,
    }

    fn get_test_client() -> Harness {
        let mut net: CanNet<u8> = CanNet::new();
        let sent = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&sent);
        net.set_send_fn(Box::new(move |f| {
            sink.borrow_mut().push(*f);
            Ok(())
        }));
        let recv = net.recv_create(0);
        let timer = net.timer_create(0);
        let mut client = SdoClient::new(0, recv, timer);
        client.set_remote(&mut net, NodeId::try_from(3).unwrap());
        Harness { net, client, sent }
    }

    fn respond(h: &mut Harness, payload: [u8; 8]) {
        let frame = CanFrame::new(0x583, &payload).unwrap();
        h.client.on_frame(&frame, &mut h.net);
    }

    fn last_request(h: &Harness) -> [u8; 8] {
        let frames = h.sent.borrow();
        let frame = frames.last().expect("a request was sent");
        assert_eq!(frame.id, 0x603);
        frame.data().try_into().unwrap()
    }

    #[test]
    fn test_expedited_download() {
        let mut h = get_test_client();
        h.client
            .submit(
                &mut h.net,
                SdoClientRequest::download(0x2000, 0, 0xDEAD_BEEFu32.to_le_bytes().to_vec()),
            )
            .unwrap();
        assert_eq!(
            last_request(&h),
            [0x23, 0x00, 0x20, 0x00, 0xEF, 0xBE, 0xAD, 0xDE]
        );
        respond(&mut h, [0x60, 0x00, 0x20, 0x00, 0, 0, 0, 0]);
        let confirms = h.client.take_confirms();
        assert_eq!(confirms.len(), 1);
        assert_eq!(confirms[0].result, Ok(None));
        assert!(h.client.is_idle());
    }

    #[test]
    fn test_expedited_upload() {
        let mut h = get_test_client();
        h.client
            .submit(&mut h.net, SdoClientRequest::upload(0x2000, 0))
            .unwrap();
        assert_eq!(last_request(&h)[0], 0x40);
        respond(&mut h, [0x43, 0x00, 0x20, 0x00, 0x78, 0x56, 0x34, 0x12]);
        let confirms = h.client.take_confirms();
        assert_eq!(
            confirms[0].result,
            Ok(Some(0x1234_5678u32.to_le_bytes().to_vec()))
        );
    }

    #[test]
    fn test_segmented_upload() {
        let mut h = get_test_client();
        h.client
            .submit(&mut h.net, SdoClientRequest::upload(0x2001, 0))
            .unwrap();
        // Size-indicated segmented response: 10 bytes.
        respond(&mut h, [0x41, 0x01, 0x20, 0x00, 0x0A, 0, 0, 0]);
        assert_eq!(last_request(&h)[0], 0x60);
        respond(&mut h, [0x00, b'0', b'1', b'2', b'3', b'4', b'5', b'6']);
        assert_eq!(last_request(&h)[0], 0x70);
        // Last segment: 3 bytes, n = 4, toggle 1.
        respond(&mut h, [0x19, b'7', b'8', b'9', 0, 0, 0, 0]);
        let confirms = h.client.take_confirms();
        assert_eq!(confirms[0].result, Ok(Some(b"0123456789".to_vec())));
    }

    #[test]
    fn test_segmented_download() {
        let mut h = get_test_client();
        h.client
            .submit(
                &mut h.net,
                SdoClientRequest::download(0x2001, 0, b"0123456789".to_vec()),
            )
            .unwrap();
        let init = last_request(&h);
        assert_eq!(init[0], 0x21);
        assert_eq!(u32::from_le_bytes(init[4..8].try_into().unwrap()), 10);
        respond(&mut h, [0x60, 0x01, 0x20, 0x00, 0, 0, 0, 0]);
        let seg1 = last_request(&h);
        assert_eq!(seg1[0], 0x00);
        assert_eq!(&seg1[1..8], b"0123456");
        respond(&mut h, [0x20, 0, 0, 0, 0, 0, 0, 0]);
        let seg2 = last_request(&h);
        // Toggle 1, n = 4, last.
        assert_eq!(seg2[0], 0x19);
        assert_eq!(&seg2[1..4], b"789");
        respond(&mut h, [0x30, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(h.client.take_confirms()[0].result, Ok(None));
    }

    #[test]
    fn test_server_abort_confirms_with_code() {
        let mut h = get_test_client();
        h.client
            .submit(&mut h.net, SdoClientRequest::upload(0x5000, 0))
            .unwrap();
        respond(
            &mut h,
            abort_payload(scs::ABORT, 0x5000, 0, SdoAbort::NoObject),
        );
        let confirms = h.client.take_confirms();
        assert_eq!(confirms[0].result, Err(SdoAbort::NoObject));
    }

    #[test]
    fn test_timeout_confirms_once() {
        let mut h = get_test_client();
        h.client
            .submit(&mut h.net, SdoClientRequest::upload(0x2000, 0))
            .unwrap();
        h.net.set_time(DEFAULT_TIMEOUT_US + 1);
        assert!(h.net.pop_expired().is_some());
        h.client.on_timeout(&mut h.net);
        let confirms = h.client.take_confirms();
        assert_eq!(confirms.len(), 1);
        assert_eq!(confirms[0].result, Err(SdoAbort::Timeout));
        // The wire carries the abort too.
        assert_eq!(last_request(&h)[0], 0x80);
    }

    #[test]
    fn test_queueing_executes_in_order() {
        let mut h = get_test_client();
        h.client
            .submit(&mut h.net, SdoClientRequest::upload(0x2000, 0))
            .unwrap();
        h.client
            .submit(&mut h.net, SdoClientRequest::upload(0x2001, 0))
            .unwrap();
        // Only the first request is on the wire.
        assert_eq!(h.sent.borrow().len(), 1);
        respond(&mut h, [0x43, 0x00, 0x20, 0x00, 1, 0, 0, 0]);
        // Completion of the first starts the second.
        let second = last_request(&h);
        assert_eq!((second[1], second[2]), (0x01, 0x20));
        respond(&mut h, [0x43, 0x01, 0x20, 0x00, 2, 0, 0, 0]);
        assert_eq!(h.client.take_confirms().len(), 2);
    }

    #[test]
    fn test_block_download_roundtrip() {
        let mut h = get_test_client();
        let data: Vec<u8> = (0u8..20).collect();
        h.client
            .submit(
                &mut h.net,
                SdoClientRequest::download(0x2001, 0, data.clone())
                    .with_mode(TransferMode::Block { fallback: false }),
            )
            .unwrap();
        let init = last_request(&h);
        assert_eq!(init[0], 0xC6);
        assert_eq!(u32::from_le_bytes(init[4..8].try_into().unwrap()), 20);
        // Server grants blksize 127.
        respond(&mut h, [0xA4, 0x01, 0x20, 0x00, 127, 0, 0, 0]);
        {
            let frames = h.sent.borrow();
            // Initiate + 3 sub-frames (7 + 7 + 6 bytes).
            assert_eq!(frames.len(), 4);
            assert_eq!(frames[1].data()[0], 1);
            assert_eq!(frames[2].data()[0], 2);
            assert_eq!(frames[3].data()[0], 0x83);
        }
        // Ack all three.
        respond(&mut h, [0xA2, 3, 127, 0, 0, 0, 0, 0]);
        let end = last_request(&h);
        assert_eq!(end[0] & 0xE3, 0xC1);
        assert_eq!(usize::from((end[0] >> 2) & 0x07), 1);
        assert_eq!(u16::from_le_bytes([end[1], end[2]]), crc16(0, &data));
        respond(&mut h, [0xA1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(h.client.take_confirms()[0].result, Ok(None));
    }

    #[test]
    fn test_block_download_falls_back_to_segmented() {
        let mut h = get_test_client();
        h.client
            .submit(
                &mut h.net,
                SdoClientRequest::download(0x2001, 0, b"0123456789".to_vec())
                    .with_mode(TransferMode::Block { fallback: true }),
            )
            .unwrap();
        assert_eq!(last_request(&h)[0], 0xC6);
        // Server rejects block transfers.
        respond(
            &mut h,
            abort_payload(scs::ABORT, 0x2001, 0, SdoAbort::InvalidCommandSpecifier),
        );
        // The client downgraded: a segmented initiate is on the wire and no
        // confirmation was produced yet.
        assert_eq!(last_request(&h)[0], 0x21);
        assert!(h.client.take_confirms().is_empty());
    }

    #[test]
    fn test_block_upload_roundtrip() {
        let mut h = get_test_client();
        h.client
            .submit(
                &mut h.net,
                SdoClientRequest::upload(0x2001, 0)
                    .with_mode(TransferMode::Block { fallback: false }),
            )
            .unwrap();
        let init = last_request(&h);
        assert_eq!(init[0], 0xA4);
        assert_eq!(init[4], 127);
        // Server announces 10 bytes.
        respond(&mut h, [0xC6, 0x01, 0x20, 0x00, 10, 0, 0, 0]);
        assert_eq!(last_request(&h)[0], 0xA3);
        // Two sub-frames.
        respond(&mut h, [0x01, b'0', b'1', b'2', b'3', b'4', b'5', b'6']);
        respond(&mut h, [0x82, b'7', b'8', b'9', 0, 0, 0, 0]);
        let ack = last_request(&h);
        assert_eq!(ack[0], 0xA2);
        assert_eq!(ack[1], 2);
        // End with n = 4 and the payload CRC.
        let crc = crc16(0, b"0123456789");
        let mut end = [0xC1 | (4 << 2), 0, 0, 0, 0, 0, 0, 0];
        end[1..3].copy_from_slice(&crc.to_le_bytes());
        respond(&mut h, end);
        assert_eq!(last_request(&h)[0], 0xA1);
        assert_eq!(
            h.client.take_confirms()[0].result,
            Ok(Some(b"0123456789".to_vec()))
        );
    }

    #[test]
    fn test_dcf_walk_downloads_every_record() {
        let mut h = get_test_client();
        // Two records: (0x2000, 0) <- u32, (0x2001, 1) <- 2 bytes.
        let mut stream = Vec::new();
        stream.extend_from_slice(&2u32.to_le_bytes());
        stream.extend_from_slice(&0x2000u16.to_le_bytes());
        stream.push(0);
        stream.extend_from_slice(&4u32.to_le_bytes());
        stream.extend_from_slice(&0xAABB_CCDDu32.to_le_bytes());
        stream.extend_from_slice(&0x2001u16.to_le_bytes());
        stream.push(1);
        stream.extend_from_slice(&2u32.to_le_bytes());
        stream.extend_from_slice(&[0x11, 0x22]);

        h.client
            .submit(&mut h.net, SdoClientRequest::download_dcf(stream))
            .unwrap();
        let first = last_request(&h);
        assert_eq!((first[1], first[2], first[3]), (0x00, 0x20, 0));
        respond(&mut h, [0x60, 0x00, 0x20, 0x00, 0, 0, 0, 0]);
        let second = last_request(&h);
        assert_eq!((second[1], second[2], second[3]), (0x01, 0x20, 1));
        // 2-byte expedited download: n = 2.
        assert_eq!(second[0], 0x2B);
        respond(&mut h, [0x60, 0x01, 0x20, 0x01, 0, 0, 0, 0]);
        let confirms = h.client.take_confirms();
        assert_eq!(confirms.len(), 1);
        assert_eq!(confirms[0].result, Ok(None));
    }

    #[test]
    fn test_dcf_walk_stops_on_abort() {
        let mut h = get_test_client();
        let mut stream = Vec::new();
        stream.extend_from_slice(&2u32.to_le_bytes());
        for _ in 0..2 {
            stream.extend_from_slice(&0x2000u16.to_le_bytes());
            stream.push(0);
            stream.extend_from_slice(&1u32.to_le_bytes());
            stream.push(0xFF);
        }
        h.client
            .submit(&mut h.net, SdoClientRequest::download_dcf(stream))
            .unwrap();
        let count_before = h.sent.borrow().len();
        respond(
            &mut h,
            abort_payload(scs::ABORT, 0x2000, 0, SdoAbort::ReadOnly),
        );
        let confirms = h.client.take_confirms();
        assert_eq!(confirms[0].result, Err(SdoAbort::ReadOnly));
        assert_eq!(confirms[0].index, 0x2000);
        // No further records were attempted.
        assert_eq!(h.sent.borrow().len(), count_before);
    }

    #[test]
    fn test_stop_flushes_queue_with_device_state() {
        let mut h = get_test_client();
        h.client
            .submit(&mut h.net, SdoClientRequest::upload(0x2000, 0))
            .unwrap();
        h.client
            .submit(&mut h.net, SdoClientRequest::upload(0x2001, 0))
            .unwrap();
        h.client.stop(&mut h.net);
        let confirms = h.client.take_confirms();
        assert_eq!(confirms.len(), 2);
        assert!(
            confirms
                .iter()
                .all(|c| c.result == Err(SdoAbort::DeviceState))
        );
    }
}
