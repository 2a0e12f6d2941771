// Copyright (C) 2018-2019, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Packetization of flushed stream data.
//!
//! The [`SendCtl`] turns byte ranges flushed by streams into STREAM and
//! RESET_STREAM frames inside outgoing packets, and keeps those packets until
//! they are acknowledged. Every frame carries a [`StreamRec`] so that ack
//! events can be routed back to the stream that produced it.

use std::cmp;

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::Config;
use crate::Error;
use crate::Result;

use crate::frame;
use crate::frame::Frame;
use crate::range_buf::RangeBuf;

/// Default size of outgoing packets.
pub const DEFAULT_PACKET_SIZE: usize = 1370;

// Short header: flags byte and an 8-byte destination connection ID.
const SHORT_HEADER_LEN: usize = 1 + 8;

const AEAD_TAG_LEN: usize = 16;

/// The encoded length of a packet number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketNumberLen {
    One   = 1,
    Two   = 2,
    Three = 3,
    Four  = 4,
}

impl PacketNumberLen {
    pub fn len(self) -> usize {
        self as usize
    }
}

/// The queue a packet is buffered in while sending is deferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufPacketType {
    HighestPrio,
    OtherPrio,
}

impl BufPacketType {
    fn index(self) -> usize {
        match self {
            BufPacketType::HighestPrio => 0,
            BufPacketType::OtherPrio => 1,
        }
    }
}

/// Returns the number of frame bytes a packet of `size` bytes can carry.
pub fn payload_capacity(size: usize, pn_len: PacketNumberLen) -> usize {
    size.saturating_sub(SHORT_HEADER_LEN + pn_len.len() + AEAD_TAG_LEN)
}

/// What a stream record stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Stream { off: u64, len: usize, fin: bool },

    Reset { error_code: u64, final_size: u64 },
}

/// A frame carried by a packet on behalf of a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRec {
    pub stream_id: u64,

    pub kind: RecordKind,

    frame_off: usize,

    frame_len: usize,
}

impl StreamRec {
    /// Returns true if the frame carries the stream's FIN.
    pub fn is_fin(&self) -> bool {
        matches!(self.kind, RecordKind::Stream { fin: true, .. })
    }

    pub fn is_reset(&self) -> bool {
        matches!(self.kind, RecordKind::Reset { .. })
    }
}

/// Writes frames into packet payloads.
pub trait FrameGenerator {
    /// Writes `frame` into `out` and returns the number of bytes written.
    fn gen_frame(&self, frame: &Frame, out: &mut [u8]) -> Result<usize>;
}

/// Generates frames in their RFC 9000 encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct WireGenerator;

impl FrameGenerator for WireGenerator {
    fn gen_frame(&self, frame: &Frame, out: &mut [u8]) -> Result<usize> {
        let mut b = octets::OctetsMut::with_slice(out);
        frame.to_bytes(&mut b)
    }
}

/// An outgoing packet.
pub struct Packet {
    pn: Option<u64>,

    pn_len: PacketNumberLen,

    buf: Vec<u8>,

    len: usize,

    records: SmallVec<[StreamRec; 4]>,
}

impl Packet {
    fn new(size: usize, pn_len: PacketNumberLen) -> Packet {
        Packet {
            pn: None,
            pn_len,
            buf: vec![0; size],
            len: 0,
            records: SmallVec::new(),
        }
    }

    /// Returns the packet number, once the packet has been scheduled.
    pub fn pn(&self) -> Option<u64> {
        self.pn
    }

    pub fn pn_len(&self) -> PacketNumberLen {
        self.pn_len
    }

    /// Returns the number of frame bytes the packet can hold.
    pub fn capacity(&self) -> usize {
        payload_capacity(self.buf.len(), self.pn_len)
    }

    /// Returns the number of frame bytes still available.
    pub fn avail(&self) -> usize {
        self.capacity().saturating_sub(self.len)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn records(&self) -> &[StreamRec] {
        &self.records
    }

    /// Returns true if the packet carries a frame for `stream_id`.
    pub fn has_stream(&self, stream_id: u64) -> bool {
        self.records.iter().any(|r| r.stream_id == stream_id)
    }

    /// Parses the frames carried by the packet.
    pub fn frames(&self) -> Result<Vec<Frame>> {
        frame::parse_frames(self.payload())
    }

    fn push_encoded(&mut self, stream_id: u64, frame: &Frame, bytes: &[u8]) {
        let kind = match frame {
            Frame::Stream { data, .. } => RecordKind::Stream {
                off: data.off(),
                len: data.len(),
                fin: data.fin(),
            },

            Frame::ResetStream {
                error_code,
                final_size,
                ..
            } => RecordKind::Reset {
                error_code: *error_code,
                final_size: *final_size,
            },
        };

        let rec = StreamRec {
            stream_id,
            kind,
            frame_off: 0,
            frame_len: 0,
        };

        self.push_raw(rec, bytes);
    }

    fn push_raw(&mut self, mut rec: StreamRec, bytes: &[u8]) {
        let start = self.len;

        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();

        rec.frame_off = start;
        rec.frame_len = bytes.len();

        self.records.push(rec);
    }

    fn frame_bytes(&self, rec: &StreamRec) -> &[u8] {
        &self.buf[rec.frame_off..rec.frame_off + rec.frame_len]
    }

    /// Drops the STREAM frames of `stream_id`, returning how many were
    /// removed.
    fn elide(&mut self, stream_id: u64) -> usize {
        let (elided, kept): (Vec<StreamRec>, Vec<StreamRec>) =
            self.records.drain(..).partition(|r| {
                r.stream_id == stream_id && !r.is_reset()
            });

        if elided.is_empty() {
            self.records.extend(kept);
            return 0;
        }

        let size = self.buf.len();
        let old = std::mem::replace(&mut self.buf, vec![0; size]);
        self.len = 0;

        for rec in kept {
            let (off, len) = (rec.frame_off, rec.frame_len);
            self.push_raw(rec, &old[off..off + len]);
        }

        elided.len()
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "pn={:?} pn_len={} len={} records={}",
            self.pn,
            self.pn_len.len(),
            self.len,
            self.records.len()
        )
    }
}

// State of a queue before frames are added to it.
struct QueueMark {
    packets: usize,

    // Payload length and record count of the last packet.
    last: Option<(usize, usize)>,

    next_pn: u64,
}

/// Builds, schedules and tracks outgoing packets.
pub struct SendCtl {
    config: Config,

    gen: Box<dyn FrameGenerator>,

    scheduled: VecDeque<Packet>,

    buffered: [VecDeque<Packet>; 2],

    unacked: VecDeque<Packet>,

    next_pn: u64,

    trace_id: String,
}

impl SendCtl {
    pub fn new(config: &Config) -> SendCtl {
        Self::with_generator(config, Box::new(WireGenerator))
    }

    pub fn with_generator(
        config: &Config, gen: Box<dyn FrameGenerator>,
    ) -> SendCtl {
        SendCtl {
            config: config.clone(),
            gen,
            scheduled: VecDeque::new(),
            buffered: [VecDeque::new(), VecDeque::new()],
            unacked: VecDeque::new(),
            next_pn: 1,
            trace_id: String::new(),
        }
    }

    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn n_scheduled(&self) -> usize {
        self.scheduled.len()
    }

    pub fn n_buffered(&self, bpt: BufPacketType) -> usize {
        self.buffered[bpt.index()].len()
    }

    /// Returns the number of sent packets waiting for an acknowledgement.
    pub fn n_in_flight(&self) -> usize {
        self.unacked.len()
    }

    pub fn scheduled(&self) -> impl Iterator<Item = &Packet> {
        self.scheduled.iter()
    }

    pub fn buffered(&self, bpt: BufPacketType) -> impl Iterator<Item = &Packet> {
        self.buffered[bpt.index()].iter()
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &Packet> {
        self.unacked.iter()
    }

    /// Returns the frame capacity of a fresh packet in the current
    /// scheduling mode.
    pub fn max_payload(&self) -> usize {
        payload_capacity(self.config.packet_size, self.new_pn_len())
    }

    /// Returns the buffered queue used for a stream of the given priority.
    pub fn buffered_type(&self, priority: u16) -> BufPacketType {
        match self.config.buffered_packet_type {
            Some(bpt) => bpt,

            None if priority <= 1 => BufPacketType::HighestPrio,

            None => BufPacketType::OtherPrio,
        }
    }

    fn new_pn_len(&self) -> PacketNumberLen {
        if self.config.schedule_immediately {
            self.config.calc_pn_len
        } else {
            self.config.guess_pn_len
        }
    }

    /// Packetizes stream data, splitting it across as many packets as
    /// needed.
    ///
    /// Returns the number of frames generated, each of which holds a record
    /// for the stream until acknowledged. On failure no frame of `data` is
    /// left in any packet.
    pub fn push_stream_data(
        &mut self, stream_id: u64, data: RangeBuf, bpt: BufPacketType,
    ) -> Result<usize> {
        let mark = self.mark(bpt);

        match self.push_stream_frames(stream_id, data, bpt) {
            Ok(added) => Ok(added),

            Err(e) => {
                self.rollback(bpt, mark);

                Err(e)
            },
        }
    }

    fn push_stream_frames(
        &mut self, stream_id: u64, mut data: RangeBuf, bpt: BufPacketType,
    ) -> Result<usize> {
        let mut added = 0;

        loop {
            let hdr = frame::stream_header_len(stream_id, data.off());

            // A FIN-only frame needs nothing but the header.
            let need = hdr + cmp::min(data.len(), 1);

            let avail = self.writeable_packet(bpt, need)?;

            let room = cmp::min(avail - hdr, frame::MAX_STREAM_FRAME_DATA);

            let rest = if room < data.len() {
                Some(data.split_off(room))
            } else {
                None
            };

            let frame = Frame::Stream { stream_id, data };

            trace!("{} tx frm {:?}", self.trace_id, frame);

            let bytes = self.encode(&frame, avail)?;
            self.last_packet(bpt)?.push_encoded(stream_id, &frame, &bytes);
            added += 1;

            match rest {
                Some(r) => data = r,

                None => break,
            }
        }

        Ok(added)
    }

    /// Packetizes a RESET_STREAM frame.
    pub fn push_reset(
        &mut self, stream_id: u64, error_code: u64, final_size: u64,
        bpt: BufPacketType,
    ) -> Result<()> {
        let frame = Frame::ResetStream {
            stream_id,
            error_code,
            final_size,
        };

        let avail = self.writeable_packet(bpt, frame.wire_len())?;

        trace!("{} tx frm {:?}", self.trace_id, frame);

        let bytes = self.encode(&frame, avail)?;
        self.last_packet(bpt)?.push_encoded(stream_id, &frame, &bytes);

        Ok(())
    }

    fn mark(&mut self, bpt: BufPacketType) -> QueueMark {
        let next_pn = self.next_pn;
        let queue = self.queue_mut(bpt);

        QueueMark {
            packets: queue.len(),
            last: queue.back().map(|p| (p.len, p.records.len())),
            next_pn,
        }
    }

    // Drops whatever was added to the target queue since `mark`.
    fn rollback(&mut self, bpt: BufPacketType, mark: QueueMark) {
        if self.config.schedule_immediately {
            self.next_pn = mark.next_pn;
        }

        let queue = self.queue_mut(bpt);
        queue.truncate(mark.packets);

        if let (Some(pkt), Some((len, records))) = (queue.back_mut(), mark.last)
        {
            pkt.len = len;
            pkt.records.truncate(records);
        }
    }

    fn queue_mut(&mut self, bpt: BufPacketType) -> &mut VecDeque<Packet> {
        if self.config.schedule_immediately {
            &mut self.scheduled
        } else {
            &mut self.buffered[bpt.index()]
        }
    }

    fn last_packet(&mut self, bpt: BufPacketType) -> Result<&mut Packet> {
        self.queue_mut(bpt).back_mut().ok_or(Error::Done)
    }

    // Makes sure the last packet of the target queue has at least `need`
    // bytes available, opening a new one if it doesn't, and returns how many
    // bytes it has.
    fn writeable_packet(
        &mut self, bpt: BufPacketType, need: usize,
    ) -> Result<usize> {
        let pn_len = self.new_pn_len();
        let size = self.config.packet_size;

        if payload_capacity(size, pn_len) < need {
            return Err(Error::BufferTooShort);
        }

        if let Some(avail) = self.queue_mut(bpt).back().map(|p| p.avail()) {
            if avail >= need {
                return Ok(avail);
            }
        }

        let mut pkt = Packet::new(size, pn_len);

        if self.config.schedule_immediately {
            pkt.pn = Some(self.next_pn);
            self.next_pn += 1;
        }

        let avail = pkt.avail();
        self.queue_mut(bpt).push_back(pkt);

        Ok(avail)
    }

    fn encode(&self, frame: &Frame, avail: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; avail];

        match self.gen.gen_frame(frame, &mut buf) {
            Ok(0) | Err(_) => Err(Error::FrameGenFail),

            Ok(written) => {
                buf.truncate(written);
                Ok(buf)
            },
        }
    }

    /// Moves buffered packets to the scheduled queue, assigning packet
    /// numbers.
    ///
    /// A packet built with a shorter packet number than the one that is now
    /// needed loses capacity. Frames that no longer fit are moved to a new
    /// packet, and a frame too large for any packet is split in two. The IDs
    /// of streams that gained a record through splitting are returned.
    pub fn schedule_buffered(
        &mut self, bpt: BufPacketType,
    ) -> Result<SmallVec<[u64; 4]>> {
        let pn_len = self.config.calc_pn_len;
        let size = self.config.packet_size;

        let mut gained = SmallVec::new();

        while let Some(pkt) = self.buffered[bpt.index()].pop_front() {
            let out = if pkt.pn_len >= pn_len ||
                pkt.len <= payload_capacity(size, pn_len)
            {
                let mut pkt = pkt;
                pkt.pn_len = cmp::max(pkt.pn_len, pn_len);

                vec![pkt]
            } else {
                debug!(
                    "{} repacketize {:?}, pn_len {} -> {}",
                    self.trace_id,
                    pkt,
                    pkt.pn_len.len(),
                    pn_len.len()
                );

                self.repacketize(&pkt, size, pn_len, &mut gained)?
            };

            for mut pkt in out {
                pkt.pn = Some(self.next_pn);
                self.next_pn += 1;

                self.scheduled.push_back(pkt);
            }
        }

        Ok(gained)
    }

    fn repacketize(
        &self, old: &Packet, size: usize, pn_len: PacketNumberLen,
        gained: &mut SmallVec<[u64; 4]>,
    ) -> Result<Vec<Packet>> {
        let mut out = vec![Packet::new(size, pn_len)];
        let cap = payload_capacity(size, pn_len);

        for rec in &old.records {
            let bytes = old.frame_bytes(rec);

            if bytes.len() <= cap {
                place_raw(&mut out, size, pn_len, rec, bytes);
                continue;
            }

            let (stream_id, mut data) =
                match frame::parse_frames(bytes)?.pop() {
                    Some(Frame::Stream { stream_id, data }) => (stream_id, data),

                    _ => return Err(Error::BufferTooShort),
                };

            let second = data.split_off(data.len() / 2);

            for half in [data, second] {
                let frame = Frame::Stream {
                    stream_id,
                    data: half,
                };

                let len = frame.wire_len();

                let idx = match out.iter().position(|p| p.avail() >= len) {
                    Some(idx) => idx,

                    None => {
                        out.push(Packet::new(size, pn_len));
                        out.len() - 1
                    },
                };

                let bytes = self.encode(&frame, out[idx].avail())?;
                out[idx].push_encoded(stream_id, &frame, &bytes);
            }

            gained.push(stream_id);
        }

        Ok(out)
    }

    /// Removes the not yet sent STREAM frames of `stream_id`, returning how
    /// many were dropped.
    pub fn elide_stream_frames(&mut self, stream_id: u64) -> usize {
        let mut elided = 0;

        let queues = std::iter::once(&mut self.scheduled)
            .chain(self.buffered.iter_mut());

        for queue in queues {
            for pkt in queue.iter_mut() {
                elided += pkt.elide(stream_id);
            }

            queue.retain(|p| !p.records.is_empty());
        }

        if elided > 0 {
            trace!(
                "{} elided {} frames of stream {}",
                self.trace_id,
                elided,
                stream_id
            );
        }

        elided
    }

    pub fn next_packet_to_send(&mut self) -> Option<Packet> {
        self.scheduled.pop_front()
    }

    /// Records that `pkt` was written to the network.
    pub fn sent_packet(&mut self, pkt: Packet) {
        trace!("{} sent pkt {:?}", self.trace_id, pkt);

        self.unacked.push_back(pkt);
    }

    /// Removes and returns the acknowledged packet.
    pub fn ack_packet(&mut self, pn: u64) -> Option<Packet> {
        let idx = self.unacked.iter().position(|p| p.pn == Some(pn))?;

        let pkt = self.unacked.remove(idx)?;

        trace!("{} acked pkt {:?}", self.trace_id, pkt);

        Some(pkt)
    }

    /// Schedules the content of a lost packet for retransmission under a new
    /// packet number.
    ///
    /// Stream records move along with the frames, so no stream loses track
    /// of them.
    pub fn lose_packet(&mut self, pn: u64) -> Result<u64> {
        let idx = self
            .unacked
            .iter()
            .position(|p| p.pn == Some(pn))
            .ok_or(Error::Done)?;

        let mut pkt = self.unacked.remove(idx).ok_or(Error::Done)?;

        let new_pn = self.next_pn;
        self.next_pn += 1;

        debug!("{} lost pkt {}, resending as {}", self.trace_id, pn, new_pn);

        pkt.pn = Some(new_pn);
        self.scheduled.push_back(pkt);

        Ok(new_pn)
    }
}

// Appends raw frame bytes to the first packet with enough room, keeping the
// order of frames otherwise.
fn place_raw(
    out: &mut Vec<Packet>, size: usize, pn_len: PacketNumberLen,
    rec: &StreamRec, bytes: &[u8],
) {
    match out.iter_mut().find(|p| p.avail() >= bytes.len()) {
        Some(pkt) => pkt.push_raw(rec.clone(), bytes),

        None => {
            let mut pkt = Packet::new(size, pn_len);
            pkt.push_raw(rec.clone(), bytes);
            out.push(pkt);
        },
    }
}
