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

use std::cmp;

use std::collections::hash_map;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;

use std::io::IoSlice;
use std::io::IoSliceMut;

use std::time::Duration;
use std::time::Instant;

use smallvec::SmallVec;

use crate::flowcontrol::ConnFlow;
use crate::flowcontrol::SendCap;
use crate::range_buf::RangeBuf;
use crate::send_ctl::BufPacketType;
use crate::send_ctl::Packet;
use crate::send_ctl::RecordKind;
use crate::send_ctl::SendCtl;
use crate::send_ctl::StreamRec;

use crate::Config;
use crate::Error;
use crate::Result;
use crate::Shutdown;

pub use recv_buf::Reassembly;

/// The priority given to new streams. Lower is more urgent.
pub const DEFAULT_PRIORITY: u16 = 16;

const MIN_PRIORITY: i32 = 1;
const MAX_PRIORITY: i32 = 256;

// Error code used when resetting a stream in response to a peer reset.
const RESET_ACK_ERROR_CODE: u64 = 0;

/// A simple no-op hasher for Stream IDs.
///
/// Stream IDs are unique within a connection, so we can save effort by
/// avoiding using a more complicated algorithm.
#[derive(Default)]
pub struct StreamIdHasher {
    id: u64,
}

impl std::hash::Hasher for StreamIdHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.id
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.id = id;
    }

    #[inline]
    fn write(&mut self, _: &[u8]) {
        // We need a default write() for the trait but stream IDs will always
        // be a u64 so we just delegate to write_u64.
        unimplemented!()
    }
}

type BuildStreamIdHasher = std::hash::BuildHasherDefault<StreamIdHasher>;

pub type StreamIdHashMap<V> = HashMap<u64, V, BuildStreamIdHasher>;
pub type StreamIdHashSet = HashSet<u64, BuildStreamIdHasher>;

/// Whether a stream's writes count against the connection send cap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlowLimit {
    /// Writes reserve budget from the connection cap, and received data is
    /// accounted in the connection receive window.
    #[default]
    Connection,

    /// The stream is only limited by its own windows.
    Unlimited,
}

/// Per-stream settings fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    /// Initial send offset limit granted by the peer.
    pub max_send_off: u64,

    /// Initial receive window.
    pub max_recv_data: u64,

    /// Upper bound of the auto-tuned receive window.
    pub max_recv_window: u64,

    pub flow_limit: FlowLimit,

    pub reassembly: Reassembly,

    /// Whether `on_new_stream` is called when the stream is created.
    pub call_on_new: bool,

    /// Whether event dispatch makes at most one callback per event.
    pub dispatch_once: bool,
}

impl StreamOptions {
    /// Returns the options of a regular stream under `config`.
    pub fn new(config: &Config) -> StreamOptions {
        StreamOptions {
            max_send_off: config.initial_max_send_off,
            max_recv_data: config.initial_max_stream_data,
            max_recv_window: config.max_stream_window,
            flow_limit: FlowLimit::Connection,
            reassembly: config.reassembly,
            call_on_new: true,
            dispatch_once: false,
        }
    }
}

impl Default for StreamOptions {
    fn default() -> StreamOptions {
        StreamOptions::new(&Config::default())
    }
}

/// Application callbacks of a stream.
///
/// Every callback receives the stream it fires for and the connection
/// context, so it can read, write, flush and shut the stream down from
/// within.
pub trait StreamHandler {
    fn on_new_stream(&mut self, _stream: &mut Stream, _conn: &mut ConnCtx) {}

    fn on_read_ready(&mut self, _stream: &mut Stream, _conn: &mut ConnCtx) {}

    fn on_write_ready(&mut self, _stream: &mut Stream, _conn: &mut ConnCtx) {}

    /// Called exactly once, after both directions were shut down locally or
    /// when the stream is destroyed.
    fn on_close(&mut self, _stream: &mut Stream, _conn: &mut ConnCtx) {}
}

/// Lifecycle flags of a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFlags {
    pub want_read: bool,

    pub want_write: bool,

    /// The application is done reading.
    pub read_done: bool,

    /// The application is done writing.
    pub write_done: bool,

    pub fin_sent: bool,

    pub fin_recvd: bool,

    /// A RESET_STREAM frame is waiting to be packetized.
    pub send_rst: bool,

    pub rst_sent: bool,

    pub rst_recvd: bool,

    /// Writes are limited by the stream's send offset limit.
    pub send_blocked: bool,

    /// Writes are limited by the connection send cap.
    pub conn_blocked: bool,

    /// The close callback is due.
    pub call_on_close: bool,

    pub on_new_done: bool,

    pub on_close_done: bool,

    /// The stream may be freed.
    pub free_pending: bool,

    /// Frame generation failed and the connection must be aborted.
    pub abort_conn: bool,
}

/// Coarse lifecycle state of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Open,

    /// Writing finished with a FIN or a reset, reading continues.
    HalfClosedLocal,

    /// The peer finished sending, writing continues.
    HalfClosedRemote,

    /// Both directions were shut down locally.
    Closing,

    /// The close callback fired and nothing is left to acknowledge.
    Terminal,
}

/// Connection state shared by all streams.
pub struct ConnCtx {
    /// Connection send cap.
    cap: SendCap,

    /// Connection receive accounting.
    flow: ConnFlow,

    send_ctl: SendCtl,

    /// Streams with a pending close callback, free or abort request.
    service: BTreeSet<u64>,

    /// Streams with a RESET_STREAM frame waiting to be packetized.
    sending: BTreeSet<u64>,

    /// Streams blocked by their send limit, with the offset they blocked at.
    blocked: StreamIdHashMap<u64>,

    /// Streams that should send a MAX_STREAM_DATA update.
    almost_full: StreamIdHashSet,

    /// Streams whose reading was abandoned before the peer finished.
    stopped: StreamIdHashSet,

    trace_id: String,
}

impl ConnCtx {
    pub fn new(config: &Config) -> ConnCtx {
        ConnCtx::with_send_ctl(config, SendCtl::new(config))
    }

    pub fn with_send_ctl(config: &Config, send_ctl: SendCtl) -> ConnCtx {
        ConnCtx {
            cap: SendCap::new(config.initial_max_data),
            flow: ConnFlow::new(
                config.initial_max_data,
                config.max_connection_window,
            ),
            send_ctl,
            service: BTreeSet::new(),
            sending: BTreeSet::new(),
            blocked: StreamIdHashMap::default(),
            almost_full: StreamIdHashSet::default(),
            stopped: StreamIdHashSet::default(),
            trace_id: String::from("?"),
        }
    }

    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
        self.send_ctl.set_trace_id(trace_id);
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn cap(&self) -> &SendCap {
        &self.cap
    }

    pub fn flow(&self) -> &ConnFlow {
        &self.flow
    }

    pub fn send_ctl(&self) -> &SendCtl {
        &self.send_ctl
    }

    pub fn send_ctl_mut(&mut self) -> &mut SendCtl {
        &mut self.send_ctl
    }

    /// Returns true if the stream needs servicing.
    pub fn is_service(&self, stream_id: u64) -> bool {
        self.service.contains(&stream_id)
    }

    /// Returns true if the stream has a reset waiting to be packetized.
    pub fn is_sending(&self, stream_id: u64) -> bool {
        self.sending.contains(&stream_id)
    }

    /// Returns an iterator over blocked streams and the offsets they blocked
    /// at.
    pub fn blocked(&self) -> hash_map::Iter<u64, u64> {
        self.blocked.iter()
    }

    pub fn is_almost_full(&self, stream_id: u64) -> bool {
        self.almost_full.contains(&stream_id)
    }

    pub fn is_stopped(&self, stream_id: u64) -> bool {
        self.stopped.contains(&stream_id)
    }

    fn forget(&mut self, stream_id: u64) {
        self.service.remove(&stream_id);
        self.sending.remove(&stream_id);
        self.blocked.remove(&stream_id);
        self.almost_full.remove(&stream_id);
        self.stopped.remove(&stream_id);
    }
}

/// A QUIC stream.
pub struct Stream {
    id: u64,

    /// Receive-side stream buffer.
    recv: recv_buf::RecvBuf,

    /// Send-side stream buffer.
    send: send_buf::SendBuf,

    flow_limit: FlowLimit,

    dispatch_once: bool,

    /// Frames packetized on behalf of the stream and not yet acknowledged.
    n_unacked: usize,

    priority: u16,

    /// The error code of the RESET_STREAM frame we send, if any.
    rst_code: Option<u64>,

    flags: StreamFlags,

    handler: Option<Box<dyn StreamHandler>>,
}

impl Stream {
    /// Creates a new stream. No callback is made.
    pub fn new(
        id: u64, handler: Option<Box<dyn StreamHandler>>, opts: &StreamOptions,
    ) -> Stream {
        Stream {
            id,
            recv: recv_buf::RecvBuf::new(
                opts.max_recv_data,
                opts.max_recv_window,
                opts.reassembly,
            ),
            send: send_buf::SendBuf::new(opts.max_send_off),
            flow_limit: opts.flow_limit,
            dispatch_once: opts.dispatch_once,
            n_unacked: 0,
            priority: DEFAULT_PRIORITY,
            rst_code: None,
            flags: StreamFlags::default(),
            handler,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> &StreamFlags {
        &self.flags
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn flow_limit(&self) -> FlowLimit {
        self.flow_limit
    }

    pub fn reassembly(&self) -> Reassembly {
        self.recv.reassembly()
    }

    /// Returns the number of frames awaiting acknowledgement.
    pub fn n_unacked(&self) -> usize {
        self.n_unacked
    }

    /// Returns the offset of the next byte to be read.
    pub fn read_offset(&self) -> u64 {
        self.recv.off()
    }

    /// Returns the largest offset received from the peer.
    pub fn recv_max_off(&self) -> u64 {
        self.recv.max_off()
    }

    /// Returns the receive offset limit advertised to the peer.
    pub fn recv_max_data(&self) -> u64 {
        self.recv.max_data()
    }

    pub fn recv_fin_off(&self) -> Option<u64> {
        self.recv.fin_off()
    }

    /// Returns the number of out-of-order ranges held for reading.
    pub fn recv_ranges(&self) -> usize {
        self.recv.ranges()
    }

    /// Returns the total number of bytes written by the application.
    pub fn written(&self) -> u64 {
        self.send.off()
    }

    /// Returns the offset up to which data was handed to packetization.
    pub fn flushed(&self) -> u64 {
        self.send.flush_off()
    }

    /// Returns the offset up to which data was put on the wire.
    pub fn sent_off(&self) -> u64 {
        self.send.sent_off()
    }

    /// Returns the offset up to which data was acknowledged.
    pub fn acked_off(&self) -> u64 {
        self.send.ack_off()
    }

    /// Returns true if all written data and the FIN were acknowledged.
    pub fn is_send_complete(&self) -> bool {
        self.send.is_complete()
    }

    /// Returns the number of written bytes not yet flushed.
    pub fn buffered(&self) -> usize {
        self.send.buffered()
    }

    pub fn max_send_off(&self) -> u64 {
        self.send.max_data()
    }

    /// Returns the offset at which writes last blocked on the send limit.
    pub fn blocked_off(&self) -> Option<u64> {
        self.send.blocked_at()
    }

    pub fn set_handler(&mut self, handler: Box<dyn StreamHandler>) {
        self.handler = Some(handler);
    }

    /// Returns true if a read would make progress or report an end.
    pub fn is_readable(&self) -> bool {
        !self.flags.read_done &&
            (self.recv.ready() ||
                self.recv.is_fin() ||
                self.recv.error().is_some())
    }

    /// Returns true if a write would be accepted.
    pub fn is_writable(&self, conn: &ConnCtx) -> bool {
        !self.flags.write_done &&
            !self.flags.send_rst &&
            !self.flags.rst_sent &&
            !self.flags.rst_recvd &&
            self.send.cap() > 0 &&
            (self.flow_limit == FlowLimit::Unlimited || conn.cap.avail() > 0)
    }

    /// Returns true if written data waits to be flushed.
    pub fn is_flushable(&self) -> bool {
        self.send.is_flushable()
    }

    pub fn state(&self) -> StreamState {
        let f = &self.flags;

        if f.free_pending && f.on_close_done {
            return StreamState::Terminal;
        }

        if f.read_done && f.write_done {
            return StreamState::Closing;
        }

        if f.fin_sent || f.rst_sent || f.send_rst {
            return StreamState::HalfClosedLocal;
        }

        if f.fin_recvd || f.rst_recvd {
            return StreamState::HalfClosedRemote;
        }

        StreamState::Open
    }

    /// Accepts a STREAM frame from the peer.
    pub fn frame_in(&mut self, conn: &mut ConnCtx, buf: RangeBuf) -> Result<()> {
        if self.flags.rst_recvd {
            trace!(
                "{} stream {} ignoring data after reset",
                conn.trace_id,
                self.id
            );

            return Ok(());
        }

        let max_off = self.recv.max_off();
        let conn_limited = self.flow_limit == FlowLimit::Connection;

        if conn_limited {
            conn.flow
                .check_received(buf.max_off().saturating_sub(max_off))?;
        }

        let draining = self.recv.is_draining();
        let read_off = self.recv.off();

        trace!(
            "{} stream {} rx off={} len={} fin={}",
            conn.trace_id,
            self.id,
            buf.off(),
            buf.len(),
            buf.fin()
        );

        if let Err(e) = self.recv.write(buf) {
            debug!(
                "{} stream {} rejected incoming data: {:?}",
                conn.trace_id, self.id, e
            );

            return Err(e);
        }

        if conn_limited {
            conn.flow.add_received(self.recv.max_off() - max_off);

            if draining {
                conn.flow.add_consumed(self.recv.off() - read_off);
            }
        }

        if self.recv.fin_off().is_some() && !self.flags.fin_recvd {
            self.flags.fin_recvd = true;

            conn.stopped.remove(&self.id);
            conn.almost_full.remove(&self.id);

            self.maybe_finish(conn);
        }

        Ok(())
    }

    /// Accepts a RESET_STREAM frame from the peer.
    pub fn rst_in(
        &mut self, conn: &mut ConnCtx, final_size: u64, error_code: u64,
    ) -> Result<()> {
        if final_size > self.recv.max_data() {
            return Err(Error::FlowControl);
        }

        let conn_limited = self.flow_limit == FlowLimit::Connection;

        if conn_limited {
            conn.flow.check_received(
                final_size.saturating_sub(self.recv.max_off()),
            )?;
        }

        let credit = self.recv.reset(error_code, final_size)?;

        if self.flags.rst_recvd {
            return Ok(());
        }

        debug!(
            "{} stream {} reset by peer: code={} final_size={}",
            conn.trace_id, self.id, error_code, final_size
        );

        self.flags.rst_recvd = true;

        if conn_limited {
            conn.flow.add_received(credit.max_data_delta);
            conn.flow.add_consumed(credit.consumed);
        }

        conn.stopped.remove(&self.id);
        conn.almost_full.remove(&self.id);

        self.schedule_reset(conn, RESET_ACK_ERROR_CODE);

        self.maybe_finish(conn);

        Ok(())
    }

    /// Reads contiguous data into `out`.
    ///
    /// Returns 0 at the end of the stream, and the `Done` error when no
    /// data is available yet.
    pub fn read(&mut self, conn: &mut ConnCtx, out: &mut [u8]) -> Result<usize> {
        if self.flags.read_done {
            return Err(Error::InvalidStreamState(self.id));
        }

        let read = self.recv.emit(out)?;

        self.on_read(conn, read);

        Ok(read)
    }

    /// Reads contiguous data into a sequence of buffers.
    pub fn readv(
        &mut self, conn: &mut ConnCtx, bufs: &mut [IoSliceMut],
    ) -> Result<usize> {
        if self.flags.read_done {
            return Err(Error::InvalidStreamState(self.id));
        }

        let read = self.recv.emit_vectored(bufs)?;

        self.on_read(conn, read);

        Ok(read)
    }

    fn on_read(&mut self, conn: &mut ConnCtx, read: usize) {
        trace!("{} stream {} read {} bytes", conn.trace_id, self.id, read);

        if self.flow_limit == FlowLimit::Connection {
            conn.flow.add_consumed(read as u64);
        }

        if self.recv.almost_full() {
            conn.almost_full.insert(self.id);
        }
    }

    /// Buffers data for sending.
    ///
    /// The accepted length is bounded by the stream send limit and, for
    /// connection limited streams, by the connection send cap. Accepted
    /// bytes are reserved from the connection cap at once.
    pub fn write(&mut self, conn: &mut ConnCtx, data: &[u8]) -> Result<usize> {
        self.check_writable()?;

        let stream_cap = self.send.cap();
        let want = cmp::min(data.len() as u64, stream_cap);

        let allowed = match self.flow_limit {
            FlowLimit::Connection => conn.cap.reserve(want),

            FlowLimit::Unlimited => want,
        };

        let written = self.send.write(&data[..allowed as usize])?;

        trace!(
            "{} stream {} wrote {} of {} bytes",
            conn.trace_id,
            self.id,
            written,
            data.len()
        );

        let short = written < data.len();

        if short && self.send.cap() == 0 {
            self.send.mark_blocked();
            self.flags.send_blocked = true;
            conn.blocked.insert(self.id, self.send.max_data());
        }

        if short &&
            self.flow_limit == FlowLimit::Connection &&
            conn.cap.avail() == 0
        {
            conn.cap.mark_blocked();
            self.flags.conn_blocked = true;
        }

        // The data was accepted either way. A failed flush has already
        // flagged the connection for abort.
        if short || self.send.buffered() >= conn.send_ctl.max_payload() {
            let _ = self.flush(conn);
        }

        Ok(written)
    }

    /// Buffers data from a sequence of buffers, stopping at the first one
    /// that is not accepted in full.
    pub fn writev(
        &mut self, conn: &mut ConnCtx, bufs: &[IoSlice],
    ) -> Result<usize> {
        let mut total = 0;

        for buf in bufs {
            let written = self.write(conn, buf)?;

            total += written;

            if written < buf.len() {
                break;
            }
        }

        Ok(total)
    }

    fn check_writable(&self) -> Result<()> {
        if let (true, Some(code)) = (self.flags.rst_recvd, self.recv.error()) {
            return Err(Error::StreamReset(code));
        }

        if self.flags.write_done || self.flags.send_rst || self.flags.rst_sent
        {
            return Err(Error::InvalidStreamState(self.id));
        }

        Ok(())
    }

    /// Hands buffered data, and a pending FIN, to packetization.
    pub fn flush(&mut self, conn: &mut ConnCtx) -> Result<()> {
        let buf = match self.send.flush() {
            Some(v) => v,

            None => return Ok(()),
        };

        let fin = buf.fin();
        let (off, len) = (buf.off(), buf.len());

        let bpt = conn.send_ctl.buffered_type(self.priority);

        match conn.send_ctl.push_stream_data(self.id, buf, bpt) {
            Ok(frames) => {
                trace!(
                    "{} stream {} flushed off={} len={} fin={} in {} frames",
                    conn.trace_id,
                    self.id,
                    off,
                    len,
                    fin,
                    frames
                );

                self.n_unacked += frames;

                if fin {
                    self.flags.fin_sent = true;
                }

                Ok(())
            },

            Err(e) => {
                error!(
                    "{} stream {} failed to generate frames: {:?}",
                    conn.trace_id, self.id, e
                );

                self.flags.abort_conn = true;
                conn.service.insert(self.id);

                Err(e)
            },
        }
    }

    /// Shuts down reading or writing.
    ///
    /// Shutting down writing flushes buffered data along with a FIN.
    /// Shutting down reading discards unread data, returning it to the
    /// connection receive window.
    pub fn shutdown(&mut self, conn: &mut ConnCtx, direction: Shutdown) -> Result<()> {
        let res = match direction {
            Shutdown::Read => {
                if self.flags.read_done {
                    return Err(Error::Done);
                }

                self.shutdown_read(conn);

                Ok(())
            },

            Shutdown::Write => {
                if self.flags.write_done {
                    return Err(Error::Done);
                }

                self.flags.write_done = true;

                if self.flags.send_rst || self.flags.rst_sent {
                    Ok(())
                } else {
                    // Already shut down send buffers are fine.
                    let _ = self.send.shutdown();

                    self.flush(conn)
                }
            },
        };

        debug!(
            "{} stream {} shut down {:?}",
            conn.trace_id, self.id, direction
        );

        self.maybe_schedule_on_close(conn);
        self.maybe_finish(conn);

        res
    }

    fn shutdown_read(&mut self, conn: &mut ConnCtx) {
        self.flags.read_done = true;

        if let Ok(unread) = self.recv.shutdown() {
            if self.flow_limit == FlowLimit::Connection {
                conn.flow.add_consumed(unread);
            }
        }

        if !self.flags.fin_recvd && !self.flags.rst_recvd {
            conn.stopped.insert(self.id);
        }

        conn.almost_full.remove(&self.id);
    }

    /// Shuts down both directions.
    pub fn close(&mut self, conn: &mut ConnCtx) -> Result<()> {
        let mut res = Ok(());

        if !self.flags.write_done {
            res = self.shutdown(conn, Shutdown::Write);
        }

        if !self.flags.read_done {
            self.shutdown(conn, Shutdown::Read)?;
        }

        res
    }

    /// Abandons the stream in both directions.
    ///
    /// Unflushed data is dropped and its connection budget returned. Unless
    /// the FIN was already sent, a RESET_STREAM frame is queued and data
    /// frames not yet sent are removed from their packets.
    pub fn reset(&mut self, conn: &mut ConnCtx, error_code: u64) -> Result<()> {
        if self.flags.send_rst || self.flags.rst_sent {
            return Err(Error::Done);
        }

        debug!(
            "{} stream {} reset with code {}",
            conn.trace_id, self.id, error_code
        );

        if !self.flags.read_done {
            self.shutdown_read(conn);
        }

        self.flags.write_done = true;

        self.schedule_reset(conn, error_code);

        self.maybe_schedule_on_close(conn);
        self.maybe_finish(conn);

        Ok(())
    }

    fn schedule_reset(&mut self, conn: &mut ConnCtx, error_code: u64) {
        let dropped = self.send.drop_unflushed();

        if self.flow_limit == FlowLimit::Connection {
            conn.cap.release(dropped);
        }

        if self.flags.fin_sent || self.flags.rst_sent || self.flags.send_rst {
            return;
        }

        let elided = conn.send_ctl.elide_stream_frames(self.id);
        self.n_unacked = self.n_unacked.saturating_sub(elided);

        self.rst_code = Some(error_code);
        self.flags.send_rst = true;
        self.flags.send_blocked = false;

        conn.blocked.remove(&self.id);
        conn.sending.insert(self.id);
    }

    /// Packetizes the pending RESET_STREAM frame.
    pub fn send_reset(&mut self, conn: &mut ConnCtx) -> Result<()> {
        if !self.flags.send_rst {
            return Ok(());
        }

        let code = self.rst_code.unwrap_or(RESET_ACK_ERROR_CODE);
        let bpt = conn.send_ctl.buffered_type(self.priority);

        if let Err(e) = conn.send_ctl.push_reset(self.id, code, self.send.off(), bpt)
        {
            error!(
                "{} stream {} failed to generate reset: {:?}",
                conn.trace_id, self.id, e
            );

            self.flags.abort_conn = true;
            conn.service.insert(self.id);

            return Err(e);
        }

        self.n_unacked += 1;

        self.rst_frame_sent(conn);

        Ok(())
    }

    /// Records that the pending RESET_STREAM frame was packetized.
    pub fn rst_frame_sent(&mut self, conn: &mut ConnCtx) {
        if !self.flags.send_rst {
            return;
        }

        self.flags.send_rst = false;
        self.flags.rst_sent = true;

        conn.sending.remove(&self.id);

        self.maybe_finish(conn);
    }

    /// Sets the stream priority, which must be in `1..=256`.
    pub fn set_priority(&mut self, priority: i32) -> Result<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(Error::InvalidPriority(priority));
        }

        self.priority = priority as u16;

        Ok(())
    }

    /// Sets the send offset limit. It can't go below what was written.
    pub fn set_max_send_off(&mut self, conn: &mut ConnCtx, max: u64) -> Result<()> {
        self.send.set_max_data(max)?;

        if self.send.cap() > 0 {
            self.unblock(conn);
        }

        Ok(())
    }

    /// Applies a MAX_STREAM_DATA update from the peer. Lower limits are
    /// ignored.
    pub fn window_update(&mut self, conn: &mut ConnCtx, max: u64) {
        if self.send.update_max_data(max) {
            trace!(
                "{} stream {} send limit raised to {}",
                conn.trace_id,
                self.id,
                max
            );

            self.unblock(conn);
        }
    }

    fn unblock(&mut self, conn: &mut ConnCtx) {
        self.flags.send_blocked = false;
        conn.blocked.remove(&self.id);
    }

    /// Returns the new receive limit to advertise, if the window ran low.
    pub fn recv_window_update(
        &mut self, conn: &mut ConnCtx, now: Instant, rtt: Duration,
    ) -> Option<u64> {
        conn.almost_full.remove(&self.id);

        if self.flags.read_done || !self.recv.almost_full() {
            return None;
        }

        self.recv.autotune_window(now, rtt);
        self.recv.update_max_data(now);

        Some(self.recv.max_data())
    }

    /// Sets read interest, returning the previous value.
    pub fn want_read(&mut self, want: bool) -> bool {
        std::mem::replace(&mut self.flags.want_read, want)
    }

    /// Sets write interest, returning the previous value.
    pub fn want_write(&mut self, want: bool) -> bool {
        std::mem::replace(&mut self.flags.want_write, want)
    }

    /// Calls `on_read_ready` while the stream is readable, read interest
    /// holds and the callback makes progress.
    pub fn dispatch_read_events(&mut self, conn: &mut ConnCtx) {
        while self.flags.want_read && self.is_readable() {
            let before = (self.recv.off(), self.flags);

            self.with_handler(conn, |h, s, c| h.on_read_ready(s, c));

            if self.dispatch_once || (self.recv.off(), self.flags) == before {
                break;
            }
        }
    }

    /// Calls `on_write_ready` while the stream is writable, write interest
    /// holds and the callback makes progress, then flushes.
    pub fn dispatch_write_events(&mut self, conn: &mut ConnCtx) -> Result<()> {
        while self.flags.want_write && self.is_writable(conn) {
            let before = (self.send.off(), self.flags);

            self.with_handler(conn, |h, s, c| h.on_write_ready(s, c));

            if self.dispatch_once || (self.send.off(), self.flags) == before {
                break;
            }
        }

        if self.flags.abort_conn {
            return Err(Error::FrameGenFail);
        }

        self.flush(conn)
    }

    /// Calls `on_new_stream`, once.
    pub fn call_on_new(&mut self, conn: &mut ConnCtx) {
        if self.flags.on_new_done {
            return;
        }

        self.flags.on_new_done = true;

        self.with_handler(conn, |h, s, c| h.on_new_stream(s, c));

        self.maybe_schedule_on_close(conn);
    }

    /// Calls `on_close` if it is due.
    pub fn call_on_close(&mut self, conn: &mut ConnCtx) {
        if !self.flags.call_on_close {
            return;
        }

        self.flags.call_on_close = false;
        self.update_service(conn);

        self.fire_on_close(conn);
    }

    fn fire_on_close(&mut self, conn: &mut ConnCtx) {
        if self.flags.on_close_done {
            return;
        }

        self.flags.on_close_done = true;

        self.with_handler(conn, |h, s, c| h.on_close(s, c));
    }

    /// Records that a packet carrying `rec` was sent.
    pub fn on_sent(&mut self, rec: &StreamRec) {
        if let RecordKind::Stream { off, len, .. } = rec.kind {
            self.send.on_sent(off, len);
        }
    }

    /// Records the acknowledgement of a frame sent for this stream.
    pub fn acked(&mut self, conn: &mut ConnCtx, rec: &StreamRec) {
        if self.n_unacked == 0 {
            warn!(
                "{} stream {} got an ack with nothing outstanding",
                conn.trace_id, self.id
            );

            return;
        }

        self.n_unacked -= 1;

        if let RecordKind::Stream { off, len, .. } = rec.kind {
            self.send.ack(off, len);
        }

        trace!(
            "{} stream {} acked {:?}, {} outstanding",
            conn.trace_id,
            self.id,
            rec.kind,
            self.n_unacked
        );

        self.maybe_finish(conn);
    }

    /// Releases everything the stream holds at the connection level.
    ///
    /// The close callback fires first if it has not yet.
    pub fn destroy(mut self, conn: &mut ConnCtx) {
        if self.flags.on_new_done {
            self.fire_on_close(conn);
        }

        let dropped = self.send.drop_unflushed();

        if self.flow_limit == FlowLimit::Connection {
            conn.cap.release(dropped);

            if let Ok(unread) = self.recv.shutdown() {
                conn.flow.add_consumed(unread);
            }
        }

        conn.forget(self.id);

        debug!("{} stream {} destroyed", conn.trace_id, self.id);
    }

    fn maybe_schedule_on_close(&mut self, conn: &mut ConnCtx) {
        let f = &mut self.flags;

        if f.read_done &&
            f.write_done &&
            f.on_new_done &&
            !f.on_close_done &&
            !f.call_on_close
        {
            f.call_on_close = true;
            self.update_service(conn);
        }
    }

    fn maybe_finish(&mut self, conn: &mut ConnCtx) {
        let f = &self.flags;

        if f.free_pending {
            return;
        }

        if f.read_done &&
            f.write_done &&
            self.n_unacked == 0 &&
            !f.send_rst &&
            (f.fin_sent || f.rst_sent) &&
            (f.fin_recvd || f.rst_recvd)
        {
            trace!("{} stream {} finished", conn.trace_id, self.id);

            self.flags.free_pending = true;
            self.update_service(conn);
        }
    }

    fn update_service(&self, conn: &mut ConnCtx) {
        let f = &self.flags;

        if f.call_on_close || f.free_pending || f.abort_conn {
            conn.service.insert(self.id);
        } else {
            conn.service.remove(&self.id);
        }
    }

    fn with_handler<F>(&mut self, conn: &mut ConnCtx, f: F)
    where
        F: FnOnce(&mut Box<dyn StreamHandler>, &mut Stream, &mut ConnCtx),
    {
        if let Some(mut handler) = self.handler.take() {
            f(&mut handler, self, conn);

            // A handler installed by the callback takes precedence.
            if self.handler.is_none() {
                self.handler = Some(handler);
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("recv", &self.recv)
            .field("send", &self.send)
            .field("n_unacked", &self.n_unacked)
            .field("priority", &self.priority)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Keeps track of the streams of a connection and routes frames, acks and
/// application calls to them.
pub struct StreamMap {
    /// Map of streams indexed by stream ID.
    streams: StreamIdHashMap<Stream>,

    /// Set of streams that were destroyed.
    ///
    /// Destroyed streams are remembered so that late frames don't re-create
    /// them.
    collected: StreamIdHashSet,

    conn: ConnCtx,

    config: Config,
}

impl StreamMap {
    pub fn new(config: &Config) -> StreamMap {
        StreamMap::with_send_ctl(config, SendCtl::new(config))
    }

    /// Creates a stream map packetizing through `send_ctl`.
    pub fn with_send_ctl(config: &Config, send_ctl: SendCtl) -> StreamMap {
        StreamMap {
            streams: StreamIdHashMap::default(),
            collected: StreamIdHashSet::default(),
            conn: ConnCtx::with_send_ctl(config, send_ctl),
            config: config.clone(),
        }
    }

    /// Returns the options new streams get by default.
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions::new(&self.config)
    }

    /// Creates a stream, calling `on_new_stream` if `opts` ask for it.
    pub fn create_stream(
        &mut self, id: u64, handler: Option<Box<dyn StreamHandler>>,
        opts: &StreamOptions,
    ) -> Result<&mut Stream> {
        if self.streams.contains_key(&id) || self.collected.contains(&id) {
            return Err(Error::InvalidStreamState(id));
        }

        trace!("{} stream {} created", self.conn.trace_id, id);

        let stream = self
            .streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, handler, opts));

        if opts.call_on_new {
            stream.call_on_new(&mut self.conn);
        }

        Ok(stream)
    }

    pub fn get(&self, id: u64) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn conn(&self) -> &ConnCtx {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut ConnCtx {
        &mut self.conn
    }

    /// Returns the stream along with the connection context.
    pub fn stream_mut(&mut self, id: u64) -> Result<(&mut Stream, &mut ConnCtx)> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(Error::InvalidStreamState(id))?;

        Ok((stream, &mut self.conn))
    }

    pub fn is_collected(&self, id: u64) -> bool {
        self.collected.contains(&id)
    }

    /// Returns the number of active streams in the map.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn frame_in(&mut self, id: u64, buf: RangeBuf) -> Result<()> {
        if self.collected.contains(&id) {
            return Ok(());
        }

        let (stream, conn) = self.stream_mut(id)?;
        stream.frame_in(conn, buf)
    }

    pub fn rst_in(&mut self, id: u64, final_size: u64, error_code: u64) -> Result<()> {
        if self.collected.contains(&id) {
            return Ok(());
        }

        let (stream, conn) = self.stream_mut(id)?;
        stream.rst_in(conn, final_size, error_code)
    }

    pub fn read(&mut self, id: u64, out: &mut [u8]) -> Result<usize> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.read(conn, out)
    }

    pub fn readv(&mut self, id: u64, bufs: &mut [IoSliceMut]) -> Result<usize> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.readv(conn, bufs)
    }

    pub fn write(&mut self, id: u64, data: &[u8]) -> Result<usize> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.write(conn, data)
    }

    pub fn writev(&mut self, id: u64, bufs: &[IoSlice]) -> Result<usize> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.writev(conn, bufs)
    }

    pub fn flush(&mut self, id: u64) -> Result<()> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.flush(conn)
    }

    pub fn shutdown(&mut self, id: u64, direction: Shutdown) -> Result<()> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.shutdown(conn, direction)
    }

    pub fn close(&mut self, id: u64) -> Result<()> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.close(conn)
    }

    pub fn reset(&mut self, id: u64, error_code: u64) -> Result<()> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.reset(conn, error_code)
    }

    pub fn set_priority(&mut self, id: u64, priority: i32) -> Result<()> {
        let (stream, _) = self.stream_mut(id)?;
        stream.set_priority(priority)
    }

    pub fn set_max_send_off(&mut self, id: u64, max: u64) -> Result<()> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.set_max_send_off(conn, max)
    }

    /// Applies a MAX_STREAM_DATA frame.
    pub fn window_update(&mut self, id: u64, max: u64) -> Result<()> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.window_update(conn, max);

        Ok(())
    }

    /// Applies a MAX_DATA frame.
    pub fn conn_window_update(&mut self, max: u64) {
        if !self.conn.cap.raise_max(max) {
            return;
        }

        trace!("{} connection send cap raised to {}", self.conn.trace_id, max);

        for stream in self.streams.values_mut() {
            stream.flags.conn_blocked = false;
        }
    }

    pub fn dispatch_read_events(&mut self, id: u64) -> Result<()> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.dispatch_read_events(conn);

        Ok(())
    }

    pub fn dispatch_write_events(&mut self, id: u64) -> Result<()> {
        let (stream, conn) = self.stream_mut(id)?;
        stream.dispatch_write_events(conn)
    }

    /// Packetizes the RESET_STREAM frames of all streams that have one
    /// pending.
    pub fn send_resets(&mut self) -> Result<()> {
        let ids: SmallVec<[u64; 8]> = self.conn.sending.iter().copied().collect();

        for id in ids {
            match self.streams.get_mut(&id) {
                Some(stream) => stream.send_reset(&mut self.conn)?,

                None => {
                    self.conn.sending.remove(&id);
                },
            }
        }

        Ok(())
    }

    /// Moves buffered packets of the given type to the scheduled queue.
    pub fn schedule_buffered(&mut self, bpt: BufPacketType) -> Result<()> {
        let gained = self.conn.send_ctl.schedule_buffered(bpt)?;

        for id in gained {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.n_unacked += 1;
            }
        }

        Ok(())
    }

    pub fn next_packet_to_send(&mut self) -> Option<Packet> {
        self.conn.send_ctl.next_packet_to_send()
    }

    /// Records that `pkt` was written to the network.
    pub fn sent_packet(&mut self, pkt: Packet) {
        for rec in pkt.records() {
            if let Some(stream) = self.streams.get_mut(&rec.stream_id) {
                stream.on_sent(rec);
            }
        }

        self.conn.send_ctl.sent_packet(pkt);
    }

    /// Processes the acknowledgement of packet `pn`.
    ///
    /// Returns false if no such packet is in flight.
    pub fn ack_packet(&mut self, pn: u64) -> bool {
        let pkt = match self.conn.send_ctl.ack_packet(pn) {
            Some(v) => v,

            None => return false,
        };

        for rec in pkt.records() {
            if let Some(stream) = self.streams.get_mut(&rec.stream_id) {
                stream.acked(&mut self.conn, rec);
            }
        }

        true
    }

    /// Schedules lost packet `pn` for retransmission, returning its new
    /// packet number.
    pub fn lose_packet(&mut self, pn: u64) -> Result<u64> {
        self.conn.send_ctl.lose_packet(pn)
    }

    /// Runs due close callbacks and destroys finished streams.
    ///
    /// Returns the `FrameGenFail` error if a stream asked for the connection
    /// to be aborted.
    pub fn service_streams(&mut self) -> Result<()> {
        let ids: SmallVec<[u64; 8]> = self.conn.service.iter().copied().collect();

        let mut abort = false;

        for id in ids {
            let stream = match self.streams.get_mut(&id) {
                Some(v) => v,

                None => {
                    self.conn.service.remove(&id);
                    continue;
                },
            };

            stream.call_on_close(&mut self.conn);

            abort |= stream.flags.abort_conn;

            if stream.flags.free_pending {
                self.destroy(id);
            }
        }

        if abort {
            return Err(Error::FrameGenFail);
        }

        Ok(())
    }

    /// Destroys a stream, whatever its state.
    pub fn destroy(&mut self, id: u64) {
        if let Some(stream) = self.streams.remove(&id) {
            stream.destroy(&mut self.conn);

            self.collected.insert(id);
        }
    }

    /// Returns a connection level MAX_DATA update, if one is due.
    pub fn max_data_update(&mut self, now: Instant, rtt: Duration) -> Option<u64> {
        self.conn.flow.max_data_update(now, rtt)
    }

    /// Returns the MAX_STREAM_DATA updates that are due.
    pub fn max_stream_data_updates(
        &mut self, now: Instant, rtt: Duration,
    ) -> Vec<(u64, u64)> {
        let ids: SmallVec<[u64; 8]> =
            self.conn.almost_full.iter().copied().collect();

        let mut updates = Vec::with_capacity(ids.len());

        for id in ids {
            let update = match self.streams.get_mut(&id) {
                Some(stream) => stream.recv_window_update(&mut self.conn, now, rtt),

                None => {
                    self.conn.almost_full.remove(&id);
                    None
                },
            };

            if let Some(max) = update {
                updates.push((id, max));
            }
        }

        updates
    }
}

mod recv_buf;
mod send_buf;
