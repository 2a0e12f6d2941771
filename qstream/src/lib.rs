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

//! Per-stream data engine for QUIC connections.
//!
//! qstream implements the part of a QUIC transport that sits between the
//! packet layer and the application for every stream: it reassembles
//! incoming STREAM frames into an ordered byte stream, buffers outgoing data
//! until it is packetized, enforces stream and connection flow control, and
//! tracks FIN and RESET_STREAM exchanges until a stream can be freed.
//!
//! ## Creating streams
//!
//! Streams live in a [`StreamMap`], which also owns the connection level
//! state they share:
//!
//! ```
//! let config = qstream::Config::new();
//! let mut streams = qstream::StreamMap::new(&config);
//!
//! let opts = streams.stream_options();
//! streams.create_stream(4, None, &opts)?;
//! # Ok::<(), qstream::Error>(())
//! ```
//!
//! Application callbacks are provided by implementing [`StreamHandler`] and
//! passing it on creation.
//!
//! ## Receiving data
//!
//! STREAM frames parsed from incoming packets are handed to the stream,
//! which then can be read in order:
//!
//! ```
//! # let config = qstream::Config::new();
//! # let mut streams = qstream::StreamMap::new(&config);
//! # let opts = streams.stream_options();
//! # streams.create_stream(4, None, &opts)?;
//! streams.frame_in(4, qstream::RangeBuf::from(b"world", 5, true))?;
//! streams.frame_in(4, qstream::RangeBuf::from(b"hello", 0, false))?;
//!
//! let mut buf = [0; 32];
//! let read = streams.read(4, &mut buf)?;
//! assert_eq!(&buf[..read], b"helloworld");
//!
//! // The end of the stream was reached.
//! assert_eq!(streams.read(4, &mut buf)?, 0);
//! # Ok::<(), qstream::Error>(())
//! ```
//!
//! ## Sending data
//!
//! Written data is buffered until flushed, either explicitly or when enough
//! of it accumulated to fill a packet. Flushed data is turned into packets
//! that the application sends and eventually acknowledges:
//!
//! ```
//! # let config = qstream::Config::new();
//! # let mut streams = qstream::StreamMap::new(&config);
//! # let opts = streams.stream_options();
//! # streams.create_stream(4, None, &opts)?;
//! streams.write(4, b"hello")?;
//! streams.shutdown(4, qstream::Shutdown::Write)?;
//!
//! while let Some(pkt) = streams.next_packet_to_send() {
//!     // Encrypt and send `pkt.payload()` here.
//!     streams.sent_packet(pkt);
//! }
//!
//! streams.ack_packet(1);
//! # Ok::<(), qstream::Error>(())
//! ```
//!
//! ## Closing streams
//!
//! A stream is freed once both directions were shut down by the application,
//! the peer finished its own direction, and everything sent on the stream was
//! acknowledged. [`StreamMap::service_streams()`] runs pending close
//! callbacks and destroys streams that are done.

#![allow(clippy::upper_case_acronyms)]

#[macro_use]
extern crate log;

use crate::send_ctl::DEFAULT_PACKET_SIZE;

// The default size of the connection receive window and send cap.
const DEFAULT_CONNECTION_WINDOW: u64 = 48 * 1024;

// The maximum size of the connection receive window.
const MAX_CONNECTION_WINDOW: u64 = 24 * 1024 * 1024;

// The default size of the receiver stream flow control window.
const DEFAULT_STREAM_WINDOW: u64 = 32 * 1024;

// The default send offset limit of new streams.
const DEFAULT_STREAM_SEND_WINDOW: u64 = 16 * 1024;

/// The maximum size of the receiver stream flow control window.
pub const MAX_STREAM_WINDOW: u64 = 16 * 1024 * 1024;

/// The stream's side to shutdown.
///
/// This should be used when calling [`StreamMap::shutdown()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shutdown {
    /// Stop receiving stream data.
    Read  = 0,

    /// Stop sending stream data.
    Write = 1,
}

/// Stores configuration shared between the streams of a connection.
#[derive(Clone, Debug)]
pub struct Config {
    initial_max_data: u64,
    initial_max_stream_data: u64,
    initial_max_send_off: u64,

    max_connection_window: u64,
    max_stream_window: u64,

    reassembly: Reassembly,

    packet_size: usize,

    schedule_immediately: bool,

    guess_pn_len: PacketNumberLen,
    calc_pn_len: PacketNumberLen,

    buffered_packet_type: Option<BufPacketType>,
}

impl Config {
    /// Creates a config object with default values.
    ///
    /// ## Examples:
    ///
    /// ```
    /// let mut config = qstream::Config::new();
    /// config.set_initial_max_data(1024 * 1024);
    /// ```
    pub fn new() -> Config {
        Config {
            initial_max_data: DEFAULT_CONNECTION_WINDOW,
            initial_max_stream_data: DEFAULT_STREAM_WINDOW,
            initial_max_send_off: DEFAULT_STREAM_SEND_WINDOW,

            max_connection_window: MAX_CONNECTION_WINDOW,
            max_stream_window: MAX_STREAM_WINDOW,

            reassembly: Reassembly::Ordered,

            packet_size: DEFAULT_PACKET_SIZE,

            schedule_immediately: true,

            guess_pn_len: PacketNumberLen::Two,
            calc_pn_len: PacketNumberLen::Two,

            buffered_packet_type: None,
        }
    }

    /// Sets the initial connection flow control limit.
    ///
    /// It applies to both directions: the peer may send at most `v` bytes
    /// before the receive window is extended, and the local endpoint may
    /// write at most `v` bytes across all connection limited streams before
    /// the peer raises the send cap.
    ///
    /// The default value is `49152`.
    pub fn set_initial_max_data(&mut self, v: u64) {
        self.initial_max_data = v;
    }

    /// Sets the initial receive window of new streams.
    ///
    /// The default value is `32768`.
    pub fn set_initial_max_stream_data(&mut self, v: u64) {
        self.initial_max_stream_data = v;
    }

    /// Sets the initial send offset limit of new streams.
    ///
    /// The default value is `16384`.
    pub fn set_initial_max_send_off(&mut self, v: u64) {
        self.initial_max_send_off = v;
    }

    /// Sets the maximum size of the connection receive window.
    ///
    /// The default value is MAX_CONNECTION_WINDOW (24MBytes).
    pub fn set_max_connection_window(&mut self, v: u64) {
        self.max_connection_window = v;
    }

    /// Sets the maximum size of the stream receive window.
    ///
    /// The default value is MAX_STREAM_WINDOW (16MBytes).
    pub fn set_max_stream_window(&mut self, v: u64) {
        self.max_stream_window = v;
    }

    /// Sets the strategy used by new streams to hold out-of-order data.
    ///
    /// The default value is [`Reassembly::Ordered`].
    pub fn set_reassembly(&mut self, v: Reassembly) {
        self.reassembly = v;
    }

    /// Sets the size of outgoing packets, including header and AEAD tag.
    ///
    /// The default value is `1370`.
    pub fn set_packet_size(&mut self, v: usize) {
        self.packet_size = v;
    }

    /// Configures whether packets are scheduled as soon as they are built.
    ///
    /// When disabled, packets are kept in buffered queues until
    /// [`StreamMap::schedule_buffered()`] is called.
    ///
    /// The default value is `true`.
    pub fn set_schedule_immediately(&mut self, v: bool) {
        self.schedule_immediately = v;
    }

    /// Sets the packet number length assumed when building buffered
    /// packets.
    ///
    /// The default value is [`PacketNumberLen::Two`].
    pub fn set_guess_pn_len(&mut self, v: PacketNumberLen) {
        self.guess_pn_len = v;
    }

    /// Sets the packet number length used when packets are scheduled.
    ///
    /// The default value is [`PacketNumberLen::Two`].
    pub fn set_calc_pn_len(&mut self, v: PacketNumberLen) {
        self.calc_pn_len = v;
    }

    /// Forces all buffered packets into the given queue, instead of picking
    /// it from the stream priority.
    pub fn set_buffered_packet_type(&mut self, v: Option<BufPacketType>) {
        self.buffered_packet_type = v;
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

pub use crate::error::Error;
pub use crate::error::Result;

pub use crate::flowcontrol::ConnFlow;
pub use crate::flowcontrol::FlowControl;
pub use crate::flowcontrol::SendCap;

pub use crate::frame::parse_frames;
pub use crate::frame::Frame;

pub use crate::range_buf::PacketBuf;
pub use crate::range_buf::RangeBuf;

pub use crate::send_ctl::BufPacketType;
pub use crate::send_ctl::FrameGenerator;
pub use crate::send_ctl::Packet;
pub use crate::send_ctl::PacketNumberLen;
pub use crate::send_ctl::RecordKind;
pub use crate::send_ctl::SendCtl;
pub use crate::send_ctl::StreamRec;
pub use crate::send_ctl::WireGenerator;

pub use crate::stream::ConnCtx;
pub use crate::stream::FlowLimit;
pub use crate::stream::Reassembly;
pub use crate::stream::Stream;
pub use crate::stream::StreamFlags;
pub use crate::stream::StreamHandler;
pub use crate::stream::StreamMap;
pub use crate::stream::StreamOptions;
pub use crate::stream::StreamState;
pub use crate::stream::DEFAULT_PRIORITY;

mod error;
mod flowcontrol;
mod frame;
mod range_buf;
mod ranges;
mod send_ctl;
mod stream;

#[cfg(test)]
mod test_utils;
