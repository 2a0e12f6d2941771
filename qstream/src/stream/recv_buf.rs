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

use std::collections::BTreeMap;
use std::collections::HashMap;

use std::io::IoSliceMut;

use std::time::Duration;
use std::time::Instant;

use crate::Error;
use crate::Result;

use crate::flowcontrol;

use crate::range_buf::RangeBuf;
use crate::ranges::RangeSet;

/// How a receive buffer indexes the ranges it holds.
///
/// The strategy is picked when the stream is created and never changes. Both
/// strategies enforce the same acceptance rules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reassembly {
    /// Ranges are kept in a tree ordered by offset.
    #[default]
    Ordered,

    /// Ranges are kept in a hash table keyed by offset, next to an index of
    /// the offsets they cover.
    Hashed,
}

/// Flow control credit returned by [`RecvBuf::reset`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResetCredit {
    /// Bytes by which the largest received offset grew.
    pub max_data_delta: u64,

    /// Bytes that will never be read and count as consumed.
    pub consumed: u64,
}

// Outcome of comparing an incoming range against the ranges already held.
#[derive(Debug, PartialEq, Eq)]
enum Overlap {
    None,

    Duplicate,

    Conflict,
}

#[derive(Debug)]
enum Ranges {
    Ordered(BTreeMap<u64, RangeBuf>),

    Hashed {
        frames: HashMap<u64, RangeBuf>,

        index: RangeSet,

        // Original offset of the partially read range, if any.
        front: Option<u64>,
    },
}

impl Ranges {
    fn new(reassembly: Reassembly) -> Ranges {
        match reassembly {
            Reassembly::Ordered => Ranges::Ordered(BTreeMap::new()),

            Reassembly::Hashed => Ranges::Hashed {
                frames: HashMap::new(),
                index: RangeSet::default(),
                front: None,
            },
        }
    }

    fn len(&self) -> usize {
        match self {
            Ranges::Ordered(data) => data.len(),

            Ranges::Hashed { frames, .. } => frames.len(),
        }
    }

    // Ranges are compared using the bounds and bytes they were received
    // with, even when partially read.
    fn overlap(&self, buf: &RangeBuf) -> Overlap {
        let start = buf.start_off();
        let end = buf.max_off();

        match self {
            Ranges::Ordered(data) => {
                let mut found = None;
                let mut count = 0;

                if let Some((_, b)) = data.range(..=start).next_back() {
                    if b.max_off() > start {
                        found = Some(b);
                        count += 1;
                    }
                }

                for (_, b) in data.range(start + 1..end) {
                    found = Some(b);
                    count += 1;
                }

                match found {
                    None => Overlap::None,

                    Some(b) if count == 1 && b.is_identical(buf) =>
                        Overlap::Duplicate,

                    Some(_) => Overlap::Conflict,
                }
            },

            Ranges::Hashed { frames, index, .. } => {
                if !index.overlaps(&(start..end)) {
                    return Overlap::None;
                }

                match frames.get(&start) {
                    Some(b) if b.is_identical(buf) => Overlap::Duplicate,

                    _ => Overlap::Conflict,
                }
            },
        }
    }

    fn insert(&mut self, buf: RangeBuf) {
        match self {
            Ranges::Ordered(data) => {
                data.insert(buf.start_off(), buf);
            },

            Ranges::Hashed { frames, index, .. } => {
                index.insert(buf.start_off()..buf.max_off());
                frames.insert(buf.start_off(), buf);
            },
        }
    }

    fn ready(&self, off: u64) -> bool {
        match self {
            Ranges::Ordered(data) => data
                .first_key_value()
                .map_or(false, |(_, b)| b.off() == off),

            Ranges::Hashed { frames, front, .. } => frames
                .get(&front.unwrap_or(off))
                .map_or(false, |b| b.off() == off),
        }
    }

    // Removes the range whose unread part starts at `off`.
    fn pop_front(&mut self, off: u64) -> Option<RangeBuf> {
        if !self.ready(off) {
            return None;
        }

        match self {
            Ranges::Ordered(data) => data.pop_first().map(|(_, b)| b),

            Ranges::Hashed { frames, front, .. } =>
                frames.remove(&front.take().unwrap_or(off)),
        }
    }

    // Puts back a partially read range.
    fn push_front(&mut self, buf: RangeBuf) {
        if let Ranges::Hashed { front, .. } = self {
            *front = Some(buf.start_off());
        }

        self.insert(buf);
    }

    // Forgets offsets below `off`.
    fn trim(&mut self, off: u64) {
        if let Ranges::Hashed { index, .. } = self {
            index.remove_until(off);
        }
    }

    fn clear(&mut self) {
        match self {
            Ranges::Ordered(data) => data.clear(),

            Ranges::Hashed {
                frames,
                index,
                front,
            } => {
                frames.clear();
                *index = RangeSet::default();
                *front = None;
            },
        }
    }
}

/// Receive-side stream buffer.
///
/// Stream data received from the peer is kept as the ranges it arrived in,
/// without copying. Contiguous data can then be read into a slice.
///
/// A range identical to one already received is dropped, as is a range that
/// was already read. Any other overlap is rejected, as is data that
/// contradicts the stream's final size. A rejected range leaves the buffer
/// untouched.
#[derive(Debug)]
pub struct RecvBuf {
    /// Ranges of data received from the peer that have not been fully read
    /// by the application.
    data: Ranges,

    reassembly: Reassembly,

    /// The lowest data offset that has yet to be read by the application.
    off: u64,

    /// The total length of data received on this stream.
    len: u64,

    /// Receiver flow controller.
    flow_control: flowcontrol::FlowControl,

    /// The final stream offset received from the peer, if any.
    fin_off: Option<u64>,

    /// The error code received via RESET_STREAM.
    error: Option<u64>,

    /// Whether incoming data is validated but not buffered.
    drain: bool,
}

impl RecvBuf {
    /// Creates a new receive buffer.
    pub fn new(max_data: u64, max_window: u64, reassembly: Reassembly) -> RecvBuf {
        RecvBuf {
            data: Ranges::new(reassembly),
            reassembly,
            off: 0,
            len: 0,
            flow_control: flowcontrol::FlowControl::new(
                max_data, max_data, max_window,
            ),
            fin_off: None,
            error: None,
            drain: false,
        }
    }

    /// Inserts the given range of data in the buffer.
    pub fn write(&mut self, buf: RangeBuf) -> Result<()> {
        if buf.max_off() > self.max_data() {
            return Err(Error::FlowControl);
        }

        if let Some(fin_off) = self.fin_off {
            // Stream's size is known, forbid data beyond that point.
            if buf.max_off() > fin_off {
                return Err(Error::FinalSize);
            }

            // Stream's size is already known, forbid changing it.
            if buf.fin() && fin_off != buf.max_off() {
                return Err(Error::FinalSize);
            }
        }

        // Stream's known size is lower than data already received.
        if buf.fin() && buf.max_off() < self.len {
            return Err(Error::FinalSize);
        }

        if buf.is_empty() {
            if buf.fin() {
                self.fin_off = Some(buf.max_off());
                self.len = cmp::max(self.len, buf.max_off());

                if self.drain {
                    self.off = self.len;
                }
            }

            return Ok(());
        }

        if self.drain {
            if buf.fin() {
                self.fin_off = Some(buf.max_off());
            }

            // Nothing is stored, so everything received counts as read.
            self.len = cmp::max(self.len, buf.max_off());
            self.off = self.len;

            return Ok(());
        }

        // Data was already read.
        if buf.max_off() <= self.off {
            if buf.fin() {
                self.fin_off = Some(buf.max_off());
            }

            return Ok(());
        }

        match self.data.overlap(&buf) {
            Overlap::Duplicate => return Ok(()),

            Overlap::Conflict => return Err(Error::DataOverlap),

            Overlap::None => (),
        }

        // Part of the range was already read, but not as this range.
        if buf.start_off() < self.off {
            return Err(Error::DataOverlap);
        }

        if buf.fin() {
            self.fin_off = Some(buf.max_off());
        }

        self.len = cmp::max(self.len, buf.max_off());

        self.data.insert(buf);

        Ok(())
    }

    /// Reads contiguous data from the receive buffer.
    ///
    /// Data is written into the given `out` buffer, up to the length of `out`.
    ///
    /// Returns 0 once all data up to the final size was read, and the `Done`
    /// error if there is no data at the read offset yet. A reset stream
    /// returns its error code instead.
    pub fn emit(&mut self, out: &mut [u8]) -> Result<usize> {
        // The stream was reset, so clear its data and return the error code
        // instead.
        if let Some(e) = self.error {
            self.data.clear();
            return Err(Error::StreamReset(e));
        }

        if !self.ready() {
            if self.is_fin() {
                return Ok(0);
            }

            return Err(Error::Done);
        }

        let mut len = 0;

        while len < out.len() {
            let mut buf = match self.data.pop_front(self.off) {
                Some(v) => v,

                None => break,
            };

            let buf_len = cmp::min(buf.len(), out.len() - len);

            out[len..len + buf_len].copy_from_slice(&buf[..buf_len]);

            self.off += buf_len as u64;
            len += buf_len;

            if buf_len < buf.len() {
                buf.consume(buf_len);
                self.data.push_front(buf);

                // We reached the maximum capacity, so end here.
                break;
            }
        }

        self.data.trim(self.off);

        // Update consumed bytes for flow control.
        self.flow_control.add_consumed(len as u64);

        Ok(len)
    }

    /// Reads contiguous data into a sequence of buffers, filling each one
    /// before moving to the next.
    pub fn emit_vectored(&mut self, bufs: &mut [IoSliceMut]) -> Result<usize> {
        let mut total = 0;

        for out in bufs.iter_mut().filter(|b| !b.is_empty()) {
            match self.emit(out) {
                Ok(0) => break,

                Ok(n) => {
                    total += n;

                    if n < out.len() {
                        break;
                    }
                },

                Err(_) if total > 0 => break,

                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Resets the stream at the given offset.
    pub fn reset(
        &mut self, error_code: u64, final_size: u64,
    ) -> Result<ResetCredit> {
        // Stream's size is already known, forbid changing it.
        if let Some(fin_off) = self.fin_off {
            if fin_off != final_size {
                return Err(Error::FinalSize);
            }
        }

        // Stream's known size is lower than data already received.
        if final_size < self.len {
            return Err(Error::FinalSize);
        }

        if self.error.is_some() {
            // We already verified that the final size matches
            return Ok(ResetCredit::default());
        }

        let credit = ResetCredit {
            max_data_delta: final_size - self.len,
            consumed: final_size - self.off,
        };

        self.error = Some(error_code);

        // Clear all data already buffered.
        self.data.clear();

        self.off = final_size;
        self.len = final_size;
        self.fin_off = Some(final_size);

        Ok(credit)
    }

    /// Shuts down receiving data and returns the number of bytes
    /// that should be returned to the connection level flow
    /// control
    pub fn shutdown(&mut self) -> Result<u64> {
        if self.drain {
            return Err(Error::Done);
        }

        self.drain = true;

        self.data.clear();

        let consumed = self.max_off() - self.off;
        self.off = self.max_off();

        Ok(consumed)
    }

    /// Commits the new max_data limit.
    pub fn update_max_data(&mut self, now: Instant) {
        self.flow_control.update_max_data(now);
    }

    /// Return the new max_data limit.
    pub fn max_data_next(&self) -> u64 {
        self.flow_control.max_data_next()
    }

    /// Return the current flow control limit.
    pub fn max_data(&self) -> u64 {
        self.flow_control.max_data()
    }

    /// Autotune the window size.
    pub fn autotune_window(&mut self, now: Instant, rtt: Duration) {
        self.flow_control.autotune_window(now, rtt);
    }

    /// Returns true if we need to update the local flow control limit.
    pub fn almost_full(&self) -> bool {
        self.fin_off.is_none() && self.flow_control.should_update_max_data()
    }

    /// Returns the offset of the next byte to be read.
    pub fn off(&self) -> u64 {
        self.off
    }

    /// Returns the largest offset ever received.
    pub fn max_off(&self) -> u64 {
        self.len
    }

    pub fn fin_off(&self) -> Option<u64> {
        self.fin_off
    }

    /// Returns the error code received in RESET_STREAM, if any.
    pub fn error(&self) -> Option<u64> {
        self.error
    }

    pub fn reassembly(&self) -> Reassembly {
        self.reassembly
    }

    /// Returns the number of ranges held.
    pub fn ranges(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the receive-side of the stream is complete.
    ///
    /// This happens when the stream's receive final size is known, and the
    /// application has read all data from the stream.
    pub fn is_fin(&self) -> bool {
        self.fin_off == Some(self.off)
    }

    /// Returns true if the stream is not storing incoming data.
    pub fn is_draining(&self) -> bool {
        self.drain
    }

    /// Returns true if the stream has data to be read.
    pub fn ready(&self) -> bool {
        self.data.ready(self.off)
    }
}
