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

use crate::Error;
use crate::Result;

use crate::range_buf::RangeBuf;
use crate::ranges;

/// Send-side stream buffer.
///
/// Data written by the application is buffered until the stream is flushed,
/// at which point everything buffered is handed out as a single range. The
/// buffer then only keeps track of what was sent and acknowledged, since
/// retransmission is up to the packetizer.
#[derive(Debug, Default)]
pub struct SendBuf {
    /// Data written but not flushed yet.
    data: Vec<u8>,

    /// The maximum offset of data written to the stream.
    off: u64,

    /// The offset up to which data was flushed.
    flush_off: u64,

    /// The maximum offset of data sent to the peer.
    sent_off: u64,

    /// The maximum offset we are allowed to send to the peer.
    max_data: u64,

    /// The last offset the stream was blocked at, if any.
    blocked_at: Option<u64>,

    /// The final stream offset written to the stream, if any.
    fin_off: Option<u64>,

    /// Whether the FIN was flushed.
    fin_flushed: bool,

    /// Ranges of data offsets that have been acked.
    acked: ranges::RangeSet,
}

impl SendBuf {
    /// Creates a new send buffer.
    pub fn new(max_data: u64) -> SendBuf {
        SendBuf {
            max_data,
            ..SendBuf::default()
        }
    }

    /// Appends the given slice of data at the end of the buffer.
    ///
    /// The number of bytes that were actually stored in the buffer is returned
    /// (this may be lower than the size of the input buffer, in case the
    /// stream's send limit is reached).
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        // Can't write past final offset.
        if self.fin_off.is_some() {
            return Err(Error::FinalSize);
        }

        let len = cmp::min(data.len() as u64, self.cap()) as usize;

        self.data.extend_from_slice(&data[..len]);
        self.off += len as u64;

        Ok(len)
    }

    /// Records that the stream ran out of send capacity.
    pub fn mark_blocked(&mut self) {
        self.blocked_at = Some(self.max_data);
    }

    /// Records the final offset of the stream.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.fin_off.is_some() {
            return Err(Error::Done);
        }

        self.fin_off = Some(self.off);

        Ok(())
    }

    /// Takes all buffered data as a single range, carrying the FIN if the
    /// stream was shut down and the FIN was not flushed yet.
    pub fn flush(&mut self) -> Option<RangeBuf> {
        let fin = self.fin_off == Some(self.off) && !self.fin_flushed;

        if self.data.is_empty() && !fin {
            return None;
        }

        let data = std::mem::take(&mut self.data);
        let buf = RangeBuf::from_vec(data, self.flush_off, fin);

        self.flush_off = self.off;
        self.fin_flushed |= fin;

        Some(buf)
    }

    /// Drops data that was not flushed yet, and returns how many bytes were
    /// dropped.
    pub fn drop_unflushed(&mut self) -> u64 {
        let dropped = self.off - self.flush_off;

        self.data.clear();
        self.off = self.flush_off;

        if let Some(fin_off) = self.fin_off {
            self.fin_off = Some(cmp::min(fin_off, self.off));
        }

        dropped
    }

    /// Records that the given range was written to the network.
    pub fn on_sent(&mut self, off: u64, len: usize) {
        self.sent_off = cmp::max(self.sent_off, off + len as u64);
    }

    /// Records that the given range was acknowledged.
    pub fn ack(&mut self, off: u64, len: usize) {
        self.acked.insert(off..off + len as u64);
    }

    /// Updates the max_data limit to the given value, if larger.
    pub fn update_max_data(&mut self, max_data: u64) -> bool {
        if max_data <= self.max_data {
            return false;
        }

        self.max_data = max_data;
        self.blocked_at = None;

        true
    }

    /// Sets the max_data limit, which can't be lower than data already
    /// written.
    pub fn set_max_data(&mut self, max_data: u64) -> Result<()> {
        if max_data < self.off {
            return Err(Error::InvalidMaxSendOffset);
        }

        if max_data > self.max_data {
            self.blocked_at = None;
        }

        self.max_data = max_data;

        Ok(())
    }

    /// Returns the number of bytes that can still be written.
    pub fn cap(&self) -> u64 {
        self.max_data.saturating_sub(self.off)
    }

    /// Returns the number of bytes written but not flushed.
    pub fn buffered(&self) -> usize {
        self.data.len()
    }

    /// Returns true if there is something to flush.
    pub fn is_flushable(&self) -> bool {
        !self.data.is_empty() ||
            (self.fin_off == Some(self.off) && !self.fin_flushed)
    }

    /// Returns the maximum offset of data written.
    pub fn off(&self) -> u64 {
        self.off
    }

    /// Returns the offset up to which data was flushed.
    pub fn flush_off(&self) -> u64 {
        self.flush_off
    }

    pub fn sent_off(&self) -> u64 {
        self.sent_off
    }

    /// Returns the offset up to which all data was acknowledged.
    pub fn ack_off(&self) -> u64 {
        match self.acked.first() {
            Some(r) if r.start == 0 => r.end,

            _ => 0,
        }
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn blocked_at(&self) -> Option<u64> {
        self.blocked_at
    }

    pub fn fin_off(&self) -> Option<u64> {
        self.fin_off
    }

    /// Returns true if all data, including the FIN, was acknowledged.
    pub fn is_complete(&self) -> bool {
        self.fin_flushed && self.fin_off == Some(self.ack_off())
    }
}
