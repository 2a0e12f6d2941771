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

use std::ops::Deref;

use std::sync::Arc;

/// A reference-counted packet payload.
///
/// A single inbound packet can carry several ranges for the same stream. Each
/// [`RangeBuf`] cut from it holds a clone of the handle, and the memory is
/// released when the last range referencing it is dropped.
#[derive(Clone, Debug)]
pub struct PacketBuf(Arc<[u8]>);

impl PacketBuf {
    /// Creates a new buffer holding a copy of `buf`.
    pub fn from_slice(buf: &[u8]) -> PacketBuf {
        PacketBuf(buf.into())
    }

    /// Returns the number of live handles to the underlying memory.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for PacketBuf {
    fn default() -> Self {
        PacketBuf::from(Vec::new())
    }
}

impl From<Vec<u8>> for PacketBuf {
    fn from(v: Vec<u8>) -> Self {
        PacketBuf(v.into())
    }
}

impl AsRef<[u8]> for PacketBuf {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Buffer holding data at a specific offset.
///
/// The data is kept in a shared [`PacketBuf`], sliced using the `start` and
/// `len` values. `off`, `len` and `fin` keep the bounds the range was created
/// with, while `pos` tracks how much of it was consumed.
#[derive(Clone, Debug, Default)]
pub struct RangeBuf {
    data: PacketBuf,

    /// The initial offset within the internal buffer.
    start: usize,

    /// The current offset within the internal buffer.
    pos: usize,

    /// The number of bytes in the buffer, from the initial offset.
    len: usize,

    /// The offset of the buffer within a stream.
    off: u64,

    /// Whether this contains the final byte in the stream.
    fin: bool,
}

impl RangeBuf {
    /// Creates a new `RangeBuf` from the given slice.
    pub fn from(buf: &[u8], off: u64, fin: bool) -> RangeBuf {
        Self::from_packet(&PacketBuf::from_slice(buf), 0, buf.len(), off, fin)
    }

    /// Creates a new `RangeBuf` taking ownership of `buf`.
    pub fn from_vec(buf: Vec<u8>, off: u64, fin: bool) -> RangeBuf {
        let len = buf.len();
        Self::from_packet(&PacketBuf::from(buf), 0, len, off, fin)
    }

    /// Creates a new `RangeBuf` sharing `len` bytes of `pkt` starting at
    /// `start`.
    ///
    /// The range is clamped to the bounds of the packet.
    pub fn from_packet(
        pkt: &PacketBuf, start: usize, len: usize, off: u64, fin: bool,
    ) -> RangeBuf {
        let start = cmp::min(start, pkt.len());
        let len = cmp::min(len, pkt.len() - start);

        RangeBuf {
            data: pkt.clone(),
            start,
            pos: start,
            len,
            off,
            fin,
        }
    }

    /// Returns whether `self` holds the final offset in the stream.
    pub fn fin(&self) -> bool {
        self.fin
    }

    /// Returns the current starting offset of `self`.
    pub fn off(&self) -> u64 {
        self.off + (self.pos - self.start) as u64
    }

    /// Returns the final offset of `self`.
    pub fn max_off(&self) -> u64 {
        self.off + self.len as u64
    }

    /// Returns the offset `self` was created with, regardless of how much of
    /// it was consumed.
    pub fn start_off(&self) -> u64 {
        self.off
    }

    /// Returns the length `self` was created with.
    pub fn orig_len(&self) -> usize {
        self.len
    }

    /// Returns the remaining length of `self`.
    pub fn len(&self) -> usize {
        self.len - (self.pos - self.start)
    }

    /// Returns true if `self` has a length of zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `other` was created with the same bounds and the same
    /// bytes as `self`, however much of either was consumed since.
    pub fn is_identical(&self, other: &RangeBuf) -> bool {
        self.off == other.off &&
            self.len == other.len &&
            self.fin == other.fin &&
            self.orig_data() == other.orig_data()
    }

    fn orig_data(&self) -> &[u8] {
        &self.data.as_ref()[self.start..self.start + self.len]
    }

    /// Returns the shared packet buffer `self` is sliced from.
    pub fn packet(&self) -> &PacketBuf {
        &self.data
    }

    /// Consumes the starting `count` bytes of `self`.
    pub fn consume(&mut self, count: usize) {
        self.pos = cmp::min(self.pos + count, self.start + self.len);
    }

    /// Splits the buffer into two at the given index, relative to the
    /// current position.
    ///
    /// `self` keeps the first `at` bytes while the returned buffer holds the
    /// rest, along with the FIN marker.
    pub fn split_off(&mut self, at: usize) -> RangeBuf {
        let at = cmp::min(at, self.len());
        let split = self.pos + at;

        let buf = RangeBuf {
            data: self.data.clone(),
            start: split,
            pos: split,
            len: self.start + self.len - split,
            off: self.off() + at as u64,
            fin: self.fin,
        };

        // `self` now ends at the split point, so its original bounds become
        // the consumed prefix plus the kept part.
        self.len = split - self.start;
        self.fin = false;

        buf
    }
}

impl Deref for RangeBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data.as_ref()[self.pos..self.start + self.len]
    }
}

impl PartialEq for RangeBuf {
    fn eq(&self, other: &RangeBuf) -> bool {
        self.off() == other.off() && self.fin == other.fin && self[..] == other[..]
    }
}

impl Eq for RangeBuf {}
