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

use crate::Error;
use crate::Result;

use crate::range_buf::RangeBuf;

pub const MAX_STREAM_SIZE: u64 = 1 << 62;

/// Largest possible STREAM frame header.
pub const MAX_STREAM_OVERHEAD: usize = 1 + 8 + 8 + 2;

/// Largest payload a single STREAM frame can carry, given its 2-byte length
/// field.
pub const MAX_STREAM_FRAME_DATA: usize = (1 << 14) - 1;

#[derive(Clone, PartialEq, Eq)]
pub enum Frame {
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },

    Stream {
        stream_id: u64,
        data: RangeBuf,
    },
}

impl Frame {
    pub fn from_bytes(b: &mut octets::Octets) -> Result<Frame> {
        let frame_type = b.get_varint()?;

        let frame = match frame_type {
            0x04 => Frame::ResetStream {
                stream_id: b.get_varint()?,
                error_code: b.get_varint()?,
                final_size: b.get_varint()?,
            },

            0x08..=0x0f => parse_stream_frame(frame_type, b)?,

            _ => return Err(Error::InvalidFrame),
        };

        Ok(frame)
    }

    pub fn to_bytes(&self, b: &mut octets::OctetsMut) -> Result<usize> {
        let before = b.cap();

        match self {
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                b.put_varint(0x04)?;

                b.put_varint(*stream_id)?;
                b.put_varint(*error_code)?;
                b.put_varint(*final_size)?;
            },

            Frame::Stream { stream_id, data } => {
                encode_stream_header(
                    *stream_id,
                    data.off(),
                    data.len() as u64,
                    data.fin(),
                    b,
                )?;

                b.put_bytes(data)?;
            },
        }

        Ok(before - b.cap())
    }

    pub fn wire_len(&self) -> usize {
        match self {
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                1 + // frame type
                octets::varint_len(*stream_id) + // stream_id
                octets::varint_len(*error_code) + // error_code
                octets::varint_len(*final_size) // final_size
            },

            Frame::Stream { stream_id, data } =>
                stream_header_len(*stream_id, data.off()) + data.len(),
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                write!(
                    f,
                    "RESET_STREAM stream={stream_id} err={error_code:x} size={final_size}"
                )?;
            },

            Frame::Stream { stream_id, data } => {
                write!(
                    f,
                    "STREAM id={} off={} len={} fin={}",
                    stream_id,
                    data.off(),
                    data.len(),
                    data.fin()
                )?;
            },
        }

        Ok(())
    }
}

/// Returns the size of the STREAM frame header written by
/// [`encode_stream_header`].
pub fn stream_header_len(stream_id: u64, offset: u64) -> usize {
    1 + // frame type
    octets::varint_len(stream_id) + // stream_id
    octets::varint_len(offset) + // offset
    2 // length, always 2 bytes
}

pub fn encode_stream_header(
    stream_id: u64, offset: u64, length: u64, fin: bool,
    b: &mut octets::OctetsMut,
) -> Result<()> {
    let mut ty: u8 = 0x08;

    // Always encode offset.
    ty |= 0x04;

    // Always encode length.
    ty |= 0x02;

    if fin {
        ty |= 0x01;
    }

    b.put_varint(u64::from(ty))?;

    b.put_varint(stream_id)?;
    b.put_varint(offset)?;

    // Always encode length field as 2-byte varint.
    b.put_varint_with_len(length, 2)?;

    Ok(())
}

/// Parses every frame in a packet payload.
pub fn parse_frames(payload: &[u8]) -> Result<Vec<Frame>> {
    let mut b = octets::Octets::with_slice(payload);
    let mut frames = Vec::new();

    while b.cap() > 0 {
        frames.push(Frame::from_bytes(&mut b)?);
    }

    Ok(frames)
}

fn parse_stream_frame(ty: u64, b: &mut octets::Octets) -> Result<Frame> {
    let first = ty as u8;

    let stream_id = b.get_varint()?;

    let offset = if first & 0x04 != 0 {
        b.get_varint()?
    } else {
        0
    };

    let len = if first & 0x02 != 0 {
        b.get_varint()? as usize
    } else {
        b.cap()
    };

    if offset + len as u64 >= MAX_STREAM_SIZE {
        return Err(Error::InvalidFrame);
    }

    let fin = first & 0x01 != 0;

    let data = b.get_bytes(len)?;
    let data = RangeBuf::from(data.as_ref(), offset, fin);

    Ok(Frame::Stream { stream_id, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream() {
        let mut d = [42; 128];

        let data = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

        let frame = Frame::Stream {
            stream_id: 32,
            data: RangeBuf::from(&data, 1230976, true),
        };

        let wire_len = {
            let mut b = octets::OctetsMut::with_slice(&mut d);
            frame.to_bytes(&mut b).unwrap()
        };

        assert_eq!(wire_len, 20);
        assert_eq!(frame.wire_len(), 20);

        let mut b = octets::Octets::with_slice(&d[..wire_len]);
        assert_eq!(Frame::from_bytes(&mut b), Ok(frame));
    }

    #[test]
    fn stream_fin_only() {
        let mut d = [0; 16];

        let frame = Frame::Stream {
            stream_id: 5,
            data: RangeBuf::from(b"", 100, true),
        };

        let wire_len = {
            let mut b = octets::OctetsMut::with_slice(&mut d);
            frame.to_bytes(&mut b).unwrap()
        };

        assert_eq!(wire_len, stream_header_len(5, 100));
        assert_eq!(d[0], 0x0f);

        let frames = parse_frames(&d[..wire_len]).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn stream_too_big() {
        let mut d = [42; 128];

        let mut b = octets::OctetsMut::with_slice(&mut d);
        encode_stream_header(32, MAX_STREAM_SIZE - 3, 5, false, &mut b)
            .unwrap();
        let wire_len = b.off();

        let mut b = octets::Octets::with_slice(&d[..wire_len + 5]);
        assert_eq!(Frame::from_bytes(&mut b), Err(Error::InvalidFrame));
    }

    #[test]
    fn reset_stream() {
        let mut d = [42; 128];

        let frame = Frame::ResetStream {
            stream_id: 123_213,
            error_code: 21_123_767,
            final_size: 21_123_767,
        };

        let wire_len = {
            let mut b = octets::OctetsMut::with_slice(&mut d);
            frame.to_bytes(&mut b).unwrap()
        };

        assert_eq!(wire_len, 13);
        assert_eq!(frame.wire_len(), 13);

        let mut b = octets::Octets::with_slice(&d[..wire_len]);
        assert_eq!(Frame::from_bytes(&mut b), Ok(frame));
    }

    #[test]
    fn short_buffer() {
        let mut d = [0; 4];

        let frame = Frame::Stream {
            stream_id: 4,
            data: RangeBuf::from(b"hello", 0, false),
        };

        let mut b = octets::OctetsMut::with_slice(&mut d);
        assert_eq!(frame.to_bytes(&mut b), Err(Error::BufferTooShort));
    }

    #[test]
    fn unknown_frame() {
        assert_eq!(parse_frames(&[0x1e]), Err(Error::InvalidFrame));
    }
}
