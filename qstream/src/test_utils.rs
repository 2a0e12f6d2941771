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

use super::*;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

type Callback = Box<dyn FnMut(&mut Stream, &mut ConnCtx)>;

/// Number of times each callback fired for a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Events {
    pub on_new: usize,
    pub on_read: usize,
    pub on_write: usize,
    pub on_close: usize,
}

pub type EventLog = Rc<RefCell<HashMap<u64, Events>>>;

/// A stream handler that counts callbacks and optionally runs test code on
/// read and write events.
pub struct Recorder {
    log: EventLog,
    on_read: Option<Callback>,
    on_write: Option<Callback>,
}

impl Recorder {
    pub fn new(log: &EventLog) -> Recorder {
        Recorder {
            log: log.clone(),
            on_read: None,
            on_write: None,
        }
    }

    pub fn on_read<F>(mut self, f: F) -> Recorder
    where
        F: FnMut(&mut Stream, &mut ConnCtx) + 'static,
    {
        self.on_read = Some(Box::new(f));
        self
    }

    pub fn on_write<F>(mut self, f: F) -> Recorder
    where
        F: FnMut(&mut Stream, &mut ConnCtx) + 'static,
    {
        self.on_write = Some(Box::new(f));
        self
    }

    fn record(&self, id: u64, f: impl FnOnce(&mut Events)) {
        f(self.log.borrow_mut().entry(id).or_default());
    }
}

impl StreamHandler for Recorder {
    fn on_new_stream(&mut self, stream: &mut Stream, _conn: &mut ConnCtx) {
        self.record(stream.id(), |e| e.on_new += 1);
    }

    fn on_read_ready(&mut self, stream: &mut Stream, conn: &mut ConnCtx) {
        self.record(stream.id(), |e| e.on_read += 1);

        if let Some(f) = self.on_read.as_mut() {
            f(stream, conn);
        }
    }

    fn on_write_ready(&mut self, stream: &mut Stream, conn: &mut ConnCtx) {
        self.record(stream.id(), |e| e.on_write += 1);

        if let Some(f) = self.on_write.as_mut() {
            f(stream, conn);
        }
    }

    fn on_close(&mut self, stream: &mut Stream, _conn: &mut ConnCtx) {
        self.record(stream.id(), |e| e.on_close += 1);
    }
}

/// A stream map with recording handlers and helpers to move packets around.
pub struct Harness {
    pub streams: StreamMap,

    pub log: EventLog,
}

impl Harness {
    pub fn new() -> Harness {
        Harness::with_config(&Config::new())
    }

    pub fn with_config(config: &Config) -> Harness {
        Harness::with_send_ctl(config, SendCtl::new(config))
    }

    pub fn with_send_ctl(config: &Config, send_ctl: SendCtl) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut streams = StreamMap::with_send_ctl(config, send_ctl);
        streams.conn_mut().set_trace_id("test");

        Harness {
            streams,
            log: EventLog::default(),
        }
    }

    pub fn recorder(&self) -> Recorder {
        Recorder::new(&self.log)
    }

    /// Creates a stream with a recording handler and default options.
    pub fn open(&mut self, id: u64) -> Result<()> {
        let opts = self.streams.stream_options();
        self.open_with(id, &opts, self.recorder())
    }

    pub fn open_with(
        &mut self, id: u64, opts: &StreamOptions, recorder: Recorder,
    ) -> Result<()> {
        self.streams
            .create_stream(id, Some(Box::new(recorder)), opts)
            .map(|_| ())
    }

    pub fn events(&self, id: u64) -> Events {
        self.log.borrow().get(&id).copied().unwrap_or_default()
    }

    pub fn stream(&self, id: u64) -> &Stream {
        self.streams.get(id).unwrap()
    }

    /// Feeds a STREAM frame from the peer.
    pub fn frame_in(
        &mut self, id: u64, off: u64, data: &[u8], fin: bool,
    ) -> Result<()> {
        self.streams.frame_in(id, RangeBuf::from(data, off, fin))
    }

    /// Returns the data and FIN that scheduled packets carry for `id`,
    /// ordered by offset.
    pub fn scheduled_data(&self, id: u64) -> (Vec<u8>, bool) {
        let packets = self.streams.conn().send_ctl().scheduled();

        stream_data(packets, id)
    }

    /// Returns the RESET_STREAM frames scheduled for `id`, as pairs of error
    /// code and final size.
    pub fn scheduled_resets(&self, id: u64) -> Vec<(u64, u64)> {
        let mut resets = Vec::new();

        for pkt in self.streams.conn().send_ctl().scheduled() {
            for frame in pkt.frames().unwrap() {
                if let Frame::ResetStream {
                    stream_id,
                    error_code,
                    final_size,
                } = frame
                {
                    if stream_id == id {
                        resets.push((error_code, final_size));
                    }
                }
            }
        }

        resets
    }

    /// Sends every scheduled packet, returning their packet numbers.
    pub fn send_all(&mut self) -> Vec<u64> {
        let mut sent = Vec::new();

        while let Some(pkt) = self.streams.next_packet_to_send() {
            sent.push(pkt.pn().unwrap());
            self.streams.sent_packet(pkt);
        }

        sent
    }

    /// Sends and acknowledges every scheduled packet.
    pub fn send_and_ack_all(&mut self) {
        for pn in self.send_all() {
            assert!(self.streams.ack_packet(pn));
        }
    }
}

/// Collects the STREAM frame data of `id` across `packets`.
pub fn stream_data<'a>(
    packets: impl Iterator<Item = &'a Packet>, id: u64,
) -> (Vec<u8>, bool) {
    let mut bufs = Vec::new();

    for pkt in packets {
        for frame in pkt.frames().unwrap() {
            if let Frame::Stream { stream_id, data } = frame {
                if stream_id == id {
                    bufs.push(data);
                }
            }
        }
    }

    bufs.sort_by_key(|b| b.off());

    let fin = bufs.last().map(|b| b.fin()).unwrap_or(false);

    let mut out = Vec::new();

    for b in &bufs {
        assert_eq!(b.off(), out.len() as u64);
        out.extend_from_slice(b);
    }

    (out, fin)
}
