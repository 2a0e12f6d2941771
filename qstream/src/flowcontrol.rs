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

//! Flow control accounting.
//!
//! [`FlowControl`] tracks a receive window and decides when it should be
//! extended. [`SendCap`] tracks a send budget granted by the peer, and is
//! shared by every connection-limited stream at connection scope.
//! [`ConnFlow`] adds connection-wide receive accounting on top of a
//! [`FlowControl`].

use std::cmp;

use std::time::Duration;
use std::time::Instant;

use crate::Error;
use crate::Result;

// When autotuning the receiver window, decide how much
// we increase the window.
const WINDOW_INCREASE_FACTOR: u64 = 2;

// When autotuning the receiver window, check if the last
// update is within RTT * this constant.
const WINDOW_TRIGGER_FACTOR: u32 = 2;

#[derive(Default, Debug)]
pub struct FlowControl {
    /// Total consumed bytes by the receiver.
    consumed: u64,

    /// Flow control limit.
    max_data: u64,

    /// The receive window. This value is used for updating
    /// flow control limit.
    window: u64,

    /// The maximum receive window.
    max_window: u64,

    /// Last update time of max_data for autotuning the window.
    last_update: Option<Instant>,
}

impl FlowControl {
    pub fn new(max_data: u64, window: u64, max_window: u64) -> Self {
        Self {
            max_data,

            window,

            max_window,

            ..Default::default()
        }
    }

    /// Returns the current window size.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Returns the current flow limit.
    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    /// Returns the number of bytes consumed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Update consumed bytes.
    pub fn add_consumed(&mut self, consumed: u64) {
        self.consumed += consumed;
    }

    /// Returns true if the flow control needs to update max_data.
    ///
    /// This happens when the available window is smaller than the half
    /// of the current window.
    pub fn should_update_max_data(&self) -> bool {
        let available_window = self.max_data.saturating_sub(self.consumed);

        available_window < (self.window / 2)
    }

    /// Returns the new max_data limit.
    pub fn max_data_next(&self) -> u64 {
        self.consumed + self.window
    }

    /// Commits the new max_data limit.
    pub fn update_max_data(&mut self, now: Instant) {
        self.max_data = cmp::max(self.max_data, self.max_data_next());
        self.last_update = Some(now);
    }

    /// Autotune the window size. When there is an another update
    /// within RTT x 2, double the window, capped by max_window.
    pub fn autotune_window(&mut self, now: Instant, rtt: Duration) {
        if let Some(last_update) = self.last_update {
            if now - last_update < rtt * WINDOW_TRIGGER_FACTOR {
                self.window = cmp::min(
                    self.window * WINDOW_INCREASE_FACTOR,
                    self.max_window,
                );
            }
        }
    }
}

/// A send budget authorized by the peer.
///
/// Bytes are reserved when the application writes them, so every writer
/// sharing the cap sees the same remaining budget. `consumed` never exceeds
/// `max`.
#[derive(Default, Debug)]
pub struct SendCap {
    /// Authorized ceiling.
    max: u64,

    /// Bytes attributed against this cap.
    consumed: u64,

    /// The value of `consumed` when a reservation first fell short.
    blocked_at: Option<u64>,
}

impl SendCap {
    pub fn new(max: u64) -> Self {
        SendCap {
            max,
            ..Default::default()
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Returns the remaining budget.
    pub fn avail(&self) -> u64 {
        self.max - self.consumed
    }

    /// Returns the offset at which the cap was found exhausted, if it has
    /// not been raised since.
    pub fn blocked_at(&self) -> Option<u64> {
        self.blocked_at
    }

    /// Reserves up to `n` bytes, returning how many were actually reserved.
    pub fn reserve(&mut self, n: u64) -> u64 {
        let reserved = cmp::min(n, self.avail());

        self.consumed += reserved;

        if reserved < n && self.blocked_at.is_none() {
            self.blocked_at = Some(self.consumed);
        }

        reserved
    }

    /// Records that the cap is exhausted, unless already recorded.
    pub fn mark_blocked(&mut self) {
        self.blocked_at.get_or_insert(self.consumed);
    }

    /// Returns `n` previously reserved bytes that will never be sent.
    pub fn release(&mut self, n: u64) {
        self.consumed -= cmp::min(n, self.consumed);
    }

    /// Raises the ceiling to `max`. Lower values are ignored.
    pub fn raise_max(&mut self, max: u64) -> bool {
        if max <= self.max {
            return false;
        }

        self.max = max;

        if self.consumed < self.max {
            self.blocked_at = None;
        }

        true
    }
}

/// Connection-wide receive accounting.
///
/// `received` is the sum of the highest offsets received on each stream, and
/// must stay within the window granted to the peer.
#[derive(Default, Debug)]
pub struct ConnFlow {
    received: u64,

    flow_control: FlowControl,
}

impl ConnFlow {
    pub fn new(max_data: u64, max_window: u64) -> Self {
        ConnFlow {
            received: 0,

            flow_control: FlowControl::new(max_data, max_data, max_window),
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn consumed(&self) -> u64 {
        self.flow_control.consumed()
    }

    pub fn max_data(&self) -> u64 {
        self.flow_control.max_data()
    }

    /// Checks that `delta` more received bytes fit in the window.
    pub fn check_received(&self, delta: u64) -> Result<()> {
        if self.received + delta > self.flow_control.max_data() {
            return Err(Error::FlowControl);
        }

        Ok(())
    }

    pub fn add_received(&mut self, delta: u64) {
        self.received += delta;
    }

    pub fn add_consumed(&mut self, n: u64) {
        self.flow_control.add_consumed(n);
    }

    /// Returns the new limit to advertise, if the window should be
    /// extended.
    pub fn max_data_update(&mut self, now: Instant, rtt: Duration) -> Option<u64> {
        if !self.flow_control.should_update_max_data() {
            return None;
        }

        self.flow_control.autotune_window(now, rtt);
        self.flow_control.update_max_data(now);

        Some(self.flow_control.max_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_data() {
        let fc = FlowControl::new(100, 20, 100);

        assert_eq!(fc.max_data(), 100);
    }

    #[test]
    fn should_update_max_data() {
        let mut fc = FlowControl::new(100, 20, 100);

        fc.add_consumed(85);
        assert!(!fc.should_update_max_data());

        fc.add_consumed(10);
        assert!(fc.should_update_max_data());
    }

    #[test]
    fn update_max_data() {
        let mut fc = FlowControl::new(100, 20, 100);

        fc.add_consumed(95);
        assert!(fc.should_update_max_data());
        assert_eq!(fc.max_data_next(), 115);

        fc.update_max_data(Instant::now());
        assert_eq!(fc.max_data(), 115);
    }

    #[test]
    fn autotune_window() {
        let mut fc = FlowControl::new(100, 20, 100);

        fc.add_consumed(95);
        fc.update_max_data(Instant::now());

        // Second update within 2 RTTs, window should be doubled.
        fc.autotune_window(Instant::now(), Duration::from_millis(100));
        assert_eq!(fc.window(), 40);

        fc.add_consumed(15);
        assert_eq!(fc.max_data_next(), 95 + 15 + 40);
    }

    #[test]
    fn send_cap_reserve() {
        let mut cap = SendCap::new(10);

        assert_eq!(cap.reserve(4), 4);
        assert_eq!(cap.avail(), 6);
        assert_eq!(cap.blocked_at(), None);

        assert_eq!(cap.reserve(10), 6);
        assert_eq!(cap.consumed(), 10);
        assert_eq!(cap.blocked_at(), Some(10));

        assert_eq!(cap.reserve(1), 0);
        assert_eq!(cap.blocked_at(), Some(10));
    }

    #[test]
    fn send_cap_release() {
        let mut cap = SendCap::new(10);

        cap.reserve(8);
        cap.release(5);
        assert_eq!(cap.consumed(), 3);

        cap.release(50);
        assert_eq!(cap.consumed(), 0);
    }

    #[test]
    fn send_cap_raise_max() {
        let mut cap = SendCap::new(3);

        assert_eq!(cap.reserve(10), 3);
        assert_eq!(cap.blocked_at(), Some(3));

        // Decreases are ignored.
        assert!(!cap.raise_max(2));
        assert_eq!(cap.max(), 3);
        assert_eq!(cap.blocked_at(), Some(3));

        assert!(cap.raise_max(20));
        assert_eq!(cap.blocked_at(), None);
        assert_eq!(cap.reserve(7), 7);
        assert_eq!(cap.avail(), 10);
    }

    #[test]
    fn send_cap_never_exceeds_max() {
        let mut cap = SendCap::new(100);

        let mut total = 0;
        for n in [30, 1, 50, 40, 7] {
            total += cap.reserve(n);
        }

        assert_eq!(total, 100);
        assert_eq!(cap.consumed(), cap.max());
    }

    #[test]
    fn conn_flow() {
        let mut cf = ConnFlow::new(100, 1000);

        assert_eq!(cf.check_received(100), Ok(()));
        assert_eq!(cf.check_received(101), Err(Error::FlowControl));

        cf.add_received(90);
        cf.add_consumed(60);
        assert_eq!(cf.received(), 90);
        assert_eq!(cf.consumed(), 60);
        assert_eq!(cf.max_data_update(Instant::now(), Duration::ZERO), Some(160));
        assert_eq!(cf.max_data(), 160);

        assert_eq!(cf.max_data_update(Instant::now(), Duration::ZERO), None);
    }
}
