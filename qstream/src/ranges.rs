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

use std::ops::Range;

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::collections::Bound;

/// A set of non-overlapping `u64` ranges.
///
/// Inserted ranges that touch or overlap existing ones are coalesced, so the
/// set always holds the minimal number of disjoint ranges.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    inner: BTreeMap<u64, u64>,
}

impl RangeSet {
    pub fn insert(&mut self, item: Range<u64>) {
        if item.is_empty() {
            return;
        }

        let mut start = item.start;
        let mut end = item.end;

        if let Some(r) = self.prev_to(start) {
            if r.end >= start {
                self.inner.remove(&r.start);

                start = r.start;
                end = std::cmp::max(end, r.end);
            }
        }

        while let Some(r) = self.next_to(start) {
            if r.start > end {
                break;
            }

            self.inner.remove(&r.start);
            end = std::cmp::max(end, r.end);
        }

        self.inner.insert(start, end);
    }

    /// Removes everything below `off`.
    pub fn remove_until(&mut self, off: u64) {
        while let Some(r) = self.first() {
            if r.start >= off {
                break;
            }

            self.inner.remove(&r.start);

            if r.end > off {
                self.inner.insert(off, r.end);
                break;
            }
        }
    }

    /// Returns true if any value of `item` is already in the set.
    pub fn overlaps(&self, item: &Range<u64>) -> bool {
        if item.is_empty() {
            return false;
        }

        if let Some(r) = self.prev_to(item.start) {
            if r.end > item.start {
                return true;
            }
        }

        match self.next_to(item.start) {
            Some(r) => r.start < item.end,

            None => false,
        }
    }

    /// Returns the lowest range.
    pub fn first(&self) -> Option<Range<u64>> {
        self.iter().next()
    }

    pub fn iter(&self) -> Iter {
        Iter {
            inner: self.inner.iter(),
        }
    }

    fn prev_to(&self, item: u64) -> Option<Range<u64>> {
        self.inner
            .range((Bound::Unbounded, Bound::Included(item)))
            .map(|(&s, &e)| (s..e))
            .next_back()
    }

    fn next_to(&self, item: u64) -> Option<Range<u64>> {
        self.inner
            .range((Bound::Excluded(item), Bound::Unbounded))
            .map(|(&s, &e)| (s..e))
            .next()
    }
}

// A `RangeSet` holding a single range is equivalent to that range.
impl PartialEq<Range<u64>> for RangeSet {
    fn eq(&self, other: &Range<u64>) -> bool {
        self.inner.len() == 1 && self.first().as_ref() == Some(other)
    }
}

impl std::fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

pub struct Iter<'a> {
    inner: btree_map::Iter<'a, u64, u64>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.inner.next()?;
        Some(start..end)
    }
}
