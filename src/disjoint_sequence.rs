use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use crate::error::InvalidRange;

/// Tracks which sequence numbers were seen. Everything up to and including `low()` counts as
///  seen, and values above it are kept as disjoint inclusive ranges. A range that becomes
///  contiguous with `low()` is collapsed into it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DisjointSequence {
    low: u64,
    /// start -> end (inclusive). Ranges are neither overlapping nor adjacent, and all of them start
    ///  above `low + 1`.
    ranges: BTreeMap<u64, u64>,
}

impl DisjointSequence {
    pub fn new(initial: u64) -> DisjointSequence {
        DisjointSequence {
            low: initial,
            ranges: BTreeMap::new(),
        }
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.ranges.last_key_value()
            .map(|(_, &end)| end)
            .unwrap_or(self.low)
    }

    /// true if there are gaps above `low()`
    pub fn disjoint(&self) -> bool {
        !self.ranges.is_empty()
    }

    pub fn contains(&self, value: u64) -> bool {
        if value <= self.low {
            return true;
        }
        match self.ranges.range(..=value).next_back() {
            Some((_, &end)) => value <= end,
            None => false,
        }
    }

    /// The lowest value seen above the first gap, or `high()` if there is no gap
    pub fn last_ack(&self) -> u64 {
        self.ranges.first_key_value()
            .map(|(&start, _)| start)
            .unwrap_or(self.low)
    }

    /// Marks `value` as seen. Returns false, leaving the sequence unchanged, if `value` is not
    ///  above `low()`.
    pub fn update(&mut self, value: u64) -> bool {
        if value <= self.low {
            return false;
        }
        self.insert(value, value);
        true
    }

    /// Marks every value in `low..=high` as seen, with the same semantics as calling `update()`
    ///  for each of them.
    pub fn update_range(&mut self, low: u64, high: u64) -> Result<bool, InvalidRange> {
        if low > high {
            return Err(InvalidRange { low, high });
        }
        if high <= self.low {
            return Ok(false);
        }
        self.insert(low.max(self.low + 1), high);
        Ok(true)
    }

    /// Abandons all tracking and starts over at `value`
    pub fn skip(&mut self, value: u64) {
        self.low = value;
        self.ranges.clear();
    }

    /// The gaps between `low()` and `high()`, in ascending order
    pub fn missing_ranges(&self) -> Vec<RangeInclusive<u64>> {
        let mut result = Vec::with_capacity(self.ranges.len());
        let mut prev_end = self.low;
        for (&start, &end) in &self.ranges {
            result.push(prev_end + 1 ..= start - 1);
            prev_end = end;
        }
        result
    }

    fn insert(&mut self, mut start: u64, mut end: u64) {
        if let Some((&prev_start, &prev_end)) = self.ranges.range(..=start).next_back() {
            if prev_end.saturating_add(1) >= start {
                start = prev_start;
                end = end.max(prev_end);
                self.ranges.remove(&prev_start);
            }
        }
        while let Some((&next_start, &next_end)) = self.ranges.range(start..=end.saturating_add(1)).next() {
            end = end.max(next_end);
            self.ranges.remove(&next_start);
        }

        if start == self.low + 1 {
            self.low = end;
        }
        else {
            self.ranges.insert(start, end);
        }
    }
}
