// Copyright (c) 2024 The PathCC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Windowed max/min filters over a small number of measurement periods.
//!
//! Each filter keeps one slot per period in a fixed-size circular array.
//! `update` folds a sample into the slot of the current period; the
//! reported value is the best value over all slots. Slots are cleared only
//! at explicit period boundaries (`start_period`), so an old peak cannot
//! dominate once its period rotates out.

/// Windowed maximum over the last `N` periods.
///
/// Used with `N = 2` for the max-bandwidth filter (periods are bandwidth
/// probing cycles) and `N = 10` for the extra-acked filter (periods are
/// packet-timed round trips).
#[derive(Debug, Clone, Copy)]
pub struct WindowedMaxFilter<const N: usize> {
    slots: [u64; N],
}

impl<const N: usize> WindowedMaxFilter<N> {
    pub fn new() -> Self {
        Self { slots: [0; N] }
    }

    fn index(period: u64) -> usize {
        (period % N as u64) as usize
    }

    /// Fold a sample into the slot of the given period.
    pub fn update(&mut self, period: u64, value: u64) {
        let slot = &mut self.slots[Self::index(period)];
        *slot = (*slot).max(value);
    }

    /// Open a new period, discarding the samples its slot held.
    pub fn start_period(&mut self, period: u64) {
        self.slots[Self::index(period)] = 0;
    }

    /// The maximum over all retained periods.
    pub fn get(&self) -> u64 {
        self.slots.iter().copied().max().unwrap_or(0)
    }

    /// Forget all samples.
    pub fn reset(&mut self) {
        self.slots = [0; N];
    }
}

impl<const N: usize> Default for WindowedMaxFilter<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Windowed minimum over the last `N` periods.
///
/// Unlike the max filter, a period slot stores the last sample written to
/// it; the reported value is the minimum over all slots. Empty slots hold
/// the neutral `u64::MAX`.
#[derive(Debug, Clone, Copy)]
pub struct WindowedMinFilter<const N: usize> {
    slots: [u64; N],
}

impl<const N: usize> WindowedMinFilter<N> {
    pub fn new() -> Self {
        Self {
            slots: [u64::MAX; N],
        }
    }

    fn index(period: u64) -> usize {
        (period % N as u64) as usize
    }

    /// Store a sample into the slot of the given period.
    pub fn update(&mut self, period: u64, value: u64) {
        self.slots[Self::index(period)] = value;
    }

    /// Open a new period, discarding the sample its slot held.
    pub fn start_period(&mut self, period: u64) {
        self.slots[Self::index(period)] = u64::MAX;
    }

    /// The minimum over all retained periods.
    pub fn get(&self) -> u64 {
        self.slots.iter().copied().min().unwrap_or(u64::MAX)
    }

    /// Forget all samples.
    pub fn reset(&mut self) {
        self.slots = [u64::MAX; N];
    }
}

impl<const N: usize> Default for WindowedMinFilter<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_filter_folds_into_current_slot() {
        let mut filter: WindowedMaxFilter<2> = WindowedMaxFilter::new();

        filter.update(0, 100);
        filter.update(0, 80);
        assert_eq!(filter.get(), 100);

        // A new period keeps the old peak visible until it rotates out.
        filter.start_period(1);
        filter.update(1, 90);
        assert_eq!(filter.get(), 100);

        // Period 2 reuses slot 0 and clears the old peak.
        filter.start_period(2);
        filter.update(2, 70);
        assert_eq!(filter.get(), 90);

        filter.start_period(3);
        assert_eq!(filter.get(), 70);
    }

    #[test]
    fn max_filter_reset() {
        let mut filter: WindowedMaxFilter<10> = WindowedMaxFilter::new();
        for round in 0..10 {
            filter.update(round, 10 * (round + 1));
        }
        assert_eq!(filter.get(), 100);

        filter.reset();
        assert_eq!(filter.get(), 0);
    }

    #[test]
    fn min_filter_overwrites_current_slot() {
        let mut filter: WindowedMinFilter<4> = WindowedMinFilter::new();
        assert_eq!(filter.get(), u64::MAX);

        filter.update(0, 300);
        filter.update(1, 200);
        assert_eq!(filter.get(), 200);

        // Slot store overwrites rather than folds.
        filter.update(1, 400);
        assert_eq!(filter.get(), 300);

        // Rotating far enough drops the old minimum.
        for period in 2..6 {
            filter.start_period(period);
            filter.update(period, 500 + period);
        }
        assert_eq!(filter.get(), 502);
    }
}
