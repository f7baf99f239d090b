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

//! Publication of pacing decisions to the host pacer.
//!
//! The controller does not schedule packets itself. It publishes a target
//! rate, a burst cap (send quantum) and the derived per-packet interval
//! into this block; the transport's pacer consumes them on its own
//! schedule. `take_update` lets the host poll for changes without
//! re-deriving state on every send.

use std::time::Duration;

/// Pacing outputs for one path.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Target rate in bytes per second.
    rate: f64,

    /// Maximum size of a data aggregate scheduled and transmitted together.
    send_quantum: u64,

    /// Interval between full-sized packets at the current rate.
    packet_time: Duration,

    /// Whether the host should apply the rate without smoothing.
    force_immediate: bool,

    /// Whether the rate changed since the host last consumed it.
    updated: bool,
}

impl Pacing {
    pub fn new() -> Self {
        Self {
            rate: 0.0,
            send_quantum: 0,
            packet_time: Duration::ZERO,
            force_immediate: false,
            updated: false,
        }
    }

    /// Publish a rate and burst cap estimated by the controller.
    pub fn update_rate(&mut self, rate: f64, send_quantum: u64, mtu: u64) {
        if rate <= 0.0 {
            return;
        }

        self.rate = rate;
        self.send_quantum = send_quantum;
        self.packet_time = Duration::from_secs_f64(mtu as f64 / rate);
        self.force_immediate = false;
        self.updated = true;
    }

    /// Derive the rate from the congestion window, for controllers that
    /// drive the pacer from `cwin` rather than a bandwidth model.
    pub fn update_from_cwin(
        &mut self,
        cwin: u64,
        smoothed_rtt: Duration,
        mtu: u64,
        force_immediate: bool,
    ) {
        if smoothed_rtt.is_zero() || cwin == 0 {
            return;
        }

        let rate = cwin as f64 / smoothed_rtt.as_secs_f64();
        self.rate = rate;
        self.send_quantum = self.send_quantum.max(mtu);
        self.packet_time = Duration::from_secs_f64(mtu as f64 / rate);
        self.force_immediate = force_immediate;
        self.updated = true;
    }

    /// Target rate in bytes per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Current burst cap in bytes.
    pub fn send_quantum(&self) -> u64 {
        self.send_quantum
    }

    /// Interval between full-sized packets at the current rate.
    pub fn packet_time(&self) -> Duration {
        self.packet_time
    }

    /// Whether the pending update must be applied without smoothing.
    pub fn force_immediate(&self) -> bool {
        self.force_immediate
    }

    /// Consume the pending-update flag.
    pub fn take_update(&mut self) -> bool {
        std::mem::take(&mut self.updated)
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_update_rate() {
        let mut pacing = Pacing::new();
        assert_eq!(pacing.take_update(), false);

        pacing.update_rate(1_200_000.0, 14_600, 1200);
        assert_eq!(pacing.rate(), 1_200_000.0);
        assert_eq!(pacing.send_quantum(), 14_600);
        assert_eq!(pacing.packet_time(), Duration::from_millis(1));
        assert_eq!(pacing.force_immediate(), false);
        assert_eq!(pacing.take_update(), true);
        assert_eq!(pacing.take_update(), false);

        // A zero rate is not publishable.
        pacing.update_rate(0.0, 1200, 1200);
        assert_eq!(pacing.take_update(), false);
        assert_eq!(pacing.rate(), 1_200_000.0);
    }

    #[test]
    fn pacing_update_from_cwin() {
        let mut pacing = Pacing::new();

        // 120000 bytes per 100ms round trip is 1.2 MB/s.
        pacing.update_from_cwin(120_000, Duration::from_millis(100), 1200, true);
        assert_eq!(pacing.rate(), 1_200_000.0);
        assert_eq!(pacing.send_quantum(), 1200);
        assert_eq!(pacing.force_immediate(), true);
        assert_eq!(pacing.take_update(), true);

        // Degenerate inputs leave the published state alone.
        pacing.update_from_cwin(120_000, Duration::ZERO, 1200, false);
        assert_eq!(pacing.take_update(), false);
    }
}
