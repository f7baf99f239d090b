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

//! Hystart: delay and loss based slow start exit heuristics.
//!
//! Slow start can overshoot the ideal send rate, causing high packet loss
//! and poor performance on long paths. Hystart uses an increase in
//! round-trip delay as a heuristic to find an exit point before the
//! overshoot, with a conservative confirmation phase so that jitter does
//! not cause a premature exit. A cumulative loss-volume test backs the
//! delay test up on paths where queues overflow before delay builds.
//!
//! The long-RTT startup drives these tests once per ACK and leaves slow
//! start when any of them fires.

use std::time::Duration;

use super::minmax::WindowedMaxFilter;
use super::minmax::WindowedMinFilter;

/// Number of recent RTT samples the jitter filter spans. The delay test
/// stays quiet until the filter is full.
const RTT_FILTER_SPAN: usize = 4;

/// The least RTT samples in one round before the conservative phase may
/// conclude the delay increase was spurious.
const N_RTT_SAMPLE: u64 = 8;

/// Divisor applied to window growth while confirming a delay increase.
const CSS_GROWTH_DIVISOR: u64 = 4;

/// Rounds spent confirming a delay increase before exiting for good.
const CSS_ROUNDS: u64 = 5;

/// Fraction of delivered volume that may be lost before the loss test
/// forces an exit. Matches the loss threshold used when probing for
/// bandwidth.
const LOSS_VOLUME_DENOMINATOR: u64 = 50;

/// Hystart phase.
#[derive(Debug, PartialEq, Eq)]
enum HystartPhase {
    /// Standard slow start, exponential growth.
    StandardSlowStart,

    /// A delay increase was observed; growth is conservative while it is
    /// being confirmed.
    ConservativeSlowStart,

    /// Slow start is over.
    Exited,
}

/// Delay/loss filter driving the long-RTT startup exit.
#[derive(Debug)]
pub struct Hystart {
    phase: HystartPhase,

    /// Total RTT samples observed, used as the filter period.
    sample_seq: u64,

    /// RTT samples observed in the current round.
    rtt_sample_count: u64,

    /// Windowed minimum of recent RTT samples in microseconds, to keep a
    /// single delayed ACK from triggering an exit.
    min_filter: WindowedMinFilter<RTT_FILTER_SPAN>,

    /// Windowed maximum of recent RTT samples in microseconds, consulted
    /// when patching a pathological path minimum at exit.
    max_filter: WindowedMaxFilter<RTT_FILTER_SPAN>,

    /// Rounds spent in the conservative phase.
    css_round_count: u64,

    /// Filtered minimum observed when the conservative phase was entered.
    css_baseline_min_rtt: Duration,

    /// Bytes delivered since entering slow start.
    delivered: u64,

    /// Bytes lost since entering slow start.
    lost: u64,
}

impl Hystart {
    pub fn new() -> Self {
        Self {
            phase: HystartPhase::StandardSlowStart,
            sample_seq: 0,
            rtt_sample_count: 0,
            min_filter: WindowedMinFilter::new(),
            max_filter: WindowedMaxFilter::new(),
            css_round_count: 0,
            css_baseline_min_rtt: Duration::MAX,
            delivered: 0,
            lost: 0,
        }
    }

    /// Whether slow start is over.
    pub fn has_exited(&self) -> bool {
        self.phase == HystartPhase::Exited
    }

    /// Feed one RTT sample.
    pub fn on_ack(&mut self, rtt_sample: Duration) {
        if rtt_sample.is_zero() {
            return;
        }

        self.sample_seq += 1;
        self.rtt_sample_count += 1;

        let us = rtt_sample.as_micros() as u64;
        self.min_filter.start_period(self.sample_seq);
        self.min_filter.update(self.sample_seq, us);
        self.max_filter.start_period(self.sample_seq);
        self.max_filter.update(self.sample_seq, us);
    }

    /// Roll the per-round state at a round boundary.
    pub fn on_round_start(&mut self) {
        self.rtt_sample_count = 0;

        if self.phase == HystartPhase::ConservativeSlowStart {
            self.css_round_count += 1;
            if self.css_round_count >= CSS_ROUNDS {
                // The delay increase persisted; leave slow start.
                self.phase = HystartPhase::Exited;
            }
        }
    }

    /// Delay-based exit test.
    ///
    /// The filtered RTT is compared against
    /// `min_rtt + min_rtt/4 + 2*rtt_variant + pacing_packet_time`; the
    /// pacing term absorbs the delay the sender itself induces between
    /// packets. Returns true once the exit is confirmed.
    pub fn hystart_test(
        &mut self,
        min_rtt: Duration,
        rtt_variant: Duration,
        pacing_packet_time: Duration,
    ) -> bool {
        if min_rtt == Duration::MAX || self.sample_seq < RTT_FILTER_SPAN as u64 {
            return self.has_exited();
        }

        let filtered = Duration::from_micros(self.min_filter.get());
        let threshold = min_rtt + min_rtt / 4 + 2 * rtt_variant + pacing_packet_time;

        match self.phase {
            HystartPhase::StandardSlowStart => {
                if filtered >= threshold {
                    self.css_baseline_min_rtt = filtered;
                    self.css_round_count = 0;
                    self.phase = HystartPhase::ConservativeSlowStart;
                }
            }
            HystartPhase::ConservativeSlowStart => {
                if self.rtt_sample_count >= N_RTT_SAMPLE && filtered < self.css_baseline_min_rtt {
                    // The increase was jitter; resume standard slow start.
                    self.css_baseline_min_rtt = Duration::MAX;
                    self.css_round_count = 0;
                    self.phase = HystartPhase::StandardSlowStart;
                }
            }
            HystartPhase::Exited => (),
        }

        self.has_exited()
    }

    /// Cumulative loss-volume exit test.
    ///
    /// Fires when more than 2% of the volume moved during slow start was
    /// lost, with a floor of two packets so a single stray loss cannot
    /// trigger it.
    pub fn hystart_loss_volume_test(&mut self, newly_lost: u64, newly_acked: u64, mtu: u64) -> bool {
        self.delivered = self.delivered.saturating_add(newly_acked);
        self.lost = self.lost.saturating_add(newly_lost);

        if self.lost >= 2 * mtu
            && self.lost.saturating_mul(LOSS_VOLUME_DENOMINATOR)
                > self.delivered.saturating_add(self.lost)
        {
            self.phase = HystartPhase::Exited;
        }

        self.has_exited()
    }

    /// Window growth for the newly acknowledged volume under the current
    /// phase.
    pub fn hystart_increase(&self, newly_acked: u64) -> u64 {
        match self.phase {
            HystartPhase::StandardSlowStart => newly_acked,
            HystartPhase::ConservativeSlowStart => newly_acked / CSS_GROWTH_DIVISOR,
            HystartPhase::Exited => 0,
        }
    }

    /// Smallest recent RTT sample, if any were observed.
    pub fn filtered_min_rtt(&self) -> Option<Duration> {
        match self.min_filter.get() {
            u64::MAX => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    /// Largest recent RTT sample, if any were observed.
    pub fn filtered_max_rtt(&self) -> Option<Duration> {
        match self.max_filter.get() {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }
}

impl Default for Hystart {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_RTT: Duration = Duration::from_millis(100);
    const RTT_VAR: Duration = Duration::from_millis(10);

    fn feed(hystart: &mut Hystart, rtt: Duration, count: usize) {
        for _ in 0..count {
            hystart.on_ack(rtt);
        }
    }

    #[test]
    fn hystart_delay_exit_confirms_over_rounds() {
        let mut hystart = Hystart::new();

        // Threshold is 100 + 25 + 20 = 145ms; 200ms samples are above it,
        // but the exit is not immediate.
        feed(&mut hystart, Duration::from_millis(200), RTT_FILTER_SPAN);
        assert!(!hystart.hystart_test(MIN_RTT, RTT_VAR, Duration::ZERO));
        assert_eq!(hystart.hystart_increase(4000), 1000);

        // The increase persists for five rounds, then the exit sticks.
        for _ in 0..CSS_ROUNDS {
            hystart.on_round_start();
            feed(&mut hystart, Duration::from_millis(200), 1);
        }
        assert!(hystart.hystart_test(MIN_RTT, RTT_VAR, Duration::ZERO));
        assert!(hystart.has_exited());
        assert_eq!(hystart.hystart_increase(4000), 0);
    }

    #[test]
    fn hystart_spurious_delay_resumes() {
        let mut hystart = Hystart::new();

        feed(&mut hystart, Duration::from_millis(200), RTT_FILTER_SPAN);
        assert!(!hystart.hystart_test(MIN_RTT, RTT_VAR, Duration::ZERO));
        assert_eq!(hystart.hystart_increase(4000), 1000);

        // The next round sees the old RTT again for a full sample budget:
        // back to standard slow start.
        hystart.on_round_start();
        feed(&mut hystart, MIN_RTT, N_RTT_SAMPLE as usize);
        assert!(!hystart.hystart_test(MIN_RTT, RTT_VAR, Duration::ZERO));
        assert_eq!(hystart.hystart_increase(4000), 4000);
        assert!(!hystart.has_exited());
    }

    #[test]
    fn hystart_quiet_below_threshold() {
        let mut hystart = Hystart::new();

        feed(&mut hystart, Duration::from_millis(110), 20);
        assert!(!hystart.hystart_test(MIN_RTT, RTT_VAR, Duration::ZERO));
        assert_eq!(hystart.hystart_increase(4000), 4000);
    }

    #[test]
    fn hystart_loss_volume_exit() {
        let mut hystart = Hystart::new();
        let mtu = 1200;

        // 1% loss does not trigger.
        assert!(!hystart.hystart_loss_volume_test(1000, 99_000, mtu));

        // Pushing cumulative loss above 2% does.
        assert!(hystart.hystart_loss_volume_test(4000, 10_000, mtu));
        assert!(hystart.has_exited());
    }

    #[test]
    fn hystart_filtered_rtt_window() {
        let mut hystart = Hystart::new();
        assert_eq!(hystart.filtered_min_rtt(), None);
        assert_eq!(hystart.filtered_max_rtt(), None);

        feed(&mut hystart, Duration::from_millis(50), 1);
        feed(&mut hystart, Duration::from_millis(80), 1);
        assert_eq!(hystart.filtered_min_rtt(), Some(Duration::from_millis(50)));
        assert_eq!(hystart.filtered_max_rtt(), Some(Duration::from_millis(80)));

        // The 50ms sample falls out of the four-sample window.
        feed(&mut hystart, Duration::from_millis(80), RTT_FILTER_SPAN);
        assert_eq!(hystart.filtered_min_rtt(), Some(Duration::from_millis(80)));
    }
}
