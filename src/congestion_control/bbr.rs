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

//! BBR Congestion Control, version 3.
//!
//! BBR uses recent measurements of a transport connection's delivery rate
//! and round-trip time to build an explicit model that includes both the
//! maximum recent bandwidth available to that connection, and its minimum
//! recent round-trip delay. BBR then uses this model to control both how
//! fast it sends data and the maximum amount of data it allows in flight
//! in the network at any time.
//!
//! This implementation carries two adaptations for difficult paths: an
//! alternate startup driven by Hystart on high-RTT paths, and a smoothed
//! loss-rate signal maintained alongside the standard model.
//!
//! See <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control-02>.

use std::time::Duration;
use std::time::Instant;

use log::*;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use super::hystart::Hystart;
use super::minmax::WindowedMaxFilter;
use super::AckSample;
use super::CongestionController;
use super::CongestionEvent;
use super::LostPacket;
use super::Path;
use crate::CongestionConfig;

/// A constant specifying the minimum gain value for calculating the
/// pacing rate that will allow the sending rate to double each round
/// (`4*ln(2)` ~= `2.77`); used in Startup mode for BBR.pacing_gain.
const STARTUP_PACING_GAIN: f64 = 2.77;

/// The cwnd gain used in Startup mode.
const STARTUP_CWND_GAIN: f64 = 2.0;

/// The static discount factor of `1%` used to scale BBR.bw to produce
/// BBR.pacing_rate.
const PACING_MARGIN_PERCENT: f64 = 0.01;

/// BBRLossThresh: The maximum tolerated per-round-trip packet loss rate
/// when probing for bandwidth (the default is `2%`).
const LOSS_THRESH: f64 = 0.02;

/// Gain of the exponentially weighted moving average tracking the
/// smoothed loss rate.
const LOSS_ALPHA: f64 = 0.125;

/// BBRBeta: The multiplicative decrease to make upon each round trip
/// during which the connection detects packet loss (the value is `0.7`).
const BETA: f64 = 0.7;

/// BBRHeadroom: The fraction of BBR.inflight_hi deliberately left unused
/// (e.g. free space in the bottleneck buffer or free time slots in the
/// bottleneck link) that can be used by cross traffic (the value is
/// `0.15`).
const HEADROOM: f64 = 0.15;

/// MinRTTFilterLen: A constant specifying the length of the BBR.min_rtt
/// min filter window, `10` secs.
const MIN_RTT_FILTER_LEN: Duration = Duration::from_secs(10);

/// ProbeRTTCwndGain: The gain applied to the BDP to compute the in-flight
/// ceiling held during ProbeRTT.
const PROBE_RTT_CWND_GAIN: f64 = 0.5;

/// ProbeRTTDuration: A constant specifying the minimum duration for which
/// ProbeRTT state holds inflight to the ProbeRTT cwnd or fewer packets:
/// `200 ms`.
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

/// ProbeRTTInterval: A constant specifying the minimum time interval
/// between ProbeRTT states: `5` secs.
const PROBE_RTT_INTERVAL: Duration = Duration::from_secs(5);

/// Percentage of the current minimum within which a new RTT sample is
/// treated as an unchanged path floor rather than new information.
const MIN_RTT_MARGIN_PERCENT: f64 = 2.0;

/// Length of the BBR.max_bw max filter window, in bandwidth probing
/// cycles.
const MAX_BW_FILTER_LEN: usize = 2;

/// The window length of the extra-acked max filter, in units of
/// packet-timed round trips.
const EXTRA_ACKED_FILTER_LEN: usize = 10;

/// Max count of full bandwidth reached, before the pipe is supposed to be
/// filled. This three-round threshold was validated by YouTube
/// experimental data.
const FULL_BW_COUNT_THRESHOLD: u64 = 3;

/// Bandwidth growth rate before the pipe got filled. (Percentage)
const FULL_BW_GROWTH_RATE: f64 = 0.25;

/// Max number of packet-timed rounds to wait before probing for
/// bandwidth, for fairness with Reno/CUBIC flows up to a BDP of at least
/// `25Mbps * .030sec / (1514bytes) = 61.9 packets`.
const PROBE_BW_MAX_ROUNDS: u64 = 63;

/// Max amount of randomness to inject in round counting for
/// Reno-coexistence.
const PROBE_BW_RAND_ROUNDS: u64 = 2;

/// Lower bound of the ProbeBW wall-clock time scale.
const PROBE_BW_MIN_WAIT_TIME_IN_MSEC: u64 = 2000;

/// Upper bound of the ProbeBW wall-clock time scale.
const PROBE_BW_MAX_WAIT_TIME_IN_MSEC: u64 = 3000;

/// Saturation point for the ProbeBW_UP growth slope.
const PROBE_BW_UP_ROUNDS_MAX: u64 = 30;

/// Pacing rates below this threshold pace single packets; above it,
/// packet pairs.
const SEND_QUANTUM_THRESHOLD_PACING_RATE: f64 = 150_000.0;

/// Upper bound on the send quantum.
const SEND_QUANTUM_MAX: u64 = 64 * 1024;

/// Paths whose minimum RTT exceeds this target leave the standard startup
/// for the Hystart driven one.
const TARGET_RENO_RTT: Duration = Duration::from_millis(100);

/// Cap applied to the RTT ratio when scaling the initial window for a
/// high-RTT path; a GEO satellite round trip.
const TARGET_SATELLITE_RTT: Duration = Duration::from_millis(600);

/// A minimum above this value cannot be a real path property and is
/// patched from observed samples when leaving the long-RTT startup.
const PATHOLOGICAL_MIN_RTT: Duration = Duration::from_secs(30);

/// BBR configurable parameters.
#[derive(Debug)]
pub struct BbrConfig {
    /// Minimal congestion window in bytes.
    min_cwnd: u64,

    /// Initial congestion window in bytes.
    initial_cwnd: u64,

    /// Initial smoothed RTT, used until the path produces samples.
    initial_rtt: Duration,

    /// Max count of rounds with bandwidth growth below
    /// `full_bw_growth_rate` before the pipe is considered full.
    full_bw_count_threshold: u64,

    /// Bandwidth growth rate to check if the pipe is filled. Default to
    /// `25%`.
    full_bw_growth_rate: f64,

    /// Probe RTT duration.
    probe_rtt_duration: Duration,

    /// Probe RTT interval.
    probe_rtt_interval: Duration,

    /// The maximum tolerated per-round-trip packet loss rate when probing
    /// for bandwidth.
    loss_threshold: f64,

    /// The multiplicative decrease to make upon each round trip during
    /// which the connection detects packet loss.
    beta: f64,

    /// The fraction of BBR.inflight_hi left free for cross traffic.
    headroom: f64,

    /// Seed material for the per-path random stream.
    random_seed: u64,
}

impl BbrConfig {
    pub fn from(conf: &CongestionConfig) -> Self {
        let max_datagram_size = conf.max_datagram_size.max(1);
        let min_cwnd = conf.min_congestion_window.saturating_mul(max_datagram_size);
        let initial_cwnd = conf
            .initial_congestion_window
            .saturating_mul(max_datagram_size);

        Self {
            min_cwnd,
            initial_cwnd,
            initial_rtt: conf.initial_rtt,
            random_seed: conf.random_seed,
            ..Self::default()
        }
    }
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self {
            min_cwnd: 4 * crate::DEFAULT_SEND_UDP_PAYLOAD_SIZE,
            initial_cwnd: 10 * crate::DEFAULT_SEND_UDP_PAYLOAD_SIZE,
            initial_rtt: crate::INITIAL_RTT,
            full_bw_count_threshold: FULL_BW_COUNT_THRESHOLD,
            full_bw_growth_rate: FULL_BW_GROWTH_RATE,
            probe_rtt_duration: PROBE_RTT_DURATION,
            probe_rtt_interval: PROBE_RTT_INTERVAL,
            loss_threshold: LOSS_THRESH,
            beta: BETA,
            headroom: HEADROOM,
            random_seed: 0,
        }
    }
}

/// Sub-phases of the bandwidth probing cycle.
//
// DOWN (drain the queue) -> CRUISE (steady) -> REFILL (one round at the
// estimated bandwidth) -> UP (push inflight_hi until loss) -> DOWN ...
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ProbeBwPhase {
    Down,
    Cruise,
    Refill,
    Up,
}

/// BBR state machine.
//
//          |
//          V
// +---> Startup ----> StartupLongRtt
// |        |                 |
// |        V                 |
// |     Drain  <-------------+
// |        |
// |        V
// +---> ProbeBW_DOWN  -------+
// | ^      |                 |
// | |      V                 |
// | |   ProbeBW_CRUISE ------+
// | |      |                 |
// | |      V                 |
// | |   ProbeBW_REFILL  -----+
// | |      |                 |
// | |      V                 |
// | |   ProbeBW_UP  ---------+
// | |      |                 |
// | +------+                 |
// |                          V
// +---- ProbeRTT <-----------+
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Mode {
    Startup,
    StartupLongRtt,
    Drain,
    ProbeBw(ProbeBwPhase),
    ProbeRtt,
}

/// Ack probe phase.
#[derive(Debug, PartialEq, Eq)]
enum AckPhase {
    /// Not probing; not getting probe feedback.
    Init,

    /// Inflight rising to probe bandwidth.
    Refilling,

    /// Starting to get feedback from bandwidth probing.
    ProbeStarting,

    /// Sending at the estimated bandwidth to drain the probe.
    ProbeStopping,

    /// Stopped probing; still getting feedback.
    ProbeFeedback,
}

/// Round trip counter, tracking packet-timed round trips which start at
/// the transmission of some segment and end at the ack of that segment.
#[derive(Debug, Default)]
struct RoundTripCounter {
    /// BBR.round_count: Count of packet-timed round trips.
    round_count: u64,

    /// BBR.round_start: True once per packet-timed round trip, on ACKs
    /// that advance BBR.round_count.
    is_round_start: bool,

    /// BBR.next_round_delivered: delivered-byte mark denoting the end of
    /// the current packet-timed round trip.
    next_round_delivered: u64,
}

/// Full pipe estimator, used during Startup mode.
#[derive(Debug, Default)]
struct FullPipeEstimator {
    /// BBR.filled_pipe: Whether BBR estimates that it has ever fully
    /// utilized its available bandwidth ("filled the pipe").
    is_filled_pipe: bool,

    /// Baseline delivery rate the growth check compares against.
    full_bw: u64,

    /// Rounds without much growth over the baseline.
    full_bw_count: u64,
}

/// Snapshot of the feedback being processed, refreshed from the host
/// sample at the start of each notification.
#[derive(Debug, Default)]
struct AckState {
    /// The delivery rate sample in bytes per second.
    delivery_rate: u64,

    /// rs.delivered: bytes delivered over the acked packet's interval.
    sample_delivered: u64,

    /// Total bytes the path has delivered so far.
    total_delivered: u64,

    /// Total delivered when the acked packet was sent.
    prior_delivered: u64,

    /// The RTT sample attached to this acknowledgement.
    rtt_sample: Duration,

    /// Newly acked data size in bytes.
    newly_acked: u64,

    /// Newly marked lost data size in bytes.
    newly_lost: u64,

    /// rs.tx_in_flight: volume of data estimated to be in flight at the
    /// transmission of the packet that has just been ACKed.
    tx_in_flight: u64,

    /// rs.lost: volume of data declared lost between the transmission and
    /// acknowledgement of that packet.
    lost: u64,

    /// Whether the sample was taken while application limited.
    is_app_limited: bool,

    /// Whether the sender was limited by the congestion window.
    is_cwnd_limited: bool,

    /// Bytes in flight when the event was processed.
    bytes_in_transit: u64,
}

/// BBR Congestion Control Algorithm, version 3.
#[derive(Debug)]
pub struct Bbr {
    /// Configurable parameters.
    config: BbrConfig,

    /// Whether the instance has been armed against a path.
    initialized: bool,

    /// Identifier of the path this instance drives, for tracing.
    path_id: u64,

    /// Current maximum datagram size for the path.
    mtu: u64,

    /// BBR.state: The current state in the BBR state machine.
    mode: Mode,

    /// BBR.pacing_rate: The current pacing rate, in bytes per second.
    pacing_rate: f64,

    /// BBR.send_quantum: The maximum size of a data aggregate scheduled
    /// and transmitted together.
    send_quantum: u64,

    /// cwnd: The sender's congestion window, in bytes.
    cwnd: u64,

    /// BBR.pacing_gain: The dynamic gain factor used to scale BBR.bw to
    /// produce BBR.pacing_rate.
    pacing_gain: f64,

    /// BBR.cwnd_gain: The dynamic gain factor used to scale the estimated
    /// BDP to produce a congestion window.
    cwnd_gain: f64,

    /// cwnd before loss recovery or ProbeRTT.
    prior_cwnd: u64,

    /// BBR.packet_conservation: Whether BBR is currently using packet
    /// conservation dynamics to bound cwnd.
    packet_conservation: bool,

    /// Counter of packet-timed round trips.
    round: RoundTripCounter,

    /// BBR.idle_restart: True if and only if the connection is restarting
    /// after being idle.
    idle_restart: bool,

    /// BBR.max_bw: The windowed maximum recent delivery rate sample,
    /// measured over the current and previous bandwidth probing cycle.
    max_bw: u64,

    /// BBR.bw_hi: The long-term maximum sending bandwidth that produced
    /// acceptable queue pressure. `u64::MAX` while inactive.
    bw_hi: u64,

    /// BBR.bw_lo: The short-term maximum sending bandwidth considered
    /// safe for matching the current delivery process. `u64::MAX` while
    /// inactive.
    bw_lo: u64,

    /// BBR.bw: min(max_bw, bw_hi, bw_lo); the bandwidth the model deems
    /// appropriate at any time scale.
    bw: u64,

    /// BBR.min_rtt: The windowed minimum round-trip time sample measured
    /// over the last MinRTTFilterLen. `Duration::MAX` until sampled.
    min_rtt: Duration,

    /// The wall clock time at which the current BBR.min_rtt sample was
    /// obtained.
    min_rtt_stamp: Instant,

    /// BBR.bdp: The estimate of the path's bandwidth-delay product.
    bdp: u64,

    /// BBR.extra_acked: The estimate of the recent degree of aggregation
    /// in the network path.
    extra_acked: u64,

    /// BBR.offload_budget: The minimum volume of data necessary to
    /// achieve full throughput using host offload mechanisms.
    offload_budget: u64,

    /// BBR.max_inflight: The volume of in-flight data required to fully
    /// utilize the bottleneck bandwidth.
    max_inflight: u64,

    /// BBR.inflight_hi: the long-term maximum volume of in-flight data
    /// that produced acceptable queue pressure. `u64::MAX` while
    /// inactive.
    inflight_hi: u64,

    /// BBR.inflight_lo: the short-term maximum volume of in-flight data
    /// considered safe for matching the current delivery process.
    /// `u64::MAX` while inactive.
    inflight_lo: u64,

    /// BBR.bw_latest: a 1-round-trip max of delivered bandwidth.
    bw_latest: u64,

    /// BBR.inflight_latest: a 1-round-trip max of delivered volume.
    inflight_latest: u64,

    /// BBR.MaxBwFilter: filter tracking the maximum recent delivery rate
    /// sample, for estimating BBR.max_bw.
    max_bw_filter: WindowedMaxFilter<MAX_BW_FILTER_LEN>,

    /// BBR.cycle_count: The virtual time used by the BBR.max_bw filter
    /// window, counted in bandwidth probing cycles.
    cycle_count: u64,

    /// Wall clock start of the current cycle phase.
    cycle_stamp: Instant,

    /// BBR.ack_phase: ACK probing state.
    ack_phase: AckPhase,

    /// Start of the interval for estimating excess acknowledged data.
    extra_acked_interval_start: Option<Instant>,

    /// Volume of data marked delivered since the interval start.
    extra_acked_delivered: u64,

    /// BBR.ExtraACKedFilter: max filter tracking the recent maximum
    /// degree of aggregation in the path.
    extra_acked_filter: WindowedMaxFilter<EXTRA_ACKED_FILTER_LEN>,

    /// Estimator of full pipe.
    full_pipe: FullPipeEstimator,

    /// BBR.probe_rtt_min_delay: The minimum RTT sample recorded in the
    /// last ProbeRTTInterval.
    probe_rtt_min_delay: Duration,

    /// The wall clock time at which the current probe_rtt_min_delay
    /// sample was obtained.
    probe_rtt_min_stamp: Instant,

    /// Whether probe_rtt_min_delay has expired and is due for a refresh,
    /// by an idle period or a transition into ProbeRTT.
    probe_rtt_expired: bool,

    /// Timestamp when the ProbeRTT dwell ends.
    probe_rtt_done_stamp: Option<Instant>,

    /// Whether a round trip in ProbeRTT state has elapsed.
    probe_rtt_round_done: bool,

    /// Snapshot of the feedback being processed.
    ack_state: AckState,

    /// Packet-timed rounds since the last bandwidth probe.
    rounds_since_bw_probe: u64,

    /// Wall-clock wait before the next bandwidth probe.
    bw_probe_wait: Duration,

    /// Bytes acked per inflight_hi increment in ProbeBW_UP.
    bw_probe_up_cnt: u64,

    /// Bytes acked since the last inflight_hi increment.
    bw_probe_up_acks: u64,

    /// Cwnd-limited rounds spent in ProbeBW_UP.
    bw_probe_up_rounds: u64,

    /// Whether rate samples reflect bandwidth probing.
    bw_probe_samples: bool,

    /// Whether a loss round started with this event.
    loss_round_start: bool,

    /// Whether loss was marked in this round.
    loss_in_round: bool,

    /// Delivered-byte mark ending the current loss round.
    loss_round_delivered: u64,

    /// Smoothed volume of delivered data per sample.
    delivered_smoothed: f64,

    /// Smoothed volume of lost data per sample.
    lost_smoothed: f64,

    /// Smoothed loss rate, for observation and future reactions.
    loss_rate_smoothed: f64,

    /// Bandwidth-delay product hint seeded by the host, in bytes.
    bdp_seed: u64,

    /// Hystart sub-state driving the long-RTT startup.
    hystart: Hystart,

    /// Per-path random stream.
    rng: StdRng,
}

impl Bbr {
    pub fn new(config: BbrConfig) -> Self {
        let now = Instant::now();
        let initial_cwnd = config.initial_cwnd;
        let seed = config.random_seed;

        Self {
            config,
            initialized: false,
            path_id: 0,
            mtu: crate::DEFAULT_SEND_UDP_PAYLOAD_SIZE,
            mode: Mode::Startup,
            pacing_rate: 0.0,
            send_quantum: 0,
            cwnd: initial_cwnd,
            pacing_gain: STARTUP_PACING_GAIN,
            cwnd_gain: STARTUP_CWND_GAIN,
            prior_cwnd: 0,
            packet_conservation: false,
            round: Default::default(),
            idle_restart: false,
            max_bw: 0,
            bw_hi: u64::MAX,
            bw_lo: u64::MAX,
            bw: 0,
            min_rtt: Duration::MAX,
            min_rtt_stamp: now,
            bdp: 0,
            extra_acked: 0,
            offload_budget: 0,
            max_inflight: 0,
            inflight_hi: u64::MAX,
            inflight_lo: u64::MAX,
            bw_latest: 0,
            inflight_latest: 0,
            max_bw_filter: WindowedMaxFilter::new(),
            cycle_count: 0,
            cycle_stamp: now,
            ack_phase: AckPhase::Init,
            extra_acked_interval_start: Some(now),
            extra_acked_delivered: 0,
            extra_acked_filter: WindowedMaxFilter::new(),
            full_pipe: Default::default(),
            probe_rtt_min_delay: Duration::MAX,
            probe_rtt_min_stamp: now,
            probe_rtt_expired: false,
            probe_rtt_done_stamp: None,
            probe_rtt_round_done: false,
            ack_state: Default::default(),
            rounds_since_bw_probe: 0,
            bw_probe_wait: Duration::MAX,
            bw_probe_up_cnt: 0,
            bw_probe_up_acks: 0,
            bw_probe_up_rounds: 0,
            bw_probe_samples: false,
            loss_round_start: false,
            loss_in_round: false,
            loss_round_delivered: 0,
            delivered_smoothed: 0.0,
            lost_smoothed: 0.0,
            loss_rate_smoothed: 0.0,
            bdp_seed: 0,
            hystart: Hystart::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Re-arm the instance against the given path. The random stream is
    /// derived from the configured seed, the endpoint role and the path
    /// identifier, so distinct paths draw distinct, reproducible streams.
    fn reset(&mut self, path: &mut Path, now: Instant) {
        let seed = self
            .config
            .random_seed
            .wrapping_add(path.unique_path_id.rotate_left(17))
            .wrapping_add(path.is_client as u64);
        self.rng = StdRng::seed_from_u64(seed);

        self.initialized = true;
        self.path_id = path.unique_path_id;
        self.mtu = path.mtu.max(1);
        self.cwnd = self.config.initial_cwnd;
        self.prior_cwnd = 0;
        self.packet_conservation = false;
        self.round = Default::default();
        self.idle_restart = false;
        self.max_bw = 0;
        self.bw_hi = u64::MAX;
        self.bw = 0;
        self.min_rtt = Duration::MAX;
        self.min_rtt_stamp = now;
        self.bdp = 0;
        self.extra_acked = 0;
        self.offload_budget = 0;
        self.max_inflight = 0;
        self.inflight_hi = u64::MAX;
        self.max_bw_filter.reset();
        self.cycle_count = 0;
        self.cycle_stamp = now;
        self.ack_phase = AckPhase::Init;
        self.extra_acked_interval_start = Some(now);
        self.extra_acked_delivered = 0;
        self.extra_acked_filter.reset();
        self.full_pipe = Default::default();
        self.probe_rtt_min_delay = Duration::MAX;
        self.probe_rtt_min_stamp = now;
        self.probe_rtt_expired = false;
        self.probe_rtt_done_stamp = None;
        self.probe_rtt_round_done = false;
        self.ack_state = Default::default();
        self.rounds_since_bw_probe = 0;
        self.bw_probe_wait = Duration::MAX;
        self.bw_probe_up_cnt = 0;
        self.bw_probe_up_acks = 0;
        self.bw_probe_up_rounds = 0;
        self.bw_probe_samples = false;
        self.loss_round_start = false;
        self.loss_in_round = false;
        self.loss_round_delivered = 0;
        self.delivered_smoothed = 0.0;
        self.lost_smoothed = 0.0;
        self.loss_rate_smoothed = 0.0;
        self.bdp_seed = 0;
        self.hystart = Hystart::new();

        self.reset_congestion_signals();
        self.reset_lower_bounds();
        self.enter_startup();
        self.init_pacing_rate();

        path.cwin = self.congestion_window();
        path.is_cc_data_updated = true;

        trace!("bbr: path {} initialized", self.path_id);
    }

    fn state_code(&self) -> u64 {
        match self.mode {
            Mode::Startup => 1,
            Mode::StartupLongRtt => 2,
            Mode::Drain => 3,
            Mode::ProbeBw(ProbeBwPhase::Down) => 4,
            Mode::ProbeBw(ProbeBwPhase::Cruise) => 5,
            Mode::ProbeBw(ProbeBwPhase::Refill) => 6,
            Mode::ProbeBw(ProbeBwPhase::Up) => 7,
            Mode::ProbeRtt => 8,
        }
    }

    fn filled_pipe(&self) -> bool {
        self.full_pipe.is_filled_pipe
    }

    fn is_in_a_probe_bw_state(&self) -> bool {
        matches!(self.mode, Mode::ProbeBw(_))
    }

    fn in_startup(&self) -> bool {
        matches!(self.mode, Mode::Startup | Mode::StartupLongRtt)
    }

    /// Probing states push inflight higher and must not shrink the
    /// short-term bounds they are trying to grow.
    fn is_probing_bw(&self) -> bool {
        matches!(
            self.mode,
            Mode::Startup
                | Mode::StartupLongRtt
                | Mode::ProbeBw(ProbeBwPhase::Refill)
                | Mode::ProbeBw(ProbeBwPhase::Up)
        )
    }

    // Round counting.
    //
    // A round is opened by transmitting a marker at the current delivered
    // mark plus the bytes in transit; it closes when the delivered total
    // reaches the marker.

    fn start_round(&mut self) {
        self.round.next_round_delivered = self
            .ack_state
            .total_delivered
            .saturating_add(self.ack_state.bytes_in_transit);
    }

    fn update_round(&mut self) {
        if self.ack_state.total_delivered >= self.round.next_round_delivered {
            self.start_round();
            self.round.round_count += 1;
            self.rounds_since_bw_probe += 1;
            self.round.is_round_start = true;
            // After one round trip under packet conservation the sender
            // trusts its window again.
            self.packet_conservation = false;
            self.extra_acked_filter.start_period(self.round.round_count);
        } else {
            self.round.is_round_start = false;
        }
    }

    // Remember and restore cwnd around ProbeRTT and loss recovery.

    fn save_cwnd(&mut self) {
        self.prior_cwnd = if !self.packet_conservation && self.mode != Mode::ProbeRtt {
            self.cwnd
        } else {
            self.cwnd.max(self.prior_cwnd)
        }
    }

    fn restore_cwnd(&mut self) {
        self.cwnd = self.cwnd.max(self.prior_cwnd)
    }

    /// Per-ACK model and state update. The sub-steps run in a fixed
    /// order; each consumes state the previous one wrote.
    fn update_model_and_state(&mut self, path: &mut Path, now: Instant) {
        self.update_latest_delivery_signals();
        self.update_congestion_signals();
        self.update_ack_aggregation(now);
        self.check_startup_long_rtt(path, now);
        self.check_startup_done(path);
        self.check_drain(now);
        self.update_probe_bw_cycle_phase(now);
        self.update_min_rtt(now);
        self.check_probe_rtt(now);
        self.advance_latest_delivery_signals();
        self.bound_bw_for_model();
    }

    fn update_control_parameters(&mut self, path: &mut Path) {
        if self.mode == Mode::StartupLongRtt {
            // The long-RTT startup grows the window by Hystart rules and
            // drives the host pacer from the window directly.
            let growth = self.hystart.hystart_increase(self.ack_state.newly_acked);
            self.cwnd = self.cwnd.saturating_add(growth);
            self.apply_long_rtt_cwnd_floor(path);
            self.cwnd = self.cwnd.max(self.config.min_cwnd);
            path.pacing
                .update_from_cwin(self.cwnd, path.smoothed_rtt, self.mtu, true);
            return;
        }

        self.set_pacing_rate();
        self.set_send_quantum();
        self.set_cwnd();
        path.pacing
            .update_rate(self.pacing_rate, self.send_quantum, self.mtu);
    }

    // Gains per state.
    //
    // +-----------------+--------+--------+------+
    // | State           | Tactic | Pacing | Cwnd |
    // +-----------------+--------+--------+------+
    // | Startup         | accel  | 2.77   | 2    |
    // | StartupLongRtt  | accel  | 2.77   | 2    |
    // | Drain           | decel  | 0.5    | 2    |
    // | ProbeBW_DOWN    | decel  | 0.9    | 2    |
    // | ProbeBW_CRUISE  | cruise | 1.0    | 2    |
    // | ProbeBW_REFILL  | accel  | 1.25   | 2    |
    // | ProbeBW_UP      | accel  | 1.25   | 2    |
    // | ProbeRTT        | decel  | 1.0    | 0.5  |
    // +-----------------+--------+--------+------+
    fn update_gains(&mut self) {
        let (pacing_gain, cwnd_gain) = match self.mode {
            Mode::Startup => (STARTUP_PACING_GAIN, STARTUP_CWND_GAIN),
            Mode::StartupLongRtt => (STARTUP_PACING_GAIN, STARTUP_CWND_GAIN),
            Mode::Drain => (1.0 / STARTUP_CWND_GAIN, STARTUP_CWND_GAIN),
            Mode::ProbeBw(ProbeBwPhase::Down) => (0.9, 2.0),
            Mode::ProbeBw(ProbeBwPhase::Cruise) => (1.0, 2.0),
            Mode::ProbeBw(ProbeBwPhase::Refill) => (1.25, 2.0),
            Mode::ProbeBw(ProbeBwPhase::Up) => (1.25, 2.0),
            Mode::ProbeRtt => (1.0, PROBE_RTT_CWND_GAIN),
        };

        self.pacing_gain = pacing_gain;
        self.cwnd_gain = cwnd_gain;
    }

    // Startup.

    fn enter_startup(&mut self) {
        self.mode = Mode::Startup;
        self.update_gains();
    }

    fn check_startup_done(&mut self, path: &mut Path) {
        if self.mode != Mode::Startup {
            return;
        }

        self.check_startup_full_bandwidth();

        if !self.filled_pipe() && self.is_inflight_too_high() {
            // Loss crossed the probing threshold before the plateau did.
            self.full_pipe.is_filled_pipe = true;
        }

        if !self.filled_pipe() && self.is_startup_rtt_too_high(path) {
            // Queueing delay built up while cwnd-limited.
            self.full_pipe.is_filled_pipe = true;
        }

        if self.filled_pipe() {
            self.exit_startup(path);
        }
    }

    fn check_startup_full_bandwidth(&mut self) {
        if self.filled_pipe() || !self.round.is_round_start || self.ack_state.is_app_limited {
            return;
        }

        // Still growing?
        if self.max_bw
            >= (self.full_pipe.full_bw as f64 * (1.0 + self.config.full_bw_growth_rate)) as u64
        {
            // Record the new baseline level.
            self.full_pipe.full_bw = self.max_bw;
            self.full_pipe.full_bw_count = 0;
            return;
        }

        // Another round without much growth.
        self.full_pipe.full_bw_count += 1;
        if self.full_pipe.full_bw_count >= self.config.full_bw_count_threshold {
            self.full_pipe.is_filled_pipe = true;
        }
    }

    fn is_startup_rtt_too_high(&self, path: &Path) -> bool {
        if self.min_rtt == Duration::MAX
            || self.ack_state.rtt_sample.is_zero()
            || !self.ack_state.is_cwnd_limited
        {
            return false;
        }

        let threshold = self.min_rtt + self.min_rtt / 4 + path.rtt_variant * 2;
        self.ack_state.rtt_sample > threshold
    }

    fn exit_startup(&mut self, path: &mut Path) {
        if self.inflight_hi == u64::MAX {
            self.inflight_hi = self.bdp_multiple(self.max_bw, 1.0);
        }

        path.is_ssthresh_initialized = true;
        self.enter_drain();
    }

    // StartupLongRtt: alternate startup for high-RTT paths, driven by the
    // Hystart delay and loss heuristics instead of the bandwidth plateau.

    fn check_startup_long_rtt(&mut self, path: &mut Path, now: Instant) {
        match self.mode {
            Mode::Startup => {
                if path.rtt_min != Duration::MAX && path.rtt_min > TARGET_RENO_RTT {
                    self.enter_startup_long_rtt(path);
                }
            }
            Mode::StartupLongRtt => self.update_startup_long_rtt(path, now),
            _ => (),
        }
    }

    fn enter_startup_long_rtt(&mut self, path: &Path) {
        self.mode = Mode::StartupLongRtt;
        self.update_gains();
        self.hystart = Hystart::new();

        // Scale the window for the long feedback loop, capped at a
        // satellite round trip.
        let target_rtt = path.rtt_min.min(TARGET_SATELLITE_RTT);
        let num = target_rtt.as_micros() as u64;
        let den = (TARGET_RENO_RTT.as_micros() as u64).max(1);
        self.cwnd = self.cwnd.saturating_mul(num) / den;

        if self.bdp_seed > 0 {
            self.cwnd = self.cwnd.max(self.bdp_seed);
        }
        self.cwnd = self.cwnd.max(self.config.min_cwnd);

        trace!(
            "bbr: path {} enters long-rtt startup, cwnd {}",
            self.path_id,
            self.cwnd
        );
    }

    fn update_startup_long_rtt(&mut self, path: &mut Path, now: Instant) {
        self.hystart.on_ack(self.ack_state.rtt_sample);
        if self.round.is_round_start {
            self.hystart.on_round_start();
        }

        let min_rtt = if self.min_rtt != Duration::MAX {
            self.min_rtt
        } else {
            path.rtt_min
        };

        let delay_exit = self
            .hystart
            .hystart_test(min_rtt, path.rtt_variant, path.pacing_packet_time);
        let loss_exit = self.hystart.hystart_loss_volume_test(
            self.ack_state.newly_lost,
            self.ack_state.newly_acked,
            self.mtu,
        );

        if delay_exit || loss_exit || self.is_inflight_too_high() {
            self.exit_startup_long_rtt(path, now);
        }
    }

    fn exit_startup_long_rtt(&mut self, path: &mut Path, now: Instant) {
        self.round.is_round_start = true;
        self.full_pipe.is_filled_pipe = true;

        // A minimum that high cannot be a real path property; if the
        // samples the Hystart filter saw disagree, trust them instead.
        if self.min_rtt > PATHOLOGICAL_MIN_RTT {
            if let (Some(observed_min), Some(observed_max)) = (
                self.hystart.filtered_min_rtt(),
                self.hystart.filtered_max_rtt(),
            ) {
                if observed_max < self.min_rtt {
                    self.min_rtt = observed_min;
                    self.min_rtt_stamp = now;
                    self.probe_rtt_min_delay = observed_min;
                    self.probe_rtt_min_stamp = now;
                }
            }
        }

        trace!(
            "bbr: path {} leaves long-rtt startup, cwnd {}",
            self.path_id,
            self.cwnd
        );

        self.exit_startup(path);
    }

    /// Floor keeping the long-RTT window from collapsing below half of
    /// what the path is known to sustain.
    fn apply_long_rtt_cwnd_floor(&mut self, path: &Path) {
        let min_rtt = if self.min_rtt != Duration::MAX {
            self.min_rtt
        } else {
            path.rtt_min
        };
        if min_rtt == Duration::MAX {
            return;
        }

        let peak = (path.peak_bandwidth_estimate as f64 * min_rtt.as_secs_f64()) as u64;
        let floor = peak.max(self.bdp_seed) / 2;
        self.cwnd = self.cwnd.max(floor);
    }

    // Drain.

    fn enter_drain(&mut self) {
        self.mode = Mode::Drain;
        self.update_gains();

        trace!("bbr: path {} enters drain", self.path_id);
    }

    fn check_drain(&mut self, now: Instant) {
        if self.mode == Mode::Drain
            && self.ack_state.bytes_in_transit <= self.bdp_multiple(self.max_bw, 1.0)
        {
            // The queue was drained.
            self.enter_probe_bw(now);
        }
    }

    // ProbeBW cycle: DOWN -> CRUISE -> REFILL -> UP -> DOWN.

    fn enter_probe_bw(&mut self, now: Instant) {
        self.start_probe_bw_down(now);
    }

    fn start_probe_bw_down(&mut self, now: Instant) {
        self.reset_congestion_signals();
        self.bw_probe_up_cnt = u64::MAX;
        self.pick_probe_wait();
        self.cycle_stamp = now;
        self.ack_phase = AckPhase::ProbeStopping;
        self.start_round();
        self.mode = Mode::ProbeBw(ProbeBwPhase::Down);
        self.update_gains();

        trace!(
            "bbr: path {} probe bw down, smoothed loss rate {:.4}",
            self.path_id,
            self.loss_rate_smoothed
        );
    }

    fn start_probe_bw_cruise(&mut self) {
        self.mode = Mode::ProbeBw(ProbeBwPhase::Cruise);
        self.update_gains();
    }

    fn start_probe_bw_refill(&mut self) {
        self.reset_lower_bounds();
        self.bw_probe_up_rounds = 0;
        self.bw_probe_up_acks = 0;
        self.ack_phase = AckPhase::Refilling;
        self.start_round();
        self.mode = Mode::ProbeBw(ProbeBwPhase::Refill);
        self.update_gains();
    }

    fn start_probe_bw_up(&mut self, now: Instant) {
        self.ack_phase = AckPhase::ProbeStarting;
        self.start_round();
        self.cycle_stamp = now;
        self.mode = Mode::ProbeBw(ProbeBwPhase::Up);
        self.update_gains();
        self.raise_inflight_hi_slope();
    }

    /// The core state machine logic for ProbeBW, evaluated once per ACK
    /// after the upper bounds adapted to the sample.
    fn update_probe_bw_cycle_phase(&mut self, now: Instant) {
        if !self.filled_pipe() {
            // Only handling steady-state behavior here.
            return;
        }

        self.adapt_upper_bounds(now);

        if !self.is_in_a_probe_bw_state() {
            return;
        }

        match self.mode {
            Mode::ProbeBw(ProbeBwPhase::Down) => {
                if self.check_time_to_probe_bw(now) {
                    // Already decided a transition.
                    return;
                }

                if self.check_time_to_cruise() {
                    self.start_probe_bw_cruise();
                }
            }
            Mode::ProbeBw(ProbeBwPhase::Cruise) => {
                self.check_time_to_probe_bw(now);
            }
            Mode::ProbeBw(ProbeBwPhase::Refill) => {
                // One full round at the estimated bandwidth refills the
                // pipe; then probe upward.
                if self.round.is_round_start {
                    self.bw_probe_samples = true;
                    self.start_probe_bw_up(now);
                }
            }
            Mode::ProbeBw(ProbeBwPhase::Up) => {
                if self.has_elapsed_in_phase(now, self.min_rtt)
                    && self.ack_state.bytes_in_transit > self.inflight_with_bw(1.25, self.max_bw)
                {
                    self.start_probe_bw_down(now);
                }
            }
            _ => (),
        }
    }

    /// Is it time to transition from DOWN or CRUISE to REFILL?
    fn check_time_to_probe_bw(&mut self, now: Instant) -> bool {
        if self.has_elapsed_in_phase(now, self.bw_probe_wait)
            || self.is_reno_coexistence_probe_time()
        {
            self.start_probe_bw_refill();
            return true;
        }

        false
    }

    /// Time to transition from DOWN to CRUISE?
    fn check_time_to_cruise(&mut self) -> bool {
        let bytes_in_transit = self.ack_state.bytes_in_transit;

        if bytes_in_transit > self.inflight_with_headroom() {
            // Not enough headroom.
            return false;
        }

        bytes_in_transit <= self.inflight_with_bw(1.0, self.max_bw)
    }

    fn pick_probe_wait(&mut self) {
        // Randomized decision about how long to wait until probing for
        // bandwidth, using round count and wall clock.
        self.rounds_since_bw_probe = self.rng.gen_range(0..PROBE_BW_RAND_ROUNDS);
        self.bw_probe_wait = Duration::from_millis(
            self.rng
                .gen_range(PROBE_BW_MIN_WAIT_TIME_IN_MSEC..PROBE_BW_MAX_WAIT_TIME_IN_MSEC),
        );
    }

    fn is_reno_coexistence_probe_time(&self) -> bool {
        // Random loss can shave some small percentage off of our inflight
        // in each round. To survive this, flows need robust periodic
        // probes on the time scale Reno/CUBIC recover on.
        let reno_rounds = self.target_inflight() / self.mtu.max(1);
        let rounds = reno_rounds.min(PROBE_BW_MAX_ROUNDS);

        self.rounds_since_bw_probe >= rounds
    }

    /// How much data do we want in flight? Our estimated BDP, unless
    /// congestion cut cwnd.
    fn target_inflight(&self) -> u64 {
        self.bdp.min(self.cwnd)
    }

    fn has_elapsed_in_phase(&self, now: Instant, interval: Duration) -> bool {
        if interval == Duration::MAX {
            return false;
        }

        self.cycle_stamp
            .checked_add(interval)
            .map_or(false, |deadline| now > deadline)
    }

    /// A volume of data that tries to leave free headroom in the
    /// bottleneck buffer or link for other flows, for fairness
    /// convergence and lower RTTs and loss.
    fn inflight_with_headroom(&self) -> u64 {
        if self.inflight_hi == u64::MAX {
            return u64::MAX;
        }

        (((1.0 - self.config.headroom) * self.inflight_hi as f64) as u64)
            .max(self.config.min_cwnd)
    }

    /// Calculate the "slope": bytes S/ACKed per inflight_hi increment.
    fn raise_inflight_hi_slope(&mut self) {
        let growth_this_round = 1u64 << self.bw_probe_up_rounds.min(PROBE_BW_UP_ROUNDS_MAX);
        self.bw_probe_up_rounds = (self.bw_probe_up_rounds + 1).min(PROBE_BW_UP_ROUNDS_MAX);
        self.bw_probe_up_cnt = (self.cwnd / growth_this_round).max(1);
    }

    /// Increase inflight_hi if appropriate.
    fn probe_inflight_hi_upward(&mut self) {
        if !self.ack_state.is_cwnd_limited || self.cwnd < self.inflight_hi {
            // Not fully using inflight_hi, so don't grow it.
            return;
        }

        self.bw_probe_up_acks = self
            .bw_probe_up_acks
            .saturating_add(self.ack_state.newly_acked);
        if self.bw_probe_up_acks >= self.bw_probe_up_cnt {
            let delta = self.bw_probe_up_acks / self.bw_probe_up_cnt;
            self.bw_probe_up_acks -= delta * self.bw_probe_up_cnt;
            self.inflight_hi = self.inflight_hi.saturating_add(delta * self.mtu);
        }

        if self.round.is_round_start {
            self.raise_inflight_hi_slope();
        }
    }

    /// Track ACK state and update the BBR.max_bw window, BBR.inflight_hi
    /// and BBR.bw_hi.
    fn adapt_upper_bounds(&mut self, now: Instant) {
        if self.ack_phase == AckPhase::ProbeStarting && self.round.is_round_start {
            // Starting to get bandwidth probing samples.
            self.ack_phase = AckPhase::ProbeFeedback;
        }

        if self.ack_phase == AckPhase::ProbeStopping && self.round.is_round_start {
            // End of samples from the bandwidth probing phase.
            self.bw_probe_samples = false;
            self.ack_phase = AckPhase::Init;

            if self.is_in_a_probe_bw_state() && !self.ack_state.is_app_limited {
                self.advance_max_bw_filter();
            }
        }

        if !self.check_inflight_too_high(now) {
            // Loss rate is safe. Adjust upper bounds upward.
            if self.inflight_hi == u64::MAX {
                // No upper bounds to raise.
                return;
            }

            if self.ack_state.tx_in_flight > self.inflight_hi {
                self.inflight_hi = self.ack_state.tx_in_flight;
            }

            if self.bw_hi != u64::MAX && self.ack_state.delivery_rate > self.bw_hi {
                self.bw_hi = self.ack_state.delivery_rate;
            }

            if self.mode == Mode::ProbeBw(ProbeBwPhase::Up) {
                self.probe_inflight_hi_upward();
            }
        }
    }

    // ProbeRTT.

    fn update_min_rtt(&mut self, now: Instant) {
        let sample_rtt = self.ack_state.rtt_sample;
        self.probe_rtt_expired = now.saturating_duration_since(self.probe_rtt_min_stamp)
            > self.config.probe_rtt_interval;

        if !sample_rtt.is_zero() {
            if sample_rtt <= self.probe_rtt_min_delay || self.probe_rtt_expired {
                self.probe_rtt_min_delay = sample_rtt;
                self.probe_rtt_min_stamp = now;
            } else if sample_rtt <= self.probe_rtt_min_delay.saturating_add(self.min_rtt_margin())
            {
                // The path floor is unchanged within noise; refresh the
                // stamp instead of scheduling a ProbeRTT.
                self.probe_rtt_min_stamp = now;
                self.probe_rtt_expired = false;
            }
        }

        let min_rtt_expired =
            now.saturating_duration_since(self.min_rtt_stamp) > MIN_RTT_FILTER_LEN;

        if self.probe_rtt_min_delay < self.min_rtt || min_rtt_expired {
            self.min_rtt = self.probe_rtt_min_delay;
            self.min_rtt_stamp = self.probe_rtt_min_stamp;
        } else if !sample_rtt.is_zero()
            && sample_rtt <= self.min_rtt.saturating_add(self.min_rtt_margin())
        {
            self.min_rtt_stamp = now;
        }
    }

    /// Band within which a new RTT sample still confirms the current
    /// minimum: a small relative margin plus the serialization time of
    /// two datagrams at the estimated bandwidth.
    fn min_rtt_margin(&self) -> Duration {
        if self.min_rtt == Duration::MAX {
            return Duration::ZERO;
        }

        let mut margin = self.min_rtt.mul_f64(MIN_RTT_MARGIN_PERCENT / 100.0);
        if self.max_bw > 0 {
            margin += Duration::from_secs_f64(2.0 * self.mtu as f64 / self.max_bw as f64);
        }

        margin
    }

    fn check_probe_rtt(&mut self, now: Instant) {
        if self.mode != Mode::ProbeRtt && self.probe_rtt_expired && !self.idle_restart {
            self.enter_probe_rtt();

            // Remember the last-known good cwnd, restored when leaving.
            self.save_cwnd();
            self.probe_rtt_done_stamp = None;
            self.ack_phase = AckPhase::ProbeStopping;
            self.start_round();
        }

        if self.mode == Mode::ProbeRtt {
            self.handle_probe_rtt(now);
        }

        if self.ack_state.total_delivered > 0 {
            self.idle_restart = false;
        }
    }

    fn enter_probe_rtt(&mut self) {
        self.mode = Mode::ProbeRtt;
        self.update_gains();

        trace!("bbr: path {} enters probe rtt", self.path_id);
    }

    fn handle_probe_rtt(&mut self, now: Instant) {
        if self.probe_rtt_done_stamp.is_some() {
            if self.round.is_round_start {
                self.probe_rtt_round_done = true;
            }

            if self.probe_rtt_round_done {
                self.check_probe_rtt_done(now);
            }
        } else if self.ack_state.bytes_in_transit <= self.probe_rtt_cwnd() {
            // Inflight reached the floor; dwell for at least
            // ProbeRTTDuration and one round.
            self.probe_rtt_done_stamp = Some(now + self.config.probe_rtt_duration);
            self.probe_rtt_round_done = false;
            self.start_round();
        }
    }

    fn check_probe_rtt_done(&mut self, now: Instant) {
        if let Some(probe_rtt_done_stamp) = self.probe_rtt_done_stamp {
            if now > probe_rtt_done_stamp {
                // Schedule the next ProbeRTT.
                self.probe_rtt_min_stamp = now;
                self.restore_cwnd();
                self.exit_probe_rtt(now);
            }
        }
    }

    fn exit_probe_rtt(&mut self, now: Instant) {
        self.reset_lower_bounds();

        if self.filled_pipe() {
            self.start_probe_bw_down(now);
            self.start_probe_bw_cruise();
        } else {
            self.enter_startup();
        }
    }

    /// The in-flight ceiling held while draining for a min-RTT sample.
    fn probe_rtt_cwnd(&mut self) -> u64 {
        self.bdp_multiple(self.bw, PROBE_RTT_CWND_GAIN)
            .max(self.config.min_cwnd)
    }

    /// Restarting from idle leaves cwnd as-is and paces at exactly the
    /// estimated bandwidth, to return as quickly as possible to the
    /// target operating point.
    fn handle_restart_from_idle(&mut self, now: Instant) {
        if self.ack_state.bytes_in_transit == 0 && self.ack_state.is_app_limited {
            self.idle_restart = true;
            self.extra_acked_interval_start = Some(now);

            if self.is_in_a_probe_bw_state() {
                self.set_pacing_rate_with_gain(1.0);
            } else if self.mode == Mode::ProbeRtt {
                self.check_probe_rtt_done(now);
            }
        }
    }

    // Bandwidth model.

    fn update_max_bw(&mut self) {
        self.update_round();

        let rate = self.ack_state.delivery_rate;
        if rate >= self.max_bw || !self.ack_state.is_app_limited {
            // Application limited intervals underestimate capacity; they
            // may only confirm an existing peak, never lower it.
            self.max_bw_filter.update(self.cycle_count, rate);
            self.max_bw = self.max_bw_filter.get();
        }
    }

    /// Advance the virtual time the BBR.max_bw filter window runs on,
    /// counted in cyclical progressions through ProbeBW cycles.
    fn advance_max_bw_filter(&mut self) {
        self.cycle_count += 1;
        self.max_bw_filter.start_period(self.cycle_count);
    }

    fn bound_bw_for_model(&mut self) {
        self.bw = self.max_bw.min(self.bw_hi).min(self.bw_lo);
    }

    // Congestion signals and short-term lower bounds.

    /// Near the start of ACK processing: track the 1-round maxima of the
    /// delivery process and detect loss-round boundaries.
    fn update_latest_delivery_signals(&mut self) {
        self.loss_round_start = false;

        self.bw_latest = self.bw_latest.max(self.ack_state.delivery_rate);
        self.inflight_latest = self.inflight_latest.max(self.ack_state.sample_delivered);

        if self.ack_state.prior_delivered >= self.loss_round_delivered {
            self.loss_round_delivered = self.ack_state.total_delivered;
            self.loss_round_start = true;
        }
    }

    /// Near the end of ACK processing: rebase the 1-round maxima at a
    /// loss-round boundary.
    fn advance_latest_delivery_signals(&mut self) {
        if self.loss_round_start {
            self.bw_latest = self.ack_state.delivery_rate;
            self.inflight_latest = self.ack_state.sample_delivered;
        }
    }

    fn reset_congestion_signals(&mut self) {
        self.loss_in_round = false;
        self.bw_latest = 0;
        self.inflight_latest = 0;
    }

    fn update_congestion_signals(&mut self) {
        self.update_max_bw();

        if self.ack_state.newly_lost > 0 {
            self.loss_in_round = true;
        }

        if !self.loss_round_start {
            // Wait until the end of the round trip.
            return;
        }

        self.adapt_lower_bounds_from_congestion();
        self.loss_in_round = false;
    }

    fn adapt_lower_bounds_from_congestion(&mut self) {
        // When probing we need to push inflight higher, not shrink it.
        if self.is_probing_bw() {
            return;
        }

        if self.loss_in_round {
            self.init_lower_bounds();
            self.loss_lower_bounds();
        }
    }

    fn init_lower_bounds(&mut self) {
        if self.bw_lo == u64::MAX {
            self.bw_lo = self.max_bw;
        }

        if self.inflight_lo == u64::MAX {
            self.inflight_lo = self.cwnd;
        }
    }

    fn loss_lower_bounds(&mut self) {
        self.bw_lo = self
            .bw_latest
            .max((self.bw_lo as f64 * self.config.beta) as u64);
        self.inflight_lo = self
            .inflight_latest
            .max((self.inflight_lo as f64 * self.config.beta) as u64);
    }

    fn reset_lower_bounds(&mut self) {
        self.bw_lo = u64::MAX;
        self.inflight_lo = u64::MAX;
    }

    /// Smoothed loss rate over the delivery process, for observation and
    /// reserved for future reactions.
    fn update_loss_rate(&mut self) {
        self.delivered_smoothed = (1.0 - LOSS_ALPHA) * self.delivered_smoothed
            + LOSS_ALPHA * self.ack_state.sample_delivered as f64;
        self.lost_smoothed =
            (1.0 - LOSS_ALPHA) * self.lost_smoothed + LOSS_ALPHA * self.ack_state.newly_lost as f64;

        self.loss_rate_smoothed = if self.delivered_smoothed > 0.0 {
            self.lost_smoothed / self.delivered_smoothed
        } else {
            0.0
        };
    }

    // ACK aggregation.

    /// Estimate the windowed max degree of ACK aggregation, as extra data
    /// acked beyond what the estimated bandwidth predicted over the
    /// interval. The estimate provisions extra in-flight data to keep
    /// sending during inter-ACK silences.
    fn update_ack_aggregation(&mut self, now: Instant) {
        let Some(interval_start) = self.extra_acked_interval_start else {
            self.extra_acked_delivered = 0;
            self.extra_acked_interval_start = Some(now);
            return;
        };

        let interval = now.saturating_duration_since(interval_start);
        let mut expected_delivered =
            ((self.bw as u128).saturating_mul(interval.as_micros()) / 1_000_000) as u64;

        // Reset the interval if the ACK rate is below the expected rate.
        if self.extra_acked_delivered <= expected_delivered {
            self.extra_acked_delivered = 0;
            self.extra_acked_interval_start = Some(now);
            expected_delivered = 0;
        }

        self.extra_acked_delivered = self
            .extra_acked_delivered
            .saturating_add(self.ack_state.newly_acked);

        let extra = self
            .extra_acked_delivered
            .saturating_sub(expected_delivered)
            .min(self.cwnd);

        self.extra_acked_filter
            .update(self.round.round_count, extra);
        self.extra_acked = self.extra_acked_filter.get();
    }

    // Loss response while probing.

    fn check_inflight_too_high(&mut self, now: Instant) -> bool {
        if self.is_inflight_too_high() {
            if self.bw_probe_samples {
                self.handle_inflight_too_high(now);
            }

            return true;
        }

        false
    }

    fn is_inflight_too_high(&self) -> bool {
        self.ack_state.lost
            > (self.ack_state.tx_in_flight as f64 * self.config.loss_threshold) as u64
    }

    /// Loss rate is too high while probing. Adapt (once per bandwidth
    /// probe) by cutting inflight_hi and restarting the cycle.
    fn handle_inflight_too_high(&mut self, now: Instant) {
        self.bw_probe_samples = false;

        if !self.ack_state.is_app_limited {
            // An app-limited flow was not robustly probing the maximum
            // volume of inflight data it thinks might be safe.
            self.inflight_hi = ((self.target_inflight() as f64 * self.config.beta) as u64)
                .max(self.ack_state.tx_in_flight);
        }

        if self.mode == Mode::ProbeBw(ProbeBwPhase::Up) {
            self.start_probe_bw_down(now);
        }
    }

    /// Process one loss detection event, to estimate more precisely the
    /// in-flight volume at which loss rates crossed the threshold.
    fn update_on_loss(&mut self, packet: &LostPacket, now: Instant) {
        if !self.bw_probe_samples && !self.in_startup() {
            // Not a packet sent while probing bandwidth.
            return;
        }

        self.ack_state.tx_in_flight = packet.tx_in_flight;
        self.ack_state.lost = packet.lost;
        self.ack_state.is_app_limited = packet.is_app_limited;

        if self.is_inflight_too_high() {
            self.ack_state.tx_in_flight = self.inflight_hi_from_lost_packet(packet);
            self.handle_inflight_too_high(now);
        }
    }

    // Calculate the tx_in_flight level that corresponded to excessive
    // loss, by solving for the lost prefix in:
    //     (lost_prev + lost_prefix) / (inflight_prev + lost_prefix)
    //         >= LossThresh
    //     lost_prefix = (LossThresh * inflight_prev - lost_prev)
    //         / (1 - LossThresh)
    fn inflight_hi_from_lost_packet(&self, packet: &LostPacket) -> u64 {
        let size = packet.size;
        let inflight_prev = packet.tx_in_flight.saturating_sub(size);
        let lost_prev = packet.lost.saturating_sub(size);

        let lost_prefix = (inflight_prev as f64 * self.config.loss_threshold - lost_prev as f64)
            / (1.0 - self.config.loss_threshold);
        if lost_prefix < 0.0 {
            return inflight_prev;
        }

        inflight_prev.saturating_add(lost_prefix as u64)
    }

    /// A loss event outside a conservation round saves the window and
    /// rebases it onto what is actually in flight for one round.
    fn enter_recovery(&mut self, path: &Path) {
        self.save_cwnd();

        self.cwnd = path
            .bytes_in_transit
            .saturating_add(self.ack_state.newly_acked.max(self.mtu));
        self.packet_conservation = true;
        self.start_round();

        trace!(
            "bbr: path {} enters recovery, cwnd {}",
            self.path_id,
            self.cwnd
        );
    }

    // Control outputs.

    /// Before the first bandwidth estimate exists, the pacing rate is
    /// derived from the initial window and the initial RTT.
    fn init_pacing_rate(&mut self) {
        let srtt = self.config.initial_rtt.max(Duration::from_millis(1));
        let nominal_bandwidth = self.config.initial_cwnd as f64 / srtt.as_secs_f64();
        self.pacing_rate = self.pacing_gain * nominal_bandwidth;
    }

    fn set_pacing_rate_with_gain(&mut self, pacing_gain: f64) {
        let rate = pacing_gain * self.bw as f64 * (1.0 - PACING_MARGIN_PERCENT);

        // Until the pipe is filled the rate is only ever raised, so a
        // slow-started flow never paces below its startup ramp.
        if self.filled_pipe() || rate > self.pacing_rate {
            self.pacing_rate = rate;
        }
    }

    fn set_pacing_rate(&mut self) {
        self.set_pacing_rate_with_gain(self.pacing_gain);
    }

    fn set_send_quantum(&mut self) {
        let floor = if self.pacing_rate < SEND_QUANTUM_THRESHOLD_PACING_RATE {
            self.mtu
        } else {
            2 * self.mtu
        };

        // send_quantum tracks the volume paced out over one millisecond.
        self.send_quantum = ((self.pacing_rate / 1000.0) as u64).clamp(floor, SEND_QUANTUM_MAX);
    }

    fn bdp_multiple(&mut self, bw: u64, gain: f64) -> u64 {
        if self.min_rtt == Duration::MAX {
            // No valid RTT samples yet.
            return self.config.initial_cwnd;
        }

        let bdp = bw as f64 * self.min_rtt.as_secs_f64();
        self.bdp = bdp as u64;

        (gain * bdp) as u64
    }

    fn update_offload_budget(&mut self) {
        self.offload_budget = 3 * self.send_quantum;
    }

    fn quantization_budget(&mut self, inflight: u64) -> u64 {
        self.update_offload_budget();

        let mut budget = inflight.max(self.offload_budget).max(self.config.min_cwnd);

        if self.mode == Mode::ProbeBw(ProbeBwPhase::Up) {
            budget = budget.saturating_add(2 * self.mtu);
        }

        budget
    }

    fn inflight_with_bw(&mut self, gain: f64, bw: u64) -> u64 {
        let inflight = self.bdp_multiple(bw, gain);
        self.quantization_budget(inflight)
    }

    fn update_max_inflight(&mut self) {
        let mut inflight = self.bdp_multiple(self.max_bw, self.cwnd_gain);
        inflight = inflight.saturating_add(self.extra_acked);

        self.max_inflight = self.quantization_budget(inflight);
    }

    /// cwnd is cut immediately down to max_inflight when above it, and
    /// raised gradually and cautiously when below, by no more than the
    /// acknowledged volume per ACK.
    fn set_cwnd(&mut self) {
        self.update_max_inflight();
        self.modulate_cwnd_for_recovery();

        if !self.packet_conservation {
            if self.filled_pipe() {
                self.cwnd = self
                    .max_inflight
                    .min(self.cwnd.saturating_add(self.ack_state.newly_acked));
            } else if self.cwnd < self.max_inflight
                || self.ack_state.total_delivered < self.config.initial_cwnd
            {
                self.cwnd = self.cwnd.saturating_add(self.ack_state.newly_acked);
            }
            self.cwnd = self.cwnd.max(self.config.min_cwnd);
        }

        self.bound_cwnd_for_probe_rtt();
        self.bound_cwnd_for_model();
    }

    fn modulate_cwnd_for_recovery(&mut self) {
        if self.ack_state.newly_lost > 0 {
            self.cwnd = self
                .cwnd
                .saturating_sub(self.ack_state.newly_lost)
                .max(self.mtu);
        }

        if self.packet_conservation {
            self.cwnd = self.cwnd.max(
                self.ack_state
                    .bytes_in_transit
                    .saturating_add(self.ack_state.newly_acked),
            );
        }
    }

    fn bound_cwnd_for_probe_rtt(&mut self) {
        if self.mode == Mode::ProbeRtt {
            self.cwnd = self.cwnd.min(self.probe_rtt_cwnd());
        }
    }

    /// Bound cwnd by the model: by inflight_hi while probing, by the
    /// headroom-reduced ceiling while cruising or draining for a min-RTT
    /// sample, and by inflight_lo after recent congestion.
    fn bound_cwnd_for_model(&mut self) {
        let mut cap = u64::MAX;

        if self.is_in_a_probe_bw_state() && self.mode != Mode::ProbeBw(ProbeBwPhase::Cruise) {
            cap = self.inflight_hi;
        } else if self.mode == Mode::ProbeRtt || self.mode == Mode::ProbeBw(ProbeBwPhase::Cruise)
        {
            cap = self.inflight_with_headroom();
        }

        cap = cap.min(self.inflight_lo);
        cap = cap.max(self.config.min_cwnd);
        self.cwnd = self.cwnd.min(cap);
        self.cwnd = self.cwnd.max(self.config.min_cwnd);
    }

    // Notification entry points.

    fn on_acknowledgement(&mut self, path: &mut Path, sample: &AckSample, now: Instant) {
        self.begin_ack(path, sample);
        self.update_loss_rate();
        self.handle_restart_from_idle(now);
        self.update_model_and_state(path, now);
        self.update_control_parameters(path);

        path.cwin = self.congestion_window();
        path.is_cc_data_updated = true;
    }

    fn begin_ack(&mut self, path: &Path, sample: &AckSample) {
        self.mtu = path.mtu.max(1);

        let delivery_rate = if sample.delivery_rate > 0 {
            sample.delivery_rate
        } else {
            AckSample::fallback_delivery_rate(sample.delivered, sample.rtt_sample)
        };

        self.ack_state = AckState {
            delivery_rate,
            sample_delivered: sample.delivered,
            total_delivered: path.delivered,
            prior_delivered: path.delivered.saturating_sub(sample.delivered),
            rtt_sample: sample.rtt_sample,
            newly_acked: sample.newly_acked,
            newly_lost: sample.newly_lost,
            tx_in_flight: sample.tx_in_flight,
            lost: sample.lost,
            is_app_limited: sample.is_app_limited,
            is_cwnd_limited: sample.is_cwnd_limited,
            bytes_in_transit: path.bytes_in_transit,
        };
    }

    fn on_loss_event(&mut self, path: &mut Path, packet: &LostPacket, now: Instant) {
        self.mtu = path.mtu.max(1);
        self.ack_state.total_delivered = path.delivered;
        self.ack_state.bytes_in_transit = path.bytes_in_transit;

        self.update_on_loss(packet, now);

        if !self.packet_conservation {
            self.enter_recovery(path);
        }

        path.cwin = self.congestion_window();
        path.is_cc_data_updated = true;
    }

    fn on_spurious_loss(&mut self, path: &mut Path) {
        // The retransmit signal was wrong; the best-known window from
        // before the reaction still matches the path.
        self.restore_cwnd();

        path.cwin = self.congestion_window();
        path.is_cc_data_updated = true;
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd.max(self.config.min_cwnd)
    }
}

impl CongestionController for Bbr {
    fn name(&self) -> &str {
        "bbr"
    }

    fn notify(&mut self, path: &mut Path, event: CongestionEvent, now: Instant) {
        if !self.initialized {
            self.reset(path, now);
        }

        match event {
            CongestionEvent::Acknowledgement(sample) => {
                self.on_acknowledgement(path, sample, now)
            }
            CongestionEvent::Repeat(packet) => self.on_loss_event(path, packet, now),
            CongestionEvent::Timeout(packet) => self.on_loss_event(path, packet, now),
            CongestionEvent::SpuriousRepeat => self.on_spurious_loss(path),
            // TODO: react to ECN-CE marks once the transport surfaces
            // per-round ECN counts.
            CongestionEvent::EcnEc => (),
            // RTT samples are consumed through the acknowledgement path.
            CongestionEvent::RttMeasurement => (),
            CongestionEvent::CwinBlocked => (),
            CongestionEvent::Reset => self.reset(path, now),
            CongestionEvent::SeedCwin(bdp) => self.bdp_seed = bdp,
        }
    }

    fn observe(&self, _path: &Path) -> (u64, u64) {
        (self.state_code(), self.bw)
    }

    fn congestion_window(&self) -> u64 {
        Bbr::congestion_window(self)
    }

    fn pacing_rate(&self) -> Option<u64> {
        Some(self.pacing_rate as u64)
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_cwnd
    }

    fn minimal_window(&self) -> u64 {
        self.config.min_cwnd
    }

    fn in_slow_start(&self) -> bool {
        self.in_startup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MTU: u64 = 1200;
    const RTT: Duration = Duration::from_millis(30);

    /// 100 Mbps in bytes per second.
    const RATE_100M: u64 = 12_500_000;

    struct Harness {
        cc: Bbr,
        path: Path,
        now: Instant,
    }

    impl Harness {
        fn new(seed: u64, path_id: u64) -> Self {
            let mut conf = CongestionConfig::default();
            conf.set_random_seed(seed);

            let mut path = Path::new(MTU, true, path_id);
            path.smoothed_rtt = RTT;
            path.rtt_variant = RTT / 8;
            path.rtt_min = RTT;

            Self {
                cc: Bbr::new(BbrConfig::from(&conf)),
                path,
                now: Instant::now(),
            }
        }

        fn state_code(&self) -> u64 {
            self.cc.observe(&self.path).0
        }

        /// One acknowledgement closing a full round: time advances by one
        /// RTT and the path delivers the volume that was in transit.
        fn ack_round(&mut self, delivery_rate: u64, in_flight: u64, lost: u64) {
            self.ack_round_with_rtt(delivery_rate, in_flight, lost, RTT);
        }

        fn ack_round_with_rtt(
            &mut self,
            delivery_rate: u64,
            in_flight: u64,
            lost: u64,
            rtt: Duration,
        ) {
            self.now += rtt;
            self.path.delivered += in_flight;
            self.path.bytes_in_transit = in_flight;

            let sample = AckSample {
                delivery_rate,
                delivered: in_flight,
                rtt_sample: rtt,
                newly_acked: in_flight,
                newly_lost: lost,
                tx_in_flight: in_flight,
                lost,
                is_app_limited: false,
                is_cwnd_limited: false,
            };
            self.cc.notify(
                &mut self.path,
                CongestionEvent::Acknowledgement(&sample),
                self.now,
            );
        }

        /// Exponential ramp to 100 Mbps followed by a plateau, leaving
        /// the controller in Drain.
        fn drive_startup_to_drain(&mut self) {
            let mut rate = 125_000u64;
            while rate < RATE_100M {
                self.ack_round(rate, 400_000, 0);
                assert_eq!(self.state_code(), 1);
                rate = (rate * 2).min(RATE_100M);
            }

            // First plateau round records the new baseline.
            self.ack_round(RATE_100M, 400_000, 0);
            assert_eq!(self.state_code(), 1);

            // Three rounds without growth fill the pipe.
            self.ack_round(RATE_100M, 400_000, 0);
            self.ack_round(RATE_100M, 400_000, 0);
            assert_eq!(self.state_code(), 1);
            self.ack_round(RATE_100M, 400_000, 0);
            assert_eq!(self.state_code(), 3);
        }

        /// Full path from startup into the ProbeBW cycle.
        fn drive_startup_to_probe_bw(&mut self) {
            self.drive_startup_to_drain();

            // The BDP is about 375000 bytes (12.5MB/s over 30ms);
            // dropping in-flight below it drains the queue. Staying above
            // the headroom ceiling keeps the same ACK from falling
            // through to CRUISE.
            self.ack_round(RATE_100M, 360_000, 0);
            assert_eq!(self.state_code(), 4);
        }
    }

    fn expected_bdp() -> u64 {
        (RATE_100M as f64 * RTT.as_secs_f64()) as u64
    }

    #[test]
    fn bbr_startup_plateau_exits_to_drain() {
        let mut h = Harness::new(42, 1);

        assert_eq!(h.cc.name(), "bbr");
        assert_eq!(h.state_code(), 1);
        assert!(h.cc.in_slow_start());

        h.drive_startup_to_drain();

        assert!(h.cc.filled_pipe());
        assert!(h.path.is_ssthresh_initialized);
        assert_eq!(h.cc.max_bw, RATE_100M);
        assert_eq!(h.cc.min_rtt, RTT);

        // Exiting startup seeded the in-flight ceiling from the BDP;
        // the same acknowledgement then raised it to the observed
        // in-flight volume.
        assert_eq!(h.cc.inflight_hi, 400_000);
    }

    #[test]
    fn bbr_drain_exits_to_probe_bw_down() {
        let mut h = Harness::new(42, 1);
        h.drive_startup_to_drain();

        // Still above the BDP: stays in Drain.
        h.ack_round(RATE_100M, 400_000, 0);
        assert_eq!(h.state_code(), 3);

        h.ack_round(RATE_100M, 360_000, 0);
        assert_eq!(h.state_code(), 4);
    }

    #[test]
    fn bbr_startup_high_loss_exits_same_ack() {
        let mut h = Harness::new(42, 1);

        let mut rate = 125_000u64;
        for _ in 0..5 {
            h.ack_round(rate, 400_000, 0);
            rate *= 2;
        }
        assert_eq!(h.state_code(), 1);

        // 5% of the transmitted window was lost: above the 2% threshold,
        // the same acknowledgement leaves startup.
        h.ack_round(rate, 400_000, 20_000);
        assert!(h.cc.filled_pipe());
        assert_eq!(h.state_code(), 3);
        assert!(h.path.is_ssthresh_initialized);
    }

    #[test]
    fn bbr_high_rtt_path_enters_long_rtt_startup() {
        let mut h = Harness::new(42, 1);
        let long_rtt = Duration::from_millis(400);
        h.path.rtt_min = long_rtt;
        h.path.smoothed_rtt = long_rtt;

        h.now += long_rtt;
        h.path.delivered += 10_000;
        h.path.bytes_in_transit = 10_000;
        let sample = AckSample {
            delivery_rate: 50_000,
            delivered: 10_000,
            rtt_sample: long_rtt,
            newly_acked: 0,
            ..Default::default()
        };
        h.cc.notify(
            &mut h.path,
            CongestionEvent::Acknowledgement(&sample),
            h.now,
        );

        assert_eq!(h.state_code(), 2);
        assert!(h.cc.in_slow_start());

        // The initial window was scaled by 400ms / 100ms.
        assert_eq!(h.path.cwin, 4 * 10 * MTU);

        // The host pacer is driven from the window in this state.
        assert!(h.path.pacing.force_immediate());
        assert!(h.path.pacing.take_update());
    }

    #[test]
    fn bbr_long_rtt_startup_exits_on_loss_volume() {
        let mut h = Harness::new(42, 1);
        let long_rtt = Duration::from_millis(400);
        h.path.rtt_min = long_rtt;
        h.path.smoothed_rtt = long_rtt;

        h.ack_round_with_rtt(250_000, 100_000, 0, long_rtt);
        assert_eq!(h.state_code(), 2);

        // Push cumulative loss volume over 2%.
        h.ack_round_with_rtt(250_000, 100_000, 10_000, long_rtt);
        assert!(h.cc.filled_pipe());
        assert!(h.path.is_ssthresh_initialized);
        assert_ne!(h.state_code(), 2);
    }

    #[test]
    fn bbr_seed_cwin_raises_long_rtt_window() {
        let mut h = Harness::new(42, 1);
        let long_rtt = Duration::from_millis(400);
        h.path.rtt_min = long_rtt;
        h.path.smoothed_rtt = long_rtt;

        h.cc
            .notify(&mut h.path, CongestionEvent::SeedCwin(500_000), h.now);
        h.ack_round_with_rtt(250_000, 10_000, 0, long_rtt);

        assert_eq!(h.state_code(), 2);
        assert!(h.path.cwin >= 500_000);
    }

    #[test]
    fn bbr_probe_bw_cycle_phases() {
        let mut h = Harness::new(42, 1);
        h.drive_startup_to_probe_bw();

        // DOWN -> CRUISE once in-flight fits under the headroom ceiling
        // (85% of the BDP-seeded inflight_hi) and the BDP.
        h.ack_round(RATE_100M, 300_000, 0);
        assert_eq!(h.state_code(), 5);

        // CRUISE -> REFILL after the randomized wait (bounded by 3s).
        h.now += Duration::from_millis(3100);
        h.ack_round(RATE_100M, 300_000, 0);
        assert_eq!(h.state_code(), 6);

        // REFILL -> UP after one full round.
        h.ack_round(RATE_100M, 300_000, 0);
        assert_eq!(h.state_code(), 7);
        assert!(h.cc.bw_probe_samples);

        // UP -> DOWN after at least min_rtt in phase with in-flight
        // above 1.25x the BDP budget.
        h.now += Duration::from_millis(5);
        h.ack_round(RATE_100M, 500_000, 0);
        assert_eq!(h.state_code(), 4);
    }

    #[test]
    fn bbr_probe_bw_transition_dag() {
        // Phase codes observed over a long steady drive may only follow
        // the DOWN -> {CRUISE, REFILL}, CRUISE -> REFILL, REFILL -> UP,
        // UP -> DOWN edges.
        let mut h = Harness::new(7, 3);
        h.drive_startup_to_probe_bw();

        let allowed = [(4u64, 5u64), (4, 6), (5, 6), (6, 7), (7, 4)];
        let mut prev = h.state_code();
        for i in 0..300 {
            let in_flight = if i % 7 == 0 { 460_000 } else { 310_000 };
            h.ack_round(RATE_100M, in_flight, 0);

            let code = h.state_code();
            assert!((4..=7).contains(&code));
            if code != prev {
                assert!(
                    allowed.contains(&(prev, code)),
                    "illegal transition {prev} -> {code}"
                );
                prev = code;
            }
        }
    }

    #[test]
    fn bbr_probe_rtt_trigger_and_exit() {
        let mut h = Harness::new(42, 1);
        h.drive_startup_to_probe_bw();
        h.ack_round(RATE_100M, 300_000, 0);
        assert_eq!(h.state_code(), 5);

        // RTT samples run above the floor plus margin, so the min-RTT
        // stamp goes stale; 5s later ProbeRTT fires.
        let noisy_rtt = Duration::from_millis(50);
        for _ in 0..52 {
            h.now += Duration::from_millis(100);
            h.path.delivered += 200_000;
            h.path.bytes_in_transit = 200_000;
            let sample = AckSample {
                delivery_rate: RATE_100M,
                delivered: 200_000,
                rtt_sample: noisy_rtt,
                newly_acked: 200_000,
                tx_in_flight: 200_000,
                ..Default::default()
            };
            h.cc.notify(
                &mut h.path,
                CongestionEvent::Acknowledgement(&sample),
                h.now,
            );
            if h.state_code() == 8 {
                break;
            }
        }
        assert_eq!(h.state_code(), 8);

        // The window is pinned at most to half the BDP.
        assert!(h.path.cwin <= expected_bdp() / 2 + 1);
        let prior = h.cc.prior_cwnd;
        assert!(prior > 0);

        // In-flight falls under the ProbeRTT ceiling: the dwell starts.
        h.ack_round(RATE_100M, 100_000, 0);
        assert!(h.cc.probe_rtt_done_stamp.is_some());

        // One round plus 200ms later the state exits into CRUISE with
        // the saved window restored (then bounded by the cruise cap).
        h.now += Duration::from_millis(150);
        h.ack_round(RATE_100M, 100_000, 0);
        h.now += Duration::from_millis(150);
        h.ack_round(RATE_100M, 100_000, 0);
        assert_eq!(h.state_code(), 5);
        assert!(h.cc.cwnd >= prior.min(h.cc.inflight_with_headroom()));
        assert!(h.cc.cwnd > expected_bdp() / 2);
    }

    #[test]
    fn bbr_min_rtt_margin_refreshes_stamp() {
        let mut h = Harness::new(42, 1);
        h.drive_startup_to_probe_bw();
        h.ack_round(RATE_100M, 300_000, 0);

        // Samples within the margin of the floor keep refreshing the
        // stamp: 6 seconds of them and still no ProbeRTT.
        let jitter_rtt = RTT + Duration::from_micros(300);
        for _ in 0..60 {
            h.now += Duration::from_millis(100);
            h.path.delivered += 200_000;
            h.path.bytes_in_transit = 200_000;
            let sample = AckSample {
                delivery_rate: RATE_100M,
                delivered: 200_000,
                rtt_sample: jitter_rtt,
                newly_acked: 200_000,
                tx_in_flight: 200_000,
                ..Default::default()
            };
            h.cc.notify(
                &mut h.path,
                CongestionEvent::Acknowledgement(&sample),
                h.now,
            );
            assert_ne!(h.state_code(), 8);
        }

        // The floor itself was not displaced by the jittered samples.
        assert_eq!(h.cc.min_rtt, RTT);
    }

    #[test]
    fn bbr_congestion_adapts_lower_bounds() {
        let mut h = Harness::new(42, 1);
        h.drive_startup_to_probe_bw();
        h.ack_round(RATE_100M, 300_000, 0);
        assert_eq!(h.state_code(), 5);

        assert_eq!(h.cc.bw_lo, u64::MAX);
        assert_eq!(h.cc.inflight_lo, u64::MAX);

        // Lossy rounds while cruising arm the short-term bounds.
        h.ack_round(RATE_100M, 300_000, 9_000);
        h.ack_round(RATE_100M, 300_000, 9_000);

        assert_ne!(h.cc.bw_lo, u64::MAX);
        assert_ne!(h.cc.inflight_lo, u64::MAX);
        assert!(h.cc.bw <= h.cc.bw_lo);
    }

    #[test]
    fn bbr_invariants_hold_across_mixed_feedback() {
        let mut h = Harness::new(11, 9);

        let mut prev_round_count = 0;
        let mut rate = 125_000u64;
        for i in 0..200u64 {
            let lost = if i % 13 == 0 { 12_000 } else { 0 };
            let in_flight = 200_000 + (i % 5) * 40_000;
            h.ack_round(rate.min(RATE_100M), in_flight, lost);
            rate = rate.saturating_add(rate / 3);

            // cwnd never falls below four packets.
            assert!(h.path.cwin >= 4 * MTU);

            // The model bandwidth respects every active bound.
            assert!(h.cc.bw <= h.cc.max_bw);
            if h.cc.bw_lo != u64::MAX {
                assert!(h.cc.bw <= h.cc.bw_lo);
            }
            if h.cc.bw_hi != u64::MAX {
                assert!(h.cc.bw <= h.cc.bw_hi);
            }

            // Rounds only move forward.
            assert!(h.cc.round.round_count >= prev_round_count);
            prev_round_count = h.cc.round.round_count;
        }
    }

    #[test]
    fn bbr_loss_event_enters_recovery_and_spurious_restores() {
        let mut h = Harness::new(42, 1);

        let mut rate = 125_000u64;
        for _ in 0..6 {
            h.ack_round(rate, 200_000, 0);
            rate *= 2;
        }
        let cwnd_before = h.cc.cwnd;

        h.path.bytes_in_transit = 100_000;
        let packet = LostPacket {
            size: MTU,
            tx_in_flight: 200_000,
            lost: MTU,
            is_app_limited: false,
        };
        h.cc
            .notify(&mut h.path, CongestionEvent::Repeat(&packet), h.now);

        assert!(h.cc.packet_conservation);
        assert_eq!(h.cc.prior_cwnd, cwnd_before);
        assert!(h.cc.cwnd < cwnd_before);

        // The repeat turned out to be spurious; the window comes back.
        h.cc
            .notify(&mut h.path, CongestionEvent::SpuriousRepeat, h.now);
        assert!(h.cc.cwnd >= cwnd_before);

        // Conservation lifts at the next round boundary.
        h.ack_round(rate, 200_000, 0);
        assert!(!h.cc.packet_conservation);
    }

    #[test]
    fn bbr_loss_event_cuts_inflight_hi_while_probing() {
        let mut h = Harness::new(42, 1);
        h.drive_startup_to_probe_bw();

        // Reach UP so that probe samples are armed.
        h.ack_round(RATE_100M, 300_000, 0);
        h.now += Duration::from_millis(3100);
        h.ack_round(RATE_100M, 300_000, 0);
        h.ack_round(RATE_100M, 300_000, 0);
        assert_eq!(h.state_code(), 7);
        let hi_before = h.cc.inflight_hi;

        // A lost packet whose send-time flight was 8% lost.
        let packet = LostPacket {
            size: 2 * MTU,
            tx_in_flight: 300_000,
            lost: 24_000,
            is_app_limited: false,
        };
        h.cc
            .notify(&mut h.path, CongestionEvent::Repeat(&packet), h.now);

        assert!(h.cc.inflight_hi < hi_before);
        assert_eq!(h.state_code(), 4);
    }

    #[test]
    fn bbr_rtt_measurement_and_cwin_blocked_are_noops() {
        let mut h = Harness::new(42, 1);
        h.ack_round(125_000, 200_000, 0);

        let cwin = h.path.cwin;
        let observed = h.cc.observe(&h.path);
        h.path.is_cc_data_updated = false;

        h.cc
            .notify(&mut h.path, CongestionEvent::RttMeasurement, h.now);
        h.cc
            .notify(&mut h.path, CongestionEvent::CwinBlocked, h.now);
        h.cc.notify(&mut h.path, CongestionEvent::EcnEc, h.now);

        assert_eq!(h.path.cwin, cwin);
        assert_eq!(h.cc.observe(&h.path), observed);
        assert!(!h.path.is_cc_data_updated);
    }

    #[test]
    fn bbr_observe_reports_model_bandwidth() {
        let mut h = Harness::new(42, 1);
        assert_eq!(h.cc.observe(&h.path), (1, 0));

        h.drive_startup_to_drain();
        let (code, bw) = h.cc.observe(&h.path);
        assert_eq!(code, 3);
        assert_eq!(bw, RATE_100M);
    }

    #[test]
    fn bbr_reset_replays_identically() {
        fn drive_script(h: &mut Harness) -> Vec<(u64, u64, u64)> {
            let mut trace = Vec::new();
            let mut rate = 125_000u64;
            for i in 0..10 {
                let lost = if i == 7 { 5_000 } else { 0 };
                h.ack_round(rate.min(RATE_100M), 400_000, lost);
                rate *= 2;
                trace.push((
                    h.state_code(),
                    h.path.cwin,
                    h.cc.pacing_rate().unwrap_or(0),
                ));
            }
            trace
        }

        // Two fresh instances with the same seed inputs produce the same
        // trace.
        let mut h1 = Harness::new(5, 2);
        let mut h2 = Harness::new(5, 2);
        let first = drive_script(&mut h1);
        assert_eq!(first, drive_script(&mut h2));

        // Reset mid-flight, then replay: the trace repeats even though
        // the path's absolute delivered count kept growing.
        h1.cc.notify(&mut h1.path, CongestionEvent::Reset, h1.now);
        assert_eq!(h1.path.cwin, h1.cc.initial_window());
        assert_eq!(first, drive_script(&mut h1));
    }

    #[test]
    fn bbr_loss_rate_smoothing_tracks_loss() {
        let mut h = Harness::new(42, 1);

        for _ in 0..20 {
            h.ack_round(1_000_000, 100_000, 0);
        }
        assert_eq!(h.cc.loss_rate_smoothed, 0.0);

        for _ in 0..20 {
            h.ack_round(1_000_000, 100_000, 5_000);
        }

        // Converges towards 5% with the 1/8 gain.
        assert!(h.cc.loss_rate_smoothed > 0.03);
        assert!(h.cc.loss_rate_smoothed < 0.06);
    }
}
