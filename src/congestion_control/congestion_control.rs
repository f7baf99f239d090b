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

use core::str::FromStr;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use strum_macros::EnumIter;

use crate::CongestionConfig;
use crate::Error;
use crate::Result;
pub use bbr::Bbr;
pub use bbr::BbrConfig;
pub use hystart::Hystart;
pub use minmax::WindowedMaxFilter;
pub use minmax::WindowedMinFilter;
pub use pacing::Pacing;

/// Floor applied to delivery rates derived without a real estimate.
pub const MIN_DELIVERY_RATE: u64 = 40_000;

/// Available congestion control algorithms.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default, EnumIter)]
pub enum CongestionControlAlgorithm {
    /// BBR uses recent measurements of a transport connection's delivery
    /// rate, round-trip time, and packet loss rate to build an explicit
    /// model of the network path. The model is then used to control data
    /// transmission speed and the maximum volume of data allowed in
    /// flight at any time. This implementation follows version 3 of the
    /// algorithm, with a Hystart based startup on high-RTT paths.
    #[default]
    Bbr,
}

impl CongestionControlAlgorithm {
    /// The identifier the algorithm registers under.
    pub fn name(&self) -> &'static str {
        match self {
            CongestionControlAlgorithm::Bbr => "bbr",
        }
    }
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("bbr") {
            Ok(CongestionControlAlgorithm::Bbr)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Per-path state shared between the host transport and the congestion
/// controller.
///
/// The host refreshes the input fields before every notification. The
/// controller never retains references into this struct between calls;
/// it writes its decisions back into the output fields.
#[derive(Debug)]
pub struct Path {
    /// Current maximum datagram size for the path, in bytes.
    pub mtu: u64,

    /// Smoothed RTT estimate.
    pub smoothed_rtt: Duration,

    /// RTT mean deviation estimate.
    pub rtt_variant: Duration,

    /// Minimum RTT observed by the transport on this path.
    pub rtt_min: Duration,

    /// Bytes currently in flight.
    pub bytes_in_transit: u64,

    /// Total bytes delivered on the path so far.
    pub delivered: u64,

    /// The transport's own bandwidth estimate, in bytes per second.
    pub bandwidth_estimate: u64,

    /// The largest bandwidth the transport ever estimated, in bytes per
    /// second.
    pub peak_bandwidth_estimate: u64,

    /// Interval between packets at the currently applied pacing rate.
    pub pacing_packet_time: Duration,

    /// When the last ACK-eliciting data frame was sent, if any.
    pub last_time_acked_data_frame_sent: Option<Instant>,

    /// When the sender was last application limited, if ever.
    pub last_sender_limited_time: Option<Instant>,

    /// Whether this endpoint is the client of the connection.
    pub is_client: bool,

    /// Identifier of this path, unique within the connection.
    pub unique_path_id: u64,

    /// Output: the congestion window in bytes.
    pub cwin: u64,

    /// Output: set once the controller has left its startup phase.
    pub is_ssthresh_initialized: bool,

    /// Output: set whenever a notification changed the control outputs.
    pub is_cc_data_updated: bool,

    /// Output: pacing rate and send quantum publication.
    pub pacing: Pacing,
}

impl Path {
    pub fn new(mtu: u64, is_client: bool, unique_path_id: u64) -> Self {
        Self {
            mtu,
            smoothed_rtt: Duration::ZERO,
            rtt_variant: Duration::ZERO,
            rtt_min: Duration::MAX,
            bytes_in_transit: 0,
            delivered: 0,
            bandwidth_estimate: 0,
            peak_bandwidth_estimate: 0,
            pacing_packet_time: Duration::ZERO,
            last_time_acked_data_frame_sent: None,
            last_sender_limited_time: None,
            is_client,
            unique_path_id,
            cwin: 0,
            is_ssthresh_initialized: false,
            is_cc_data_updated: false,
            pacing: Pacing::new(),
        }
    }
}

/// A delivery rate sample, constructed by the host for each processed
/// acknowledgement.
#[derive(Debug, Default, Clone, Copy)]
pub struct AckSample {
    /// The delivery rate sample in bytes per second. Hosts without an
    /// estimate must derive one with [`AckSample::fallback_delivery_rate`].
    pub delivery_rate: u64,

    /// Bytes marked delivered over the acknowledged packet's interval.
    pub delivered: u64,

    /// The RTT sample attached to this acknowledgement.
    pub rtt_sample: Duration,

    /// Bytes newly acknowledged by this ACK.
    pub newly_acked: u64,

    /// Bytes newly marked lost while processing this ACK.
    pub newly_lost: u64,

    /// Bytes that were in flight when the acknowledged packet was sent.
    pub tx_in_flight: u64,

    /// Bytes declared lost between that packet's transmission and its
    /// acknowledgement.
    pub lost: u64,

    /// Whether the sample was taken while application limited.
    pub is_app_limited: bool,

    /// Whether the sender was limited by the congestion window when the
    /// acknowledged packet was sent.
    pub is_cwnd_limited: bool,
}

impl AckSample {
    /// Delivery rate to report when the host has no estimate of its own:
    /// the delivered volume over the RTT, floored conservatively.
    pub fn fallback_delivery_rate(delivered: u64, rtt_sample: Duration) -> u64 {
        let us = rtt_sample.as_micros() as u64;
        if us == 0 {
            return MIN_DELIVERY_RATE;
        }

        (delivered.saturating_mul(1_000_000) / us).max(MIN_DELIVERY_RATE)
    }
}

/// A packet reported lost by the transport's loss detection.
#[derive(Debug, Default, Clone, Copy)]
pub struct LostPacket {
    /// Size of the lost packet in bytes.
    pub size: u64,

    /// Bytes that were in flight when the packet was sent.
    pub tx_in_flight: u64,

    /// Bytes declared lost between the packet's transmission and this
    /// event, the packet itself included.
    pub lost: u64,

    /// Whether the packet was sent while application limited.
    pub is_app_limited: bool,
}

/// Feedback events delivered to a congestion controller.
#[derive(Debug)]
pub enum CongestionEvent<'a> {
    /// An acknowledgement was processed; runs the full per-ACK pipeline.
    Acknowledgement(&'a AckSample),

    /// A packet was declared lost by duplicate/reordering evidence.
    Repeat(&'a LostPacket),

    /// A packet was declared lost by retransmission timeout.
    Timeout(&'a LostPacket),

    /// A previously signalled repeat turned out to be spurious.
    SpuriousRepeat,

    /// ECN congestion experienced mark. Reserved.
    EcnEc,

    /// A standalone RTT measurement; subsumed by acknowledgements.
    RttMeasurement,

    /// The sender is blocked by the congestion window.
    CwinBlocked,

    /// Re-initialize the controller for this path.
    Reset,

    /// Seed the controller with a known bandwidth-delay product in bytes.
    SeedCwin(u64),
}

/// Congestion control interfaces shared by different algorithms.
pub trait CongestionController {
    /// Name of the congestion control algorithm.
    fn name(&self) -> &str;

    /// Process one feedback event for the path.
    fn notify(&mut self, path: &mut Path, event: CongestionEvent, now: Instant);

    /// Report the controller state code and its bandwidth estimate in
    /// bytes per second.
    fn observe(&self, path: &Path) -> (u64, u64);

    /// Current congestion window.
    fn congestion_window(&self) -> u64;

    /// Current pacing rate estimated by the algorithm, if any.
    fn pacing_rate(&self) -> Option<u64> {
        None
    }

    /// Initial congestion window.
    fn initial_window(&self) -> u64;

    /// Minimal congestion window.
    fn minimal_window(&self) -> u64;

    /// Check if in slow start.
    fn in_slow_start(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller.")
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &CongestionConfig) -> Box<dyn CongestionController> {
    match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::Bbr => Box::new(Bbr::new(BbrConfig::from(conf))),
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn congestion_control_name() {
        let cases = [
            ("bbr", Ok(CongestionControlAlgorithm::Bbr)),
            ("Bbr", Ok(CongestionControlAlgorithm::Bbr)),
            ("BBR", Ok(CongestionControlAlgorithm::Bbr)),
            ("cubic", Err(Error::InvalidConfig("unknown".into()))),
        ];

        for (name, algor) in cases {
            assert_eq!(CongestionControlAlgorithm::from_str(name), algor);
        }

        // Every registered algorithm identifier round-trips.
        for algor in CongestionControlAlgorithm::iter() {
            assert_eq!(CongestionControlAlgorithm::from_str(algor.name()), Ok(algor));
        }
    }

    #[test]
    fn congestion_control_build_congestion_controller() {
        let conf = CongestionConfig::default();

        let cc = build_congestion_controller(&conf);
        assert_eq!(cc.name(), "bbr");
        assert_eq!(cc.in_slow_start(), true);
        assert_eq!(
            cc.initial_window(),
            conf.initial_congestion_window * conf.max_datagram_size
        );
        assert_eq!(
            cc.minimal_window(),
            conf.min_congestion_window * conf.max_datagram_size
        );
        assert_eq!(
            cc.congestion_window(),
            cc.minimal_window().max(cc.initial_window())
        );
        assert!(cc.pacing_rate().is_some());
        assert_eq!(format!("{:?}", cc), "congestion controller.");
    }

    #[test]
    fn congestion_control_fallback_delivery_rate() {
        // 30000 bytes over 100ms is 300kB/s.
        assert_eq!(
            AckSample::fallback_delivery_rate(30_000, Duration::from_millis(100)),
            300_000
        );

        // Tiny and zero-RTT samples fall back to the conservative floor.
        assert_eq!(
            AckSample::fallback_delivery_rate(100, Duration::from_millis(100)),
            MIN_DELIVERY_RATE
        );
        assert_eq!(
            AckSample::fallback_delivery_rate(30_000, Duration::ZERO),
            MIN_DELIVERY_RATE
        );
    }
}

mod bbr;
mod hystart;
mod minmax;
mod pacing;
