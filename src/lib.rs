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

//! PathCC is a per-path congestion control library for QUIC transports.
//!
//! Each network path of a connection runs its own controller instance.
//! The transport feeds the controller with feedback events (processed
//! acknowledgements, loss indications, timeouts, spurious retransmit
//! notifications, resets) through a single [`notify`] entry point, and
//! consumes two control outputs: a congestion window and a pacing rate
//! with its burst cap.
//!
//! The library ships one production controller, BBRv3 (registered as
//! `"bbr"`), which builds an explicit model of the path from delivery
//! rate and round-trip time measurements instead of reacting to loss
//! alone. It carries two adaptations for difficult paths: an alternate,
//! Hystart-driven startup for high-RTT paths, and a smoothed loss-rate
//! signal maintained alongside the standard model.
//!
//! The transport remains responsible for RTT measurement, loss
//! detection, per-packet delivery accounting and the pacing scheduler;
//! the controller is a pure state machine driven by the samples the
//! transport hands it.
//!
//! [`notify`]: CongestionController::notify

use std::time::Duration;

pub use crate::congestion_control::build_congestion_controller;
pub use crate::congestion_control::AckSample;
pub use crate::congestion_control::Bbr;
pub use crate::congestion_control::BbrConfig;
pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::congestion_control::CongestionController;
pub use crate::congestion_control::CongestionEvent;
pub use crate::congestion_control::LostPacket;
pub use crate::congestion_control::Path;
pub use crate::error::Error;

/// A specialized [`Result`] type for congestion control operations.
///
/// [`Result`]: std::result::Result
pub type Result<T> = std::result::Result<T, Error>;

/// Default outgoing UDP datagram payload size in bytes.
pub const DEFAULT_SEND_UDP_PAYLOAD_SIZE: u64 = 1200;

/// Default initial RTT used before any sample arrives.
/// See RFC 9002 Section 6.2.2.
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Default initial congestion window in packets.
/// See RFC 9002 Section 7.2.
const INITIAL_CONGESTION_WINDOW_PACKETS: u64 = 10;

/// Default minimal congestion window in packets. Four packets keep the
/// pipeline alive against peers that follow an ACK-every-other-packet
/// delayed-ACK policy.
const MIN_CONGESTION_WINDOW_PACKETS: u64 = 4;

/// Congestion control configuration for the paths of a connection.
#[derive(Debug, Clone)]
pub struct CongestionConfig {
    /// The congestion control algorithm to build for each path.
    pub congestion_control_algorithm: CongestionControlAlgorithm,

    /// Maximum datagram size in bytes.
    pub max_datagram_size: u64,

    /// Initial congestion window in packets.
    pub initial_congestion_window: u64,

    /// Minimal congestion window in packets.
    pub min_congestion_window: u64,

    /// Initial smoothed RTT, used until the path produces samples.
    pub initial_rtt: Duration,

    /// Seed material for the per-path random stream. Mixed with the path
    /// identifier and endpoint role, so distinct paths draw distinct but
    /// reproducible streams.
    pub random_seed: u64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            congestion_control_algorithm: CongestionControlAlgorithm::default(),
            max_datagram_size: DEFAULT_SEND_UDP_PAYLOAD_SIZE,
            initial_congestion_window: INITIAL_CONGESTION_WINDOW_PACKETS,
            min_congestion_window: MIN_CONGESTION_WINDOW_PACKETS,
            initial_rtt: INITIAL_RTT,
            random_seed: 0,
        }
    }
}

impl CongestionConfig {
    /// Set the congestion control algorithm.
    pub fn set_congestion_control_algorithm(&mut self, algor: CongestionControlAlgorithm) {
        self.congestion_control_algorithm = algor;
    }

    /// Set the maximum datagram size in bytes.
    pub fn set_max_datagram_size(&mut self, size: u64) {
        self.max_datagram_size = size.max(1);
    }

    /// Set the initial congestion window in packets.
    pub fn set_initial_congestion_window(&mut self, packets: u64) {
        self.initial_congestion_window = packets;
    }

    /// Set the seed material for the per-path random stream.
    pub fn set_random_seed(&mut self, seed: u64) {
        self.random_seed = seed;
    }
}

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;
pub mod error;
