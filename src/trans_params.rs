// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std::time::Duration;

use rand::Rng;

/// [CoAP transmission parameters][tp] governing retransmission, exchange
/// lifetime, and multicast leisure.
///
/// The defaults are the values recommended by [IETF-RFC7252 Section 4.8].
///
/// [tp]: https://tools.ietf.org/html/rfc7252#section-4.8
/// [IETF-RFC7252 Section 4.8]: https://tools.ietf.org/html/rfc7252#section-4.8
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TransParams {
    /// `ACK_TIMEOUT`: the initial retransmission timeout. Default 2 seconds.
    pub ack_timeout: Duration,

    /// `ACK_RANDOM_FACTOR`: jitter factor applied to the initial timeout.
    /// Default 1.5.
    pub ack_random_factor: f32,

    /// `MAX_RETRANSMIT`: how many times a confirmable message is resent
    /// before it is declared timed out. Default 4.
    pub max_retransmit: u32,

    /// `NSTART`: the number of simultaneous outstanding confirmable
    /// interactions to a given peer. Default 1.
    pub nstart: u32,

    /// `DEFAULT_LEISURE`: upper bound of the random delay applied to
    /// responses to multicast requests. Default 10 seconds.
    pub default_leisure: Duration,

    /// `MAX_LATENCY`: the maximum time a datagram is expected to take from
    /// the start of its transmission to the completion of its reception.
    /// Default 100 seconds.
    pub max_latency: Duration,

    /// The largest payload carried in a single message before the block
    /// layer segments it. Default 1024 bytes.
    pub max_payload: usize,

    /// How long `send_message` waits for a response when the caller does not
    /// supply a timeout. Default 20 seconds.
    pub response_timeout: Duration,
}

impl Default for TransParams {
    fn default() -> Self {
        TransParams {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            default_leisure: Duration::from_secs(10),
            max_latency: Duration::from_secs(100),
            max_payload: 1024,
            response_timeout: Duration::from_secs(20),
        }
    }
}

impl TransParams {
    /// `PROCESSING_DELAY`: the time a node takes to turn a confirmable
    /// message into an acknowledgement. Set equal to `ACK_TIMEOUT`.
    pub fn processing_delay(&self) -> Duration {
        self.ack_timeout
    }

    /// `MAX_TRANSMIT_SPAN`: the maximum time from the first transmission of
    /// a confirmable message to its last retransmission.
    ///
    /// `ACK_TIMEOUT * ((2 ** MAX_RETRANSMIT) - 1) * ACK_RANDOM_FACTOR`,
    /// or 45 seconds with the default parameters.
    pub fn max_transmit_span(&self) -> Duration {
        let millis = self.ack_timeout.as_millis() as f32
            * ((1u64 << self.max_retransmit) - 1) as f32
            * self.ack_random_factor;
        Duration::from_millis(millis as u64)
    }

    /// `MAX_TRANSMIT_WAIT`: the maximum time from the first transmission of
    /// a confirmable message to the time when the sender gives up.
    ///
    /// `ACK_TIMEOUT * ((2 ** (MAX_RETRANSMIT + 1)) - 1) * ACK_RANDOM_FACTOR`,
    /// or 93 seconds with the default parameters.
    pub fn max_transmit_wait(&self) -> Duration {
        let millis = self.ack_timeout.as_millis() as f32
            * ((1u64 << (self.max_retransmit + 1)) - 1) as f32
            * self.ack_random_factor;
        Duration::from_millis(millis as u64)
    }

    /// `EXCHANGE_LIFETIME`: how long message-layer state about an exchange
    /// must be retained.
    ///
    /// `MAX_TRANSMIT_SPAN + (2 * MAX_LATENCY) + PROCESSING_DELAY`,
    /// or 247 seconds with the default parameters.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + 2 * self.max_latency + self.processing_delay()
    }

    /// Draws the initial retransmission delay uniformly from
    /// `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]`.
    pub fn initial_retransmit_delay(&self) -> Duration {
        let low = self.ack_timeout.as_millis() as u64;
        let high = (low as f32 * self.ack_random_factor) as u64;
        if high <= low {
            return self.ack_timeout;
        }
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    /// Draws the multicast response delay uniformly from
    /// `[0, DEFAULT_LEISURE]`.
    pub fn leisure_delay(&self) -> Duration {
        let high = self.default_leisure.as_millis() as u64;
        if high == 0 {
            return Duration::from_millis(0);
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_defaults() {
        let params = TransParams::default();
        assert_eq!(params.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(params.max_transmit_wait(), Duration::from_secs(93));
        assert_eq!(params.exchange_lifetime(), Duration::from_secs(247));
    }

    #[test]
    fn retransmit_delay_within_bounds() {
        let params = TransParams::default();
        for _ in 0..100 {
            let delay = params.initial_retransmit_delay();
            assert!(delay >= params.ack_timeout);
            assert!(delay <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn leisure_within_bounds() {
        let params = TransParams::default();
        for _ in 0..100 {
            assert!(params.leisure_delay() <= params.default_leisure);
        }
    }
}
