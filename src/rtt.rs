use std::time::Duration;

const SRTT_ALPHA: f64 = 0.125;
const RTTVAR_BETA: f64 = 0.25;
const RTO_K: f64 = 4.0;

/// Smoothed RTT and derived retransmission timeout along the lines of RFC 6298.
///
/// RTT samples come from ACKs of datagrams that were sent exactly once; an ACK for a resent
///  datagram is ambiguous with regard to which transmission it acknowledges (Karn's rule).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_millis: f64,
    rttvar_millis: f64,
    rto: Duration,
    initialized: bool,

    granularity: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration, granularity: Duration) -> RttEstimator {
        RttEstimator {
            srtt_millis: 0.0,
            rttvar_millis: 0.0,
            rto: initial_rto.clamp(min_rto, max_rto),
            initialized: false,
            granularity,
            min_rto,
            max_rto,
        }
    }

    pub fn on_sample(&mut self, sample: Duration) {
        let sample_millis = sample.as_secs_f64() * 1000.0;

        if self.initialized {
            self.rttvar_millis = (1.0 - RTTVAR_BETA) * self.rttvar_millis + RTTVAR_BETA * (self.srtt_millis - sample_millis).abs();
            self.srtt_millis = (1.0 - SRTT_ALPHA) * self.srtt_millis + SRTT_ALPHA * sample_millis;
        }
        else {
            self.srtt_millis = sample_millis;
            self.rttvar_millis = sample_millis / 2.0;
            self.initialized = true;
        }

        let granularity_millis = self.granularity.as_secs_f64() * 1000.0;
        let rto_millis = self.srtt_millis + f64::max(granularity_millis, RTO_K * self.rttvar_millis);
        self.rto = millis_to_duration(rto_millis)
            .clamp(self.min_rto, self.max_rto);
    }

    /// doubles the RTO after a retransmission timeout, see RFC 6298 section 5.5
    pub fn on_timeout(&mut self) {
        self.rto = self.rto.saturating_mul(2)
            .min(self.max_rto);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        if self.initialized {
            Some(millis_to_duration(self.srtt_millis))
        }
        else {
            None
        }
    }
}

fn millis_to_duration(millis: f64) -> Duration {
    Duration::from_micros((millis * 1000.0).round() as u64)
}

/// Latency as measured by application-level pings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStats {
    pub last: Option<Duration>,
    pub lowest: Option<Duration>,
    pub highest: Option<Duration>,
    total: Duration,
    num_samples: u32,
}

impl LatencyStats {
    pub fn record(&mut self, latency: Duration) {
        self.last = Some(latency);
        self.lowest = Some(self.lowest.map_or(latency, |l| l.min(latency)));
        self.highest = Some(self.highest.map_or(latency, |h| h.max(latency)));
        self.total = self.total.saturating_add(latency);
        self.num_samples = self.num_samples.saturating_add(1);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.num_samples == 0 {
            None
        }
        else {
            Some(self.total / self.num_samples)
        }
    }

    pub fn num_samples(&self) -> u32 {
        self.num_samples
    }
}
