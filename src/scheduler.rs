//! Downlink scheduler. One instance per Connection, owning the emission
//! timeline of a single gateway. Every check — dwell time, duty cycle,
//! overlap, time-sanity — and the final insertion run under `ring`'s mutex,
//! so no two emissions on the same gateway can be admitted concurrently,
//! without any cross-gateway lock.

use crate::error::{Error, PathError, ScheduleError};
use crate::message::{Class, DownlinkPath, DownlinkRequest, ScheduledDownlink, TxSettings};
use crate::token::TokenMinter;
use gs_core::{time_on_air, CodingRate, Direction, FrequencyPlan, RxWindowParams};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Downlinks on LoRaWAN always use the mandatory coding rate.
const DOWNLINK_CODING_RATE: CodingRate = CodingRate::Cr4_5;

/// Standard ETSI-style duty-cycle observation window.
const DEFAULT_DUTY_CYCLE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub schedule_late_time: Duration,
    pub schedule_any_time_delay: Duration,
    pub duty_cycle_window: Duration,
    /// How far back the emission ring keeps entries for overlap/duty-cycle
    /// accounting; entries older than `now - horizon` are pruned lazily.
    pub emission_ring_horizon: Duration,
    pub token_freshness: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_late_time: Duration::from_millis(200),
            schedule_any_time_delay: Duration::from_millis(50),
            duty_cycle_window: DEFAULT_DUTY_CYCLE_WINDOW,
            emission_ring_horizon: DEFAULT_DUTY_CYCLE_WINDOW,
            token_freshness: Duration::from_secs(30),
        }
    }
}

/// Per-Rx-window rejection cause. `AlreadyExists`/`FailedPrecondition`/
/// `ResourceExhausted` name the same error kinds surfaced at the top level,
/// scoped down to one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    AlreadyExists,
    FailedPrecondition(&'static str),
    ResourceExhausted,
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowError::AlreadyExists => write!(f, "AlreadyExists"),
            WindowError::FailedPrecondition(reason) => write!(f, "FailedPrecondition({reason})"),
            WindowError::ResourceExhausted => write!(f, "ResourceExhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Emission {
    starts_at: SystemTime,
    ends_at: SystemTime,
    frequency_hz: u32,
}

/// Per-gateway downlink scheduler. Cheap to construct; the mutex-protected
/// ring is the only shared state.
pub struct GatewayScheduler {
    frequency_plan: Arc<FrequencyPlan>,
    config: SchedulerConfig,
    ring: Mutex<Vec<Emission>>,
}

impl GatewayScheduler {
    pub fn new(frequency_plan: Arc<FrequencyPlan>, config: SchedulerConfig) -> Self {
        Self { frequency_plan, config, ring: Mutex::new(Vec::new()) }
    }

    pub async fn schedule(
        &self,
        request: &DownlinkRequest,
        token_minter: &TokenMinter,
    ) -> Result<ScheduledDownlink, Error> {
        self.schedule_at(request, token_minter, SystemTime::now()).await
    }

    /// Clock-injected variant so tests can control `now` deterministically.
    pub async fn schedule_at(
        &self,
        request: &DownlinkRequest,
        token_minter: &TokenMinter,
        now: SystemTime,
    ) -> Result<ScheduledDownlink, Error> {
        let mut path_errors = Vec::new();
        for path in &request.paths {
            match self.try_path(request, path, token_minter, now).await {
                Ok(scheduled) => return Ok(scheduled),
                Err(path_error) => path_errors.push(path_error),
            }
        }
        Err(Error::Aborted(ScheduleError { path_errors }))
    }

    async fn try_path(
        &self,
        request: &DownlinkRequest,
        path: &DownlinkPath,
        token_minter: &TokenMinter,
        now: SystemTime,
    ) -> Result<ScheduledDownlink, PathError> {
        let gateway = path.gateway().clone();
        let candidates = match self.candidate_windows(request, path, token_minter, now) {
            Ok(candidates) => candidates,
            Err(reason) => {
                return Err(PathError {
                    gateway,
                    windows: vec![("path", WindowError::FailedPrecondition(reason))],
                })
            }
        };

        let mut windows = Vec::new();
        for (label, candidate) in candidates {
            let candidate = match candidate {
                Some(c) => c,
                None => {
                    windows.push((label, WindowError::FailedPrecondition("window not supplied")));
                    continue;
                }
            };
            match self.admit(request, candidate, now).await {
                Ok(scheduled) => return Ok(scheduled),
                Err(err) => windows.push((label, err)),
            }
        }
        Err(PathError { gateway, windows })
    }

    /// Builds the ordered list of (label, candidate) windows to attempt for
    /// this request's class.
    fn candidate_windows(
        &self,
        request: &DownlinkRequest,
        path: &DownlinkPath,
        token_minter: &TokenMinter,
        now: SystemTime,
    ) -> Result<Vec<(&'static str, Option<Candidate>)>, &'static str> {
        if let Some(absolute_time) = request.absolute_time {
            let params = request.rx1.or(request.rx2).ok_or("no rx parameters for absolute-time request")?;
            return Ok(vec![("absolute", Some(Candidate { starts_at: absolute_time, params }))]);
        }

        match request.class {
            Class::A => {
                let token = match path {
                    DownlinkPath::Uplink { token, .. } => token,
                    DownlinkPath::Fixed { .. } => return Err("class A requires an uplink-token path"),
                };
                let (_gateway_ts, received_at) =
                    token_minter.verify(token, self.config.token_freshness).map_err(|_| "stale or foreign uplink token")?;
                let rx1_delay = Duration::from_secs(request.rx1_delay_secs as u64);
                let rx1_at = received_at + rx1_delay;
                let rx2_at = received_at + rx1_delay + Duration::from_secs(1);
                Ok(vec![
                    ("rx1", request.rx1.map(|params| Candidate { starts_at: rx1_at, params })),
                    ("rx2", request.rx2.map(|params| Candidate { starts_at: rx2_at, params })),
                ])
            }
            Class::B => {
                if !matches!(path, DownlinkPath::Fixed { .. }) {
                    return Err("class B requires a fixed path");
                }
                let absolute_time = request.absolute_time.ok_or("class B requires an absolute time aligned to the beacon schedule")?;
                let params = request.rx2.or(request.rx1).ok_or("no rx parameters for class B request")?;
                Ok(vec![("beacon", Some(Candidate { starts_at: absolute_time, params }))])
            }
            Class::C => {
                if !matches!(path, DownlinkPath::Fixed { .. }) {
                    return Err("class C requires a fixed path");
                }
                let params = request.rx1.or(request.rx2).ok_or("no rx parameters for class C request")?;
                let starts_at = now + self.config.schedule_late_time;
                Ok(vec![("now", Some(Candidate { starts_at, params }))])
            }
        }
    }

    async fn admit(&self, request: &DownlinkRequest, candidate: Candidate, now: SystemTime) -> Result<ScheduledDownlink, WindowError> {
        let modulation = self
            .frequency_plan
            .modulation_for(candidate.params.data_rate)
            .ok_or(WindowError::FailedPrecondition("unknown data rate index"))?;
        let toa = time_on_air(modulation, DOWNLINK_CODING_RATE, request.raw_payload.len() as u32);
        let ends_at = candidate.starts_at + toa + self.config.schedule_any_time_delay;

        let dwell_limit = self.frequency_plan.dwell_limit(Direction::Downlink);
        if dwell_limit > Duration::ZERO && toa > dwell_limit {
            return Err(WindowError::FailedPrecondition("dwell time exceeds band limit"));
        }

        let mut ring = self.ring.lock().await;
        prune(&mut ring, now, self.config.emission_ring_horizon);

        if let Some(limit) = self.frequency_plan.duty_cycle_limit(candidate.params.frequency_hz) {
            let window_start = now.checked_sub(self.config.duty_cycle_window).unwrap_or(SystemTime::UNIX_EPOCH);
            let used: Duration = ring
                .iter()
                .filter(|e| e.starts_at >= window_start && same_sub_band(&self.frequency_plan, e.frequency_hz, candidate.params.frequency_hz))
                .map(|e| e.ends_at.duration_since(e.starts_at).unwrap_or_default())
                .sum();
            let budget = self.config.duty_cycle_window.mul_f64(limit);
            if used + toa > budget {
                return Err(WindowError::ResourceExhausted);
            }
        }

        if ring.iter().any(|e| overlaps(e.starts_at, e.ends_at, candidate.starts_at, ends_at)) {
            return Err(WindowError::AlreadyExists);
        }

        if candidate.starts_at < now + self.config.schedule_late_time {
            return Err(WindowError::FailedPrecondition("starts_at too close to now"));
        }

        ring.push(Emission { starts_at: candidate.starts_at, ends_at, frequency_hz: candidate.params.frequency_hz });

        Ok(ScheduledDownlink {
            raw_payload: request.raw_payload.clone(),
            settings: TxSettings {
                modulation,
                coding_rate: DOWNLINK_CODING_RATE,
                frequency_hz: candidate.params.frequency_hz,
                gateway_timestamp_us: 0,
            },
            tx_power_dbm: self.frequency_plan.max_eirp_dbm,
            starts_at: candidate.starts_at,
            ends_at,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    starts_at: SystemTime,
    params: RxWindowParams,
}

fn prune(ring: &mut Vec<Emission>, now: SystemTime, horizon: Duration) {
    let cutoff = now.checked_sub(horizon).unwrap_or(SystemTime::UNIX_EPOCH);
    ring.retain(|e| e.ends_at >= cutoff);
}

fn overlaps(a_start: SystemTime, a_end: SystemTime, b_start: SystemTime, b_end: SystemTime) -> bool {
    a_start < b_end && b_start < a_end
}

fn same_sub_band(plan: &FrequencyPlan, a_hz: u32, b_hz: u32) -> bool {
    match (plan.sub_band_for(a_hz), plan.sub_band_for(b_hz)) {
        (Some(a), Some(b)) => a.lo_hz == b.lo_hz && a.hi_hz == b.hi_hz,
        _ => a_hz == b_hz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DownlinkPath;
    use gs_core::frequency_plan::eu_863_870;

    fn plan() -> Arc<FrequencyPlan> {
        Arc::new(eu_863_870())
    }

    fn request(paths: Vec<DownlinkPath>, rx1: Option<RxWindowParams>, rx2: Option<RxWindowParams>) -> DownlinkRequest {
        DownlinkRequest {
            class: Class::A,
            paths,
            raw_payload: vec![0u8; 20],
            priority: 0,
            rx1_delay_secs: 1,
            rx1,
            rx2,
            absolute_time: None,
            frequency_plan_id: None,
        }
    }

    #[tokio::test]
    async fn second_class_a_conflict_reports_already_exists_then_failed_precondition() {
        let scheduler = GatewayScheduler::new(plan(), SchedulerConfig::default());
        let minter = TokenMinter::new();
        let now = SystemTime::now();
        let received_at = now - Duration::from_millis(500);
        let token = minter.mint(&[0], 10_000_000, received_at);
        let gw = crate::message::GatewayIdentity::Id("gw-1".into());

        let rx1 = RxWindowParams { data_rate: 5, frequency_hz: 868_100_000 };
        let first = request(
            vec![DownlinkPath::Uplink { gateway: gw.clone(), token: token.clone() }],
            Some(rx1),
            None,
        );
        let scheduled = scheduler.schedule_at(&first, &minter, now).await;
        assert!(scheduled.is_ok(), "{scheduled:?}");

        let second = request(vec![DownlinkPath::Uplink { gateway: gw, token }], Some(rx1), None);
        let err = scheduler.schedule_at(&second, &minter, now).await.unwrap_err();
        match err {
            Error::Aborted(schedule_error) => {
                assert_eq!(schedule_error.path_errors.len(), 1);
                let windows = &schedule_error.path_errors[0].windows;
                assert_eq!(windows[0], ("rx1", WindowError::AlreadyExists));
                assert_eq!(windows[1].0, "rx2");
                assert!(matches!(windows[1].1, WindowError::FailedPrecondition(_)));
            }
            other => panic!("expected Aborted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn admitted_intervals_are_pairwise_disjoint() {
        let scheduler = GatewayScheduler::new(plan(), SchedulerConfig::default());
        let minter = TokenMinter::new();
        let now = SystemTime::now();
        let gw = crate::message::GatewayIdentity::Id("gw-1".into());
        let rx1 = RxWindowParams { data_rate: 5, frequency_hz: 868_100_000 };

        let mut scheduled = Vec::new();
        for i in 0..3u32 {
            let received_at = now - Duration::from_millis(500) + Duration::from_micros(i as u64);
            let token = minter.mint(&[0], 10_000_000 + i * 1_000_000, received_at);
            let req = request(vec![DownlinkPath::Uplink { gateway: gw.clone(), token }], Some(rx1), None);
            let result = scheduler.schedule_at(&req, &minter, now).await.unwrap();
            scheduled.push(result);
        }
        for i in 0..scheduled.len() {
            for j in 0..scheduled.len() {
                if i == j {
                    continue;
                }
                assert!(!overlaps(scheduled[i].starts_at, scheduled[i].ends_at, scheduled[j].starts_at, scheduled[j].ends_at));
            }
        }
    }

    #[tokio::test]
    async fn class_c_on_fixed_path_schedules_near_now() {
        let scheduler = GatewayScheduler::new(plan(), SchedulerConfig::default());
        let minter = TokenMinter::new();
        let now = SystemTime::now();
        let gw = crate::message::GatewayIdentity::Id("gw-2".into());
        let mut req = request(
            vec![DownlinkPath::Fixed { gateway: gw, antenna_ids: vec![0] }],
            Some(RxWindowParams { data_rate: 5, frequency_hz: 868_300_000 }),
            None,
        );
        req.class = Class::C;
        let scheduled = scheduler.schedule_at(&req, &minter, now).await.unwrap();
        assert!(scheduled.starts_at >= now);
    }

    #[tokio::test]
    async fn duty_cycle_budget_is_enforced() {
        let config = SchedulerConfig { duty_cycle_window: Duration::from_secs(10), ..SchedulerConfig::default() };
        let scheduler = GatewayScheduler::new(plan(), config);
        let minter = TokenMinter::new();
        let now = SystemTime::now();
        let gw = crate::message::GatewayIdentity::Id("gw-3".into());
        // g3 sub-band (869.4-869.65 MHz) allows 10% duty cycle -> 1s budget
        // in a 10s window. A handful of ~60ms emissions should exhaust it.
        let rx1 = RxWindowParams { data_rate: 5, frequency_hz: 869_525_000 };
        let mut last_err = None;
        for i in 0..30u32 {
            let received_at = now - Duration::from_millis(500) + Duration::from_micros(i as u64);
            let token = minter.mint(&[0], 10_000_000 + i, received_at);
            let req = request(vec![DownlinkPath::Uplink { gateway: gw.clone(), token }], Some(rx1), None);
            match scheduler.schedule_at(&req, &minter, now).await {
                Ok(_) => {}
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }
        assert!(last_err.is_some(), "expected duty-cycle budget to eventually reject");
    }
}
