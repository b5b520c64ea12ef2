//! Frame pacing for the camera pipeline.
//!
//! Every `DoFrame` that reaches the render thread is run through
//! [`FrameScheduler::schedule`], which answers one question: is this frame
//! still worth starting? Frames that are already further behind than the
//! display budget are dropped and counted. Rendered frames feed a fixed-size
//! throughput window and a delta-time integrator that keeps time-dependent
//! filters from jumping forward after a pause.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use camconfig::DisplayConfig;

/// Rendered frames per throughput window.
pub const FPS_WINDOW_FRAMES: u32 = 120;
/// Frame intervals above this are treated as a pause rather than a step.
pub const MAX_FRAME_INTERVAL_NANOS: u64 = 1_000_000_000;
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_nanos(16_666_667);
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(2);

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("refresh period must be non-zero")]
    ZeroRefreshPeriod,
    #[error("safety margin {margin:?} must be shorter than the refresh period {period:?}")]
    MarginExceedsPeriod { margin: Duration, period: Duration },
}

/// Monotonic nanosecond source shared by the camera bridge and the render
/// thread so frame timestamps and `now` agree on an origin.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to. Used for replaying timestamps and in
/// tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self {
            now: AtomicU64::new(start_nanos),
        }
    }

    pub fn set(&self, nanos: u64) {
        self.now.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, step: Duration) {
        let step = u64::try_from(step.as_nanos()).unwrap_or(u64::MAX);
        self.now.fetch_add(step, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    refresh_period: Duration,
    safety_margin: Duration,
}

impl PacingPolicy {
    pub fn new(refresh_period: Duration, safety_margin: Duration) -> Result<Self, SchedulerError> {
        if refresh_period.is_zero() {
            return Err(SchedulerError::ZeroRefreshPeriod);
        }
        if safety_margin >= refresh_period {
            return Err(SchedulerError::MarginExceedsPeriod {
                margin: safety_margin,
                period: refresh_period,
            });
        }
        Ok(Self {
            refresh_period,
            safety_margin,
        })
    }

    pub fn from_display(config: &DisplayConfig) -> Result<Self, SchedulerError> {
        Self::new(config.refresh_period(), config.safety_margin)
    }

    pub fn refresh_period(&self) -> Duration {
        self.refresh_period
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    /// Largest lag at which a frame is still started.
    pub fn budget_nanos(&self) -> u64 {
        let budget = self.refresh_period - self.safety_margin;
        u64::try_from(budget.as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            refresh_period: DEFAULT_REFRESH_PERIOD,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    Render,
    Drop { lag_nanos: u64 },
}

/// Running delta-time integrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaIntegrator {
    previous: Option<u64>,
    elapsed_nanos: u64,
    last_interval: u64,
}

impl DeltaIntegrator {
    /// Advances to `timestamp` and returns the interval since the previous
    /// call. The first call, a timestamp that moved backwards, and any gap
    /// above [`MAX_FRAME_INTERVAL_NANOS`] all rebase on `timestamp` and yield 0.
    pub fn advance(&mut self, timestamp: u64) -> u64 {
        let interval = match self.previous {
            Some(previous) if timestamp >= previous => timestamp - previous,
            _ => 0,
        };
        let interval = if interval > MAX_FRAME_INTERVAL_NANOS {
            0
        } else {
            interval
        };
        self.previous = Some(timestamp);
        self.elapsed_nanos = self.elapsed_nanos.saturating_add(interval);
        self.last_interval = interval;
        interval
    }

    pub fn last_interval_nanos(&self) -> u64 {
        self.last_interval
    }

    pub fn elapsed_nanos(&self) -> u64 {
        self.elapsed_nanos
    }

    pub fn elapsed_secs(&self) -> f32 {
        (self.elapsed_nanos as f64 / NANOS_PER_SECOND) as f32
    }
}

/// Rolling throughput counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    frames_in_window: u32,
    window_start: Option<u64>,
    dropped: u64,
    rendered: u64,
    last_fps: Option<f64>,
}

impl FrameStats {
    /// Counts a presented frame. Returns the new estimate when this frame
    /// closes a window.
    pub fn record_rendered(&mut self, timestamp: u64) -> Option<f64> {
        self.rendered += 1;
        let Some(start) = self.window_start else {
            self.window_start = Some(timestamp);
            self.frames_in_window = 0;
            return None;
        };

        self.frames_in_window += 1;
        if self.frames_in_window < FPS_WINDOW_FRAMES {
            return None;
        }

        let elapsed = timestamp.saturating_sub(start);
        self.window_start = Some(timestamp);
        self.frames_in_window = 0;
        if elapsed == 0 {
            return None;
        }
        let fps = f64::from(FPS_WINDOW_FRAMES) * NANOS_PER_SECOND / elapsed as f64;
        self.last_fps = Some(fps);
        Some(fps)
    }

    pub fn record_dropped(&mut self) {
        self.dropped += 1;
    }

    pub fn frames_in_window(&self) -> u32 {
        self.frames_in_window
    }

    pub fn window_start(&self) -> Option<u64> {
        self.window_start
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }

    pub fn last_fps(&self) -> Option<f64> {
        self.last_fps
    }
}

/// Time values handed to filter stages for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameTiming {
    pub timestamp: u64,
    pub interval_nanos: u64,
    pub elapsed_secs: f32,
    pub frame_index: u64,
}

impl FrameTiming {
    pub fn interval_secs(&self) -> f32 {
        (self.interval_nanos as f64 / NANOS_PER_SECOND) as f32
    }
}

#[derive(Debug, Clone)]
pub struct FrameScheduler {
    policy: PacingPolicy,
    stats: FrameStats,
    integrator: DeltaIntegrator,
}

impl FrameScheduler {
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            policy,
            stats: FrameStats::default(),
            integrator: DeltaIntegrator::default(),
        }
    }

    pub fn policy(&self) -> &PacingPolicy {
        &self.policy
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Decides whether the frame stamped `timestamp` should be started at
    /// `now`. The integrator advances for every frame, dropped or not.
    pub fn schedule(&mut self, timestamp: u64, now: u64) -> FrameDecision {
        self.integrator.advance(timestamp);
        let decision = self.decide(timestamp, now);
        if let FrameDecision::Drop { .. } = decision {
            self.stats.record_dropped();
        }
        decision
    }

    fn decide(&self, timestamp: u64, now: u64) -> FrameDecision {
        let lag = now.saturating_sub(timestamp);
        if lag > self.policy.budget_nanos() {
            FrameDecision::Drop { lag_nanos: lag }
        } else {
            FrameDecision::Render
        }
    }

    /// Timing snapshot for the frame most recently passed to `schedule`.
    pub fn timing(&self, timestamp: u64) -> FrameTiming {
        FrameTiming {
            timestamp,
            interval_nanos: self.integrator.last_interval_nanos(),
            elapsed_secs: self.integrator.elapsed_secs(),
            frame_index: self.stats.rendered(),
        }
    }

    pub fn record_rendered(&mut self, timestamp: u64) -> Option<f64> {
        self.stats.record_rendered(timestamp)
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new(PacingPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFRESH: Duration = Duration::from_nanos(16_666_667);

    fn scheduler() -> FrameScheduler {
        FrameScheduler::new(PacingPolicy::new(REFRESH, Duration::from_millis(2)).unwrap())
    }

    #[test]
    fn budget_subtracts_margin() {
        let policy = PacingPolicy::new(REFRESH, Duration::from_millis(2)).unwrap();
        assert_eq!(policy.budget_nanos(), 14_666_667);
    }

    #[test]
    fn drops_frames_behind_budget() {
        let mut scheduler = scheduler();
        let timestamp = 5_000_000_000;
        let decision = scheduler.schedule(timestamp, timestamp + 15_000_000);
        assert_eq!(
            decision,
            FrameDecision::Drop {
                lag_nanos: 15_000_000
            }
        );
        assert_eq!(scheduler.stats().dropped(), 1);
    }

    #[test]
    fn renders_frames_within_budget() {
        let mut scheduler = scheduler();
        let timestamp = 5_000_000_000;
        let decision = scheduler.schedule(timestamp, timestamp + 10_000_000);
        assert_eq!(decision, FrameDecision::Render);
        assert_eq!(scheduler.stats().dropped(), 0);
    }

    #[test]
    fn lag_equal_to_budget_still_renders() {
        let mut scheduler = scheduler();
        let decision = scheduler.schedule(0, 14_666_667);
        assert_eq!(decision, FrameDecision::Render);
    }

    #[test]
    fn future_timestamps_are_not_late() {
        let mut scheduler = scheduler();
        let decision = scheduler.schedule(1_000_000, 0);
        assert_eq!(decision, FrameDecision::Render);
    }

    #[test]
    fn reports_fps_after_full_window() {
        let mut stats = FrameStats::default();
        let start = 3_000_000_000u64;
        assert_eq!(stats.record_rendered(start), None);
        for frame in 1..FPS_WINDOW_FRAMES as u64 {
            let timestamp = start + frame * 2_000_000_000 / 120;
            assert_eq!(stats.record_rendered(timestamp), None, "frame {frame}");
        }
        let fps = stats.record_rendered(start + 2_000_000_000).unwrap();
        assert_eq!(fps, 60.0);
        assert_eq!(stats.frames_in_window(), 0);
        assert_eq!(stats.window_start(), Some(start + 2_000_000_000));
    }

    #[test]
    fn window_restarts_after_report() {
        let mut stats = FrameStats::default();
        stats.record_rendered(0);
        for frame in 1..=120u64 {
            stats.record_rendered(frame * 10_000_000);
        }
        let restart = 1_200_000_000u64;
        for frame in 1..120u64 {
            assert_eq!(stats.record_rendered(restart + frame * 1_000_000), None);
        }
        let fps = stats.record_rendered(restart + 1_000_000_000).unwrap();
        assert!((fps - 120.0).abs() < f64::EPSILON);
        assert_eq!(stats.last_fps(), Some(fps));
    }

    #[test]
    fn dropped_frames_do_not_count_towards_window() {
        let mut scheduler = scheduler();
        assert_eq!(scheduler.schedule(0, 0), FrameDecision::Render);
        scheduler.record_rendered(0);
        assert!(matches!(
            scheduler.schedule(10, 100_000_000),
            FrameDecision::Drop { .. }
        ));
        assert_eq!(scheduler.stats().frames_in_window(), 0);
        assert_eq!(scheduler.stats().rendered(), 1);
    }

    #[test]
    fn integrator_resets_after_long_gap() {
        let mut integrator = DeltaIntegrator::default();
        assert_eq!(integrator.advance(1_000_000_000), 0);
        assert_eq!(integrator.advance(1_016_000_000), 16_000_000);
        assert_eq!(integrator.advance(2_516_000_000), 0);
        assert_eq!(integrator.advance(2_532_000_000), 16_000_000);
        assert_eq!(integrator.elapsed_nanos(), 32_000_000);
    }

    #[test]
    fn integrator_keeps_exactly_one_second() {
        let mut integrator = DeltaIntegrator::default();
        integrator.advance(0);
        assert_eq!(integrator.advance(1_000_000_000), 1_000_000_000);
    }

    #[test]
    fn integrator_rebases_on_backwards_time() {
        let mut integrator = DeltaIntegrator::default();
        integrator.advance(500);
        assert_eq!(integrator.advance(100), 0);
        assert_eq!(integrator.advance(300), 200);
    }

    #[test]
    fn timing_reflects_integrator() {
        let mut scheduler = scheduler();
        scheduler.schedule(0, 0);
        scheduler.record_rendered(0);
        scheduler.schedule(20_000_000, 20_000_000);
        let timing = scheduler.timing(20_000_000);
        assert_eq!(timing.interval_nanos, 20_000_000);
        assert_eq!(timing.frame_index, 1);
        assert!((timing.elapsed_secs - 0.02).abs() < 1e-6);
    }

    #[test]
    fn rejects_margin_longer_than_period() {
        let err = PacingPolicy::new(Duration::from_millis(2), Duration::from_millis(2))
            .expect_err("margin must be shorter");
        assert!(matches!(err, SchedulerError::MarginExceedsPeriod { .. }));
        assert!(matches!(
            PacingPolicy::new(Duration::ZERO, Duration::ZERO),
            Err(SchedulerError::ZeroRefreshPeriod)
        ));
    }

    #[test]
    fn policy_from_display_config() {
        let config = camconfig::PipelineConfig::from_toml_str(
            r#"
[display]
refresh_hz = 120
safety_margin = "1ms"
"#,
        )
        .unwrap();
        let policy = PacingPolicy::from_display(&config.display).unwrap();
        assert_eq!(policy.refresh_period(), Duration::from_nanos(8_333_333));
        assert_eq!(policy.budget_nanos(), 7_333_333);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(10);
        clock.advance(Duration::from_nanos(5));
        assert_eq!(clock.now_nanos(), 15);
        clock.set(3);
        assert_eq!(clock.now_nanos(), 3);
    }
}
