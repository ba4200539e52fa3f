use std::{collections::VecDeque, fmt, time::Duration};
use tracing::{debug, info};

use crate::{
    config::ControllerConfig,
    types::{ZoneBounds, ZonePosition},
};

/// Direction of a power adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Heart rate was below the zone
    Increase,
    /// Heart rate was above the zone
    Decrease,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Increase => write!(f, "increase"),
            Self::Decrease => write!(f, "decrease"),
        }
    }
}

/// One applied change of the commanded power
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    /// Commanded power before the change
    pub from: u16,
    /// Commanded power after the change
    pub to: u16,
    /// Which way the controller moved
    pub direction: Direction,
    /// Session time of the change
    pub at: Duration,
}

/// Discrete, rate-limited heart-rate zone controller
///
/// Each sampling tick feeds one heart-rate value through [`ZoneController::evaluate`]:
///
/// 1. Zero or missing samples are skipped without touching the buffer.
/// 2. The sample enters a FIFO buffer of `smoothing_window` values.
/// 3. Nothing is decided during warm-up or while the buffer is filling.
/// 4. The buffer mean is compared against the zone. Inside the zone nothing
///    changes and the zone is marked as reached.
/// 5. Below the zone nothing changes until the zone has been reached once.
/// 6. A cooldown must have passed since the last adjustment; it is longer after
///    a decrease than after an increase.
/// 7. Power moves by one step, clamped to `target ± max_drift` and the floor.
#[derive(Debug, Clone)]
pub struct ZoneController {
    config: ControllerConfig,
    zone: ZoneBounds,
    target_power: u16,
    adjusted_power: u16,
    buffer: VecDeque<u16>,
    last_adjustment: Option<(Duration, Direction)>,
    zone_reached: bool,
}

impl ZoneController {
    /// Create a controller commanding `target_power` until it first adjusts
    #[must_use]
    pub fn new(config: ControllerConfig, zone: ZoneBounds, target_power: u16) -> Self {
        let capacity = config.smoothing_window.max(1);
        Self {
            config,
            zone,
            target_power,
            adjusted_power: target_power,
            buffer: VecDeque::with_capacity(capacity),
            last_adjustment: None,
            zone_reached: false,
        }
    }

    /// Power the controller currently commands
    #[must_use]
    pub const fn adjusted_power(&self) -> u16 {
        self.adjusted_power
    }

    /// Configured target power
    #[must_use]
    pub const fn target_power(&self) -> u16 {
        self.target_power
    }

    /// Whether the smoothed heart rate has been inside the zone this session
    #[must_use]
    pub const fn zone_reached(&self) -> bool {
        self.zone_reached
    }

    /// Number of buffered samples
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Mean of the buffer, once it is full
    #[must_use]
    pub fn smoothed_heart_rate(&self) -> Option<f64> {
        let window = self.config.smoothing_window.max(1);
        if self.buffer.len() < window {
            return None;
        }
        let sum: u32 = self.buffer.iter().copied().map(u32::from).sum();
        #[allow(clippy::cast_precision_loss)]
        let len = self.buffer.len() as f64;
        Some(f64::from(sum) / len)
    }

    /// Last adjustment time and direction
    #[must_use]
    pub const fn last_adjustment(&self) -> Option<(Duration, Direction)> {
        self.last_adjustment
    }

    /// Run one tick
    ///
    /// Returns the adjustment to push to the trainer, if any.
    pub fn evaluate(&mut self, heart_rate: Option<u16>, elapsed: Duration) -> Option<Adjustment> {
        let bpm = heart_rate.filter(|bpm| *bpm > 0)?;

        let window = self.config.smoothing_window.max(1);
        self.buffer.push_back(bpm);
        while self.buffer.len() > window {
            self.buffer.pop_front();
        }

        if elapsed < self.config.warm_up() {
            return None;
        }
        let smoothed = self.smoothed_heart_rate()?;

        let direction = match self.zone.classify(smoothed) {
            ZonePosition::Inside => {
                if !self.zone_reached {
                    info!("Zone reached at {:.1} bpm", smoothed);
                }
                self.zone_reached = true;
                return None;
            }
            ZonePosition::Below if !self.zone_reached => return None,
            ZonePosition::Below => Direction::Increase,
            ZonePosition::Above => Direction::Decrease,
        };

        if let Some((at, last)) = self.last_adjustment {
            let cooldown = match last {
                Direction::Increase => self.config.increase_cooldown(),
                Direction::Decrease => self.config.decrease_cooldown(),
            };
            if elapsed.saturating_sub(at) < cooldown {
                return None;
            }
        }

        let step = self.config.step_watts;
        let stepped = match direction {
            Direction::Increase => self.adjusted_power.saturating_add(step),
            Direction::Decrease => self.adjusted_power.saturating_sub(step),
        };
        let to = self.clamp(stepped);
        if to == self.adjusted_power {
            debug!("Power pinned at {} W, smoothed {:.1} bpm", to, smoothed);
            return None;
        }

        let adjustment = Adjustment {
            from: self.adjusted_power,
            to,
            direction,
            at: elapsed,
        };
        info!(
            "Smoothed HR {:.1} bpm outside {}-{}: {} {} W -> {} W",
            smoothed, self.zone.min_bpm, self.zone.max_bpm, direction, adjustment.from, to
        );
        self.adjusted_power = to;
        self.last_adjustment = Some((elapsed, direction));
        Some(adjustment)
    }

    fn clamp(&self, watts: u16) -> u16 {
        let drift = self.config.max_drift_watts;
        let lower = self
            .target_power
            .saturating_sub(drift)
            .max(self.config.floor_watts);
        let upper = self.target_power.saturating_add(drift).max(lower);
        watts.clamp(lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ZoneController {
        ZoneController::new(
            ControllerConfig {
                smoothing_window: 3,
                warm_up_secs: 10,
                ..ControllerConfig::default()
            },
            ZoneBounds::new(120, 140).unwrap(),
            150,
        )
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    /// Feed a constant rate once per second over `range`, collecting adjustments
    fn feed(
        controller: &mut ZoneController,
        bpm: u16,
        range: std::ops::Range<u64>,
    ) -> Vec<Adjustment> {
        range
            .filter_map(|t| controller.evaluate(Some(bpm), secs(t)))
            .collect()
    }

    #[test]
    fn test_dead_band_holds_power() {
        let mut controller = controller();
        for (t, bpm) in [(20, 121), (21, 139), (22, 130), (23, 140), (24, 120)] {
            assert_eq!(controller.evaluate(Some(bpm), secs(t)), None);
        }
        assert_eq!(controller.adjusted_power(), 150);
        assert!(controller.zone_reached());
    }

    #[test]
    fn test_missing_samples_do_not_touch_buffer() {
        let mut controller = controller();
        assert_eq!(controller.evaluate(None, secs(20)), None);
        assert_eq!(controller.evaluate(Some(0), secs(21)), None);
        assert_eq!(controller.buffered(), 0);

        controller.evaluate(Some(130), secs(22));
        assert_eq!(controller.buffered(), 1);
    }

    #[test]
    fn test_buffer_is_fifo_with_fixed_capacity() {
        let mut controller = controller();
        for (t, bpm) in [(1, 100), (2, 110), (3, 120), (4, 130)] {
            controller.evaluate(Some(bpm), secs(t));
        }
        assert_eq!(controller.buffered(), 3);
        assert_eq!(controller.smoothed_heart_rate(), Some(120.0));
    }

    #[test]
    fn test_warm_up_blocks_adjustment_with_full_buffer() {
        let mut controller = controller();
        assert!(feed(&mut controller, 170, 0..10).is_empty());
        assert_eq!(controller.adjusted_power(), 150);

        let adjustment = controller.evaluate(Some(170), secs(10)).unwrap();
        assert_eq!(adjustment.direction, Direction::Decrease);
        assert_eq!(adjustment.to, 145);
    }

    #[test]
    fn test_no_increase_before_zone_reached() {
        let mut controller = controller();
        assert!(feed(&mut controller, 100, 0..300).is_empty());
        assert!(!controller.zone_reached());
        assert_eq!(controller.adjusted_power(), 150);
    }

    #[test]
    fn test_increase_after_zone_reached() {
        let mut controller = controller();
        feed(&mut controller, 130, 10..13);
        assert!(controller.zone_reached());

        let adjustments = feed(&mut controller, 100, 13..20);
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].direction, Direction::Increase);
        assert_eq!(adjustments[0].to, 155);
    }

    #[test]
    fn test_cooldown_allows_one_change() {
        let mut controller = controller();
        feed(&mut controller, 170, 10..12);
        let first = controller.evaluate(Some(170), secs(12));
        let second = controller.evaluate(Some(170), secs(40));
        assert!(first.is_some());
        assert_eq!(second, None);
        assert_eq!(controller.adjusted_power(), 145);
    }

    #[test]
    fn test_cooldown_is_longer_after_decrease() {
        let mut controller = controller();
        feed(&mut controller, 130, 10..13);

        let ups = feed(&mut controller, 100, 13..80);
        let gaps: Vec<Duration> = ups.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert!(gaps.iter().all(|gap| *gap == secs(30)));

        let downs = feed(&mut controller, 170, 80..300);
        let gaps: Vec<Duration> = downs.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert!(!gaps.is_empty());
        assert!(gaps.iter().all(|gap| *gap == secs(60)));
    }

    #[test]
    fn test_clamp_holds_drift_window() {
        let mut controller = controller();
        feed(&mut controller, 130, 10..13);
        feed(&mut controller, 100, 13..10_000);
        assert_eq!(controller.adjusted_power(), 200);

        let mut controller = self::controller();
        feed(&mut controller, 175, 10..20_000);
        assert_eq!(controller.adjusted_power(), 100);
    }

    #[test]
    fn test_floor_wins_over_drift() {
        let mut controller = ZoneController::new(
            ControllerConfig {
                smoothing_window: 1,
                warm_up_secs: 0,
                floor_watts: 80,
                ..ControllerConfig::default()
            },
            ZoneBounds::new(120, 140).unwrap(),
            100,
        );
        feed(&mut controller, 180, 0..5_000);
        assert_eq!(controller.adjusted_power(), 80);
    }

    #[test]
    fn test_rising_then_holding_above_zone() {
        let mut controller = ZoneController::new(
            ControllerConfig::default(),
            ZoneBounds::new(120, 140).unwrap(),
            150,
        );

        let mut adjustments = Vec::new();
        for t in 0..1_200u64 {
            let bpm = u16::try_from(100 + t.min(50)).unwrap();
            adjustments.extend(controller.evaluate(Some(bpm), secs(t)));
        }

        assert!(!adjustments.is_empty());
        assert!(adjustments.iter().all(|a| a.direction == Direction::Decrease));
        assert!(adjustments.iter().all(|a| a.from - a.to == 5));
        assert!(adjustments
            .windows(2)
            .all(|w| w[1].at - w[0].at >= ControllerConfig::default().decrease_cooldown()));
        assert_eq!(adjustments[0].at, secs(120));
        assert_eq!(controller.adjusted_power(), 100);
        assert_eq!(adjustments.len(), 10);
    }
}
