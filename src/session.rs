use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

use crate::types::{HrSource, WorkoutState};

/// One sampling-tick record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Active session time when the sample was taken
    pub elapsed: Duration,
    /// Heart rate, `None` when no source delivered data
    pub heart_rate: Option<u16>,
    /// Instantaneous power reported by the trainer
    pub power: Option<i16>,
}

/// A workout session and its recorded samples
///
/// The orchestrator owns the mutable session; collaborators receive an
/// immutable copy once it is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Wall-clock start
    pub started_at: SystemTime,
    /// Wall-clock end, set when the session is finalized
    pub ended_at: Option<SystemTime>,
    /// Configured target power in watts
    pub target_power: u16,
    /// Configured duration
    pub target_duration: Duration,
    /// Samples in tick order
    pub samples: Vec<Sample>,
}

impl Session {
    /// Start a new session record
    #[must_use]
    pub fn new(target_power: u16, target_duration: Duration) -> Self {
        Self {
            started_at: SystemTime::now(),
            ended_at: None,
            target_power,
            target_duration,
            samples: Vec::new(),
        }
    }

    /// Append a sample
    pub fn record(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Set the end time
    pub fn finalize(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(SystemTime::now());
        }
    }

    /// Whether the session has ended
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Mean of the recorded heart-rate values
    #[must_use]
    pub fn average_heart_rate(&self) -> Option<f64> {
        mean(self.samples.iter().filter_map(|s| s.heart_rate).map(f64::from))
    }

    /// Mean of the recorded power values
    #[must_use]
    pub fn average_power(&self) -> Option<f64> {
        mean(self.samples.iter().filter_map(|s| s.power).map(f64::from))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u32), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / f64::from(count))
}

/// Position of the session within its fixed-length chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    /// One-based index of the current chunk
    pub current_chunk: u32,
    /// Number of chunks in the whole workout
    pub total_chunks: u32,
    /// Time left in the current chunk
    pub chunk_remaining: Duration,
}

impl ChunkProgress {
    /// Compute progress for an elapsed time
    ///
    /// The last chunk may be shorter than `chunk`.
    #[must_use]
    pub fn at(elapsed: Duration, total: Duration, chunk: Duration) -> Self {
        let chunk_ms = chunk.as_millis().max(1);
        let total_ms = total.as_millis();
        let elapsed_ms = elapsed.as_millis().min(total_ms);

        let total_chunks = total_ms.div_ceil(chunk_ms).max(1);
        let index = (elapsed_ms / chunk_ms).min(total_chunks - 1);
        let chunk_end = ((index + 1) * chunk_ms).min(total_ms);
        let remaining_ms = chunk_end.saturating_sub(elapsed_ms);

        Self {
            current_chunk: u32::try_from(index + 1).unwrap_or(u32::MAX),
            total_chunks: u32::try_from(total_chunks).unwrap_or(u32::MAX),
            chunk_remaining: Duration::from_millis(u64::try_from(remaining_ms).unwrap_or(u64::MAX)),
        }
    }
}

/// Active-time clock that stops while paused
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkoutClock {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl WorkoutClock {
    /// Start or resume counting
    pub fn resume(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    /// Stop counting, keeping the accumulated time
    pub fn pause(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
    }

    /// Active time at `now`
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.accumulated
            + self
                .running_since
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since))
    }
}

/// Live view of the workout, emitted every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkoutSnapshot {
    /// Workout state
    pub state: WorkoutState,
    /// Active session time
    pub elapsed: Duration,
    /// Current heart rate
    pub heart_rate: Option<u16>,
    /// Last instantaneous trainer power
    pub power: Option<i16>,
    /// Configured target power
    pub target_power: u16,
    /// Power the controller currently commands
    pub adjusted_power: u16,
    /// Selected heart-rate source
    pub source: HrSource,
    /// The mirrored link dropped and has not come back
    pub mirror_disconnected: bool,
    /// Chunk progress
    pub progress: ChunkProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_progress() {
        let total = Duration::from_secs(1_000);
        let chunk = Duration::from_secs(300);

        let start = ChunkProgress::at(Duration::ZERO, total, chunk);
        assert_eq!(start.current_chunk, 1);
        assert_eq!(start.total_chunks, 4);
        assert_eq!(start.chunk_remaining, chunk);

        let second = ChunkProgress::at(Duration::from_secs(310), total, chunk);
        assert_eq!(second.current_chunk, 2);
        assert_eq!(second.chunk_remaining, Duration::from_secs(290));

        let last = ChunkProgress::at(Duration::from_secs(950), total, chunk);
        assert_eq!(last.current_chunk, 4);
        assert_eq!(last.chunk_remaining, Duration::from_secs(50));

        let past = ChunkProgress::at(Duration::from_secs(5_000), total, chunk);
        assert_eq!(past.current_chunk, 4);
        assert_eq!(past.chunk_remaining, Duration::ZERO);
    }

    #[test]
    fn test_clock_excludes_paused_time() {
        let t0 = Instant::now();
        let mut clock = WorkoutClock::default();
        assert_eq!(clock.elapsed(t0), Duration::ZERO);

        clock.resume(t0);
        clock.pause(t0 + Duration::from_secs(10));
        assert_eq!(clock.elapsed(t0 + Duration::from_secs(100)), Duration::from_secs(10));

        clock.resume(t0 + Duration::from_secs(100));
        assert_eq!(clock.elapsed(t0 + Duration::from_secs(105)), Duration::from_secs(15));
    }

    #[test]
    fn test_session_summary() {
        let mut session = Session::new(150, Duration::from_secs(60));
        session.record(Sample {
            elapsed: Duration::from_secs(1),
            heart_rate: Some(120),
            power: Some(150),
        });
        session.record(Sample {
            elapsed: Duration::from_secs(2),
            heart_rate: None,
            power: Some(160),
        });
        session.record(Sample {
            elapsed: Duration::from_secs(3),
            heart_rate: Some(130),
            power: None,
        });

        assert_eq!(session.average_heart_rate(), Some(125.0));
        assert_eq!(session.average_power(), Some(155.0));

        assert!(!session.is_finalized());
        session.finalize();
        let ended = session.ended_at;
        session.finalize();
        assert_eq!(session.ended_at, ended);
    }
}
