//! Tick pacing.
//!
//! Every device expresses its speed as a [`RateClass`]; the only code that
//! actually waits is [`TimingGovernor`]. Both delay primitives are lower
//! bounds. `delay_ms` is at the mercy of the scheduler tick, and
//! `delay_sub_ms` spins on the monotonic clock and can still overshoot when
//! the thread is preempted.

use std::thread;
use std::time::{Duration, Instant};

use log::trace;
use serde::{Deserialize, Serialize};

const ONE_MS: Duration = Duration::from_millis(1);

/// Historical transfer rates, in characters (or words) per second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateClass {
    /// ASR-33 teletype reader and punch.
    Asr33,
    /// PC04 high-speed reader.
    Pc04Reader,
    /// PC04 high-speed punch.
    Pc04Punch,
    /// TU56 DECtape word rate at speed.
    Tu56Word,
    PerSecond(u32),
}

impl RateClass {
    pub const fn per_second(self) -> u32 {
        match self {
            RateClass::Asr33 => 10,
            RateClass::Pc04Reader => 300,
            RateClass::Pc04Punch => 50,
            RateClass::Tu56Word => 8325,
            RateClass::PerSecond(n) => n,
        }
    }

    /// Spacing between two characters. A zero rate never fires.
    pub fn interval(self) -> Duration {
        match self.per_second() {
            0 => Duration::MAX,
            n => Duration::from_secs(1) / n,
        }
    }
}

/// Sleeps on the platform timer. Resolution is the scheduler tick.
pub fn delay_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

/// Spins until at least `us` microseconds have passed.
pub fn delay_sub_ms(us: u64) {
    let deadline = Instant::now() + Duration::from_micros(us);
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Paces the device loop at a fixed period.
pub struct TimingGovernor {
    period: Duration,
    next_deadline: Option<Instant>,
    last_tick: Option<Instant>,
    slips: u64,
}

impl TimingGovernor {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_micros(1)),
            next_deadline: None,
            last_tick: None,
            slips: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Shortens the period to `hint` if a device needs finer spacing.
    pub fn tighten(&mut self, hint: Duration) {
        if !hint.is_zero() && hint < self.period {
            self.period = hint;
        }
    }

    /// Number of deadlines missed so far.
    pub fn slips(&self) -> u64 {
        self.slips
    }

    /// Waits for the next tick deadline and returns the time since the
    /// previous tick. A missed deadline is counted and the schedule is
    /// rebased on the current time, so a stall never turns into a burst of
    /// catch-up ticks.
    pub fn pace(&mut self) -> Duration {
        let now = Instant::now();
        let deadline = *self.next_deadline.get_or_insert(now);

        let mut slipped = false;
        if now < deadline {
            wait(deadline - now);
        } else if now - deadline > self.period {
            slipped = true;
            self.slips += 1;
            trace!(
                "Timing: missed tick deadline by {:?} ({} slips)",
                now - deadline,
                self.slips
            );
        }

        let tick_at = Instant::now();
        let elapsed = self
            .last_tick
            .map_or(Duration::ZERO, |last| tick_at.duration_since(last));
        self.last_tick = Some(tick_at);
        self.next_deadline = Some(if slipped {
            tick_at + self.period
        } else {
            deadline + self.period
        });
        elapsed
    }
}

fn wait(remaining: Duration) {
    if remaining >= ONE_MS {
        let whole_ms = remaining.as_millis() as u64;
        delay_ms(whole_ms);
        let rest = remaining.saturating_sub(Duration::from_millis(whole_ms));
        delay_sub_ms(rest.as_micros() as u64);
    } else {
        delay_sub_ms(remaining.as_micros() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_classes_convert_to_intervals() {
        assert_eq!(RateClass::Asr33.interval(), Duration::from_millis(100));
        assert_eq!(RateClass::Pc04Punch.interval(), Duration::from_millis(20));
        assert!(RateClass::Tu56Word.interval() < ONE_MS);
        assert_eq!(RateClass::PerSecond(0).interval(), Duration::MAX);
    }

    #[test]
    fn sub_ms_delay_is_a_lower_bound() {
        let start = Instant::now();
        delay_sub_ms(250);
        assert!(start.elapsed() >= Duration::from_micros(250));
    }

    #[test]
    fn pace_waits_at_least_one_period() {
        let mut governor = TimingGovernor::new(Duration::from_micros(500));
        governor.pace();
        let elapsed = governor.pace();
        assert!(elapsed >= Duration::from_micros(500));
    }

    #[test]
    fn tighten_only_shortens() {
        let mut governor = TimingGovernor::new(Duration::from_millis(1));
        governor.tighten(Duration::from_millis(5));
        assert_eq!(governor.period(), Duration::from_millis(1));
        governor.tighten(Duration::from_micros(120));
        assert_eq!(governor.period(), Duration::from_micros(120));
        governor.tighten(Duration::ZERO);
        assert_eq!(governor.period(), Duration::from_micros(120));
    }

    #[test]
    fn stalls_are_counted_as_slips() {
        let mut governor = TimingGovernor::new(Duration::from_micros(200));
        governor.pace();
        thread::sleep(Duration::from_millis(3));
        let elapsed = governor.pace();
        assert_eq!(governor.slips(), 1);
        assert!(elapsed >= Duration::from_millis(3));
    }
}
