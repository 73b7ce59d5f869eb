use dendron_core::TimeMs;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// A monotone sequence of time points with a cursor.
///
/// `next` peeks at the earliest unconsumed time, `pop` consumes it,
/// `advance(t)` moves the cursor to the first time at or after `t` and
/// `reset` restores the construction state. Advancing backwards replays the
/// stream from the start, so the times produced never depend on how a
/// caller windows its queries; the Poisson variant regenerates its ChaCha
/// stream from the seed to guarantee this.
#[derive(Debug, Clone)]
pub struct Schedule {
    spec: ScheduleSpec,
    cursor: Cursor,
}

#[derive(Debug, Clone, PartialEq)]
enum ScheduleSpec {
    Regular {
        t_start: TimeMs,
        dt: TimeMs,
        t_stop: TimeMs,
    },
    Explicit {
        times: Vec<TimeMs>,
    },
    Poisson {
        t_start: TimeMs,
        rate_per_ms: f64,
        t_stop: TimeMs,
        seed: u64,
    },
}

#[derive(Debug, Clone)]
enum Cursor {
    Regular {
        step: u64,
    },
    Explicit {
        index: usize,
    },
    Poisson {
        /// Lower bound of the unconsumed stream; everything earlier has
        /// been popped or skipped.
        position: TimeMs,
        t_next: TimeMs,
        rng: ChaCha8Rng,
    },
}

// Schedules compare by what they describe, not by cursor position.
impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.spec == other.spec
    }
}

impl Schedule {
    pub fn regular(t_start: TimeMs, dt: TimeMs, t_stop: TimeMs) -> Self {
        assert!(dt > 0.0, "regular schedule needs positive dt");
        Self::from_spec(ScheduleSpec::Regular { t_start, dt, t_stop })
    }

    pub fn explicit(mut times: Vec<TimeMs>) -> Self {
        times.sort_by(|a, b| a.partial_cmp(b).expect("schedule times are finite"));
        Self::from_spec(ScheduleSpec::Explicit { times })
    }

    pub fn poisson(t_start: TimeMs, rate_per_ms: f64, t_stop: TimeMs, seed: u64) -> Self {
        assert!(rate_per_ms > 0.0, "poisson schedule needs positive rate");
        Self::from_spec(ScheduleSpec::Poisson {
            t_start,
            rate_per_ms,
            t_stop,
            seed,
        })
    }

    fn from_spec(spec: ScheduleSpec) -> Self {
        let cursor = match &spec {
            ScheduleSpec::Regular { .. } => Cursor::Regular { step: 0 },
            ScheduleSpec::Explicit { .. } => Cursor::Explicit { index: 0 },
            ScheduleSpec::Poisson {
                t_start,
                rate_per_ms,
                seed,
                ..
            } => {
                let mut rng = ChaCha8Rng::seed_from_u64(*seed);
                let t_next = t_start + exponential_step(&mut rng, *rate_per_ms);
                Cursor::Poisson {
                    position: *t_start,
                    t_next,
                    rng,
                }
            }
        };
        Self { spec, cursor }
    }

    /// The earliest unconsumed time, or `None` when the stream is finished.
    /// Does not move the cursor.
    pub fn next(&self) -> Option<TimeMs> {
        match (&self.spec, &self.cursor) {
            (ScheduleSpec::Regular { t_start, dt, t_stop }, Cursor::Regular { step }) => {
                let t = t_start + *step as TimeMs * dt;
                (t < *t_stop).then_some(t)
            }
            (ScheduleSpec::Explicit { times }, Cursor::Explicit { index }) => {
                times.get(*index).copied()
            }
            (ScheduleSpec::Poisson { t_stop, .. }, Cursor::Poisson { t_next, .. }) => {
                (*t_next < *t_stop).then_some(*t_next)
            }
            _ => unreachable!("cursor variant always matches its spec"),
        }
    }

    /// Consumes the time `next` reported.
    pub fn pop(&mut self) {
        match (&self.spec, &mut self.cursor) {
            (ScheduleSpec::Regular { .. }, Cursor::Regular { step }) => {
                *step += 1;
            }
            (ScheduleSpec::Explicit { .. }, Cursor::Explicit { index }) => {
                *index += 1;
            }
            (
                ScheduleSpec::Poisson { rate_per_ms, .. },
                Cursor::Poisson {
                    position,
                    t_next,
                    rng,
                },
            ) => {
                *position = *t_next;
                *t_next += exponential_step(rng, *rate_per_ms);
            }
            _ => unreachable!("cursor variant always matches its spec"),
        }
    }

    /// Restores the state the schedule had at construction.
    pub fn reset(&mut self) {
        self.cursor = Self::from_spec(self.spec.clone()).cursor;
    }

    /// Moves the cursor so that `next` reports the first time at or after
    /// `t`. Moving backwards replays the stream from the start.
    pub fn advance(&mut self, t: TimeMs) {
        if matches!(self.cursor, Cursor::Poisson { .. }) {
            let behind = match &self.cursor {
                Cursor::Poisson { position, .. } => t < *position,
                _ => unreachable!(),
            };
            if behind {
                self.reset();
            }
            while let Some(time) = self.next() {
                if time >= t {
                    break;
                }
                self.pop();
            }
            if let Cursor::Poisson { position, .. } = &mut self.cursor {
                if t > *position {
                    *position = t;
                }
            }
            return;
        }
        match (&self.spec, &mut self.cursor) {
            (ScheduleSpec::Regular { t_start, dt, .. }, Cursor::Regular { step }) => {
                *step = if t <= *t_start {
                    0
                } else {
                    ((t - t_start) / dt).ceil() as u64
                };
            }
            (ScheduleSpec::Explicit { times }, Cursor::Explicit { index }) => {
                *index = times.partition_point(|&time| time < t);
            }
            _ => unreachable!("cursor variant always matches its spec"),
        }
    }

    /// All event times in the half-open window `[t0, t1)`, in order,
    /// consuming them from the cursor.
    pub fn events(&mut self, t0: TimeMs, t1: TimeMs) -> Vec<TimeMs> {
        self.advance(t0);
        let mut out = Vec::new();
        while let Some(t) = self.next() {
            if t >= t1 {
                break;
            }
            out.push(t);
            self.pop();
        }
        out
    }
}

fn exponential_step(rng: &mut ChaCha8Rng, rate_per_ms: f64) -> TimeMs {
    let u: f64 = rng.gen();
    -(1.0 - u).ln() / rate_per_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_window_is_half_open() {
        let mut sched = Schedule::regular(0.0, 0.5, 10.0);
        assert_eq!(sched.events(0.0, 1.5), vec![0.0, 0.5, 1.0]);
        assert_eq!(sched.events(1.5, 2.5), vec![1.5, 2.0]);
        assert!(sched.events(10.0, 20.0).is_empty());
    }

    #[test]
    fn explicit_is_sorted_and_filtered() {
        let mut sched = Schedule::explicit(vec![3.0, 1.0, 2.0]);
        assert_eq!(sched.events(0.0, 2.5), vec![1.0, 2.0]);
        assert_eq!(sched.events(2.5, 4.0), vec![3.0]);
    }

    #[test]
    fn cursor_peeks_pops_and_exhausts() {
        let mut sched = Schedule::regular(1.0, 1.0, 3.5);
        assert_eq!(sched.next(), Some(1.0));
        assert_eq!(sched.next(), Some(1.0));
        sched.pop();
        assert_eq!(sched.next(), Some(2.0));
        sched.pop();
        assert_eq!(sched.next(), Some(3.0));
        sched.pop();
        assert_eq!(sched.next(), None);
    }

    #[test]
    fn advance_lands_on_the_first_time_not_before() {
        let mut sched = Schedule::explicit(vec![1.0, 2.0, 4.0]);
        sched.advance(1.5);
        assert_eq!(sched.next(), Some(2.0));
        sched.advance(2.0);
        assert_eq!(sched.next(), Some(2.0));
        sched.advance(5.0);
        assert_eq!(sched.next(), None);
        // Backwards replays from the start.
        sched.advance(0.0);
        assert_eq!(sched.next(), Some(1.0));
    }

    #[test]
    fn reset_restores_the_construction_state() {
        let mut sched = Schedule::poisson(0.0, 0.5, 50.0, 3);
        let first = sched.events(0.0, 50.0);
        assert!(!first.is_empty());
        assert!(sched.next().is_none());
        sched.reset();
        assert_eq!(sched.events(0.0, 50.0), first);
    }

    #[test]
    fn poisson_is_window_invariant() {
        let mut whole = Schedule::poisson(0.0, 0.2, 100.0, 42);
        let all = whole.events(0.0, 100.0);
        assert!(!all.is_empty());

        let mut pieced_schedule = Schedule::poisson(0.0, 0.2, 100.0, 42);
        let mut pieced = Vec::new();
        let mut t = 0.0;
        while t < 100.0 {
            pieced.extend(pieced_schedule.events(t, t + 7.0));
            t += 7.0;
        }
        assert_eq!(all, pieced);
    }

    #[test]
    fn poisson_is_deterministic_per_seed() {
        let a = Schedule::poisson(0.0, 1.0, 50.0, 7).events(0.0, 50.0);
        let b = Schedule::poisson(0.0, 1.0, 50.0, 7).events(0.0, 50.0);
        let c = Schedule::poisson(0.0, 1.0, 50.0, 8).events(0.0, 50.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
