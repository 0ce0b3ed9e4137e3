//! ---
//! ts_section: "02-messaging-ipc-data-model"
//! ts_subsection: "module"
//! ts_type: "source"
//! ts_scope: "code"
//! ts_description: "Coalescing throttle with bounded acknowledgement retry."
//! ts_version: "v0.1.0"
//! ts_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::Instant;
use trackside_common::ThrottleConfig;

/// Timing and retry budget of one throttled command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Minimum spacing between two transmissions.
    pub min_interval: Duration,
    /// How long to wait for an acknowledgement.
    pub ack_timeout: Duration,
    /// Transmissions allowed per command before giving up.
    pub max_attempts: u8,
    /// Whether transmissions wait for an acknowledgement at all.
    pub await_ack: bool,
}

impl ThrottlePolicy {
    /// Throttled and acknowledged (PID updates).
    pub fn acknowledged(config: &ThrottleConfig) -> Self {
        Self {
            min_interval: config.min_interval,
            ack_timeout: config.ack_timeout,
            max_attempts: config.max_attempts.max(1),
            await_ack: true,
        }
    }

    /// Throttled only (speed edits).
    pub fn fire_and_forget(config: &ThrottleConfig) -> Self {
        Self {
            await_ack: false,
            ..Self::acknowledged(config)
        }
    }
}

/// Observable result of a throttle transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The command must be written now. `attempt` starts at 1.
    Sent {
        /// Command to write.
        command: T,
        /// Transmission number.
        attempt: u8,
    },
    /// Positive acknowledgement received.
    Acknowledged {
        /// Acknowledged command.
        command: T,
    },
    /// The device answered `ack:false`.
    Rejected {
        /// Rejected command.
        command: T,
        /// Transmission that was rejected.
        attempt: u8,
    },
    /// No acknowledgement before the deadline.
    TimedOut {
        /// Unacknowledged command.
        command: T,
        /// Transmission that timed out.
        attempt: u8,
    },
    /// Retry budget exhausted; the command is abandoned.
    Exhausted {
        /// Abandoned command.
        command: T,
        /// Transmissions made.
        attempts: u8,
    },
}

impl<T> Outcome<T> {
    /// The command this outcome refers to.
    pub fn command(&self) -> &T {
        match self {
            Outcome::Sent { command, .. }
            | Outcome::Acknowledged { command }
            | Outcome::Rejected { command, .. }
            | Outcome::TimedOut { command, .. }
            | Outcome::Exhausted { command, .. } => command,
        }
    }

    /// Outcomes that end the life of a command.
    pub fn is_final(&self) -> bool {
        matches!(self, Outcome::Acknowledged { .. } | Outcome::Exhausted { .. })
    }
}

#[derive(Debug, Clone)]
struct InFlight<T> {
    command: T,
    attempts: u8,
    deadline: Instant,
}

/// `Idle -> AwaitingAck -> Idle` with a single pending slot that every new
/// edit overwrites. Time is passed in, so the machine is deterministic.
#[derive(Debug, Clone)]
pub struct Throttle<T> {
    policy: ThrottlePolicy,
    last_sent: Option<Instant>,
    pending: Option<T>,
    flush_at: Option<Instant>,
    in_flight: Option<InFlight<T>>,
}

impl<T: Clone> Throttle<T> {
    /// Idle throttle.
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            last_sent: None,
            pending: None,
            flush_at: None,
            in_flight: None,
        }
    }

    /// Active policy.
    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// True while a transmission waits for its acknowledgement.
    pub fn awaiting_ack(&self) -> bool {
        self.in_flight.is_some()
    }

    /// True when an edit is parked in the pending slot.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Accept a new edit, replacing any edit still pending.
    pub fn submit(&mut self, now: Instant, command: T) -> Vec<Outcome<T>> {
        self.pending = Some(command);
        let mut out = Vec::new();
        self.pump(now, &mut out);
        out
    }

    /// Feed an acknowledgement matching this stream's command name.
    pub fn on_ack(&mut self, now: Instant, ok: bool) -> Vec<Outcome<T>> {
        let mut out = Vec::new();
        let Some(flight) = self.in_flight.take() else {
            return out;
        };
        if ok {
            out.push(Outcome::Acknowledged {
                command: flight.command,
            });
        } else {
            out.push(Outcome::Rejected {
                command: flight.command.clone(),
                attempt: flight.attempts,
            });
            self.retry(now, flight, &mut out);
        }
        self.pump(now, &mut out);
        out
    }

    /// Handle an expired ack deadline or flush timer. Safe to call early.
    pub fn on_timer(&mut self, now: Instant) -> Vec<Outcome<T>> {
        let mut out = Vec::new();
        if let Some(flight) = self.in_flight.take() {
            if flight.deadline <= now {
                out.push(Outcome::TimedOut {
                    command: flight.command.clone(),
                    attempt: flight.attempts,
                });
                self.retry(now, flight, &mut out);
            } else {
                self.in_flight = Some(flight);
            }
        }
        self.pump(now, &mut out);
        out
    }

    /// Earliest instant at which [`Throttle::on_timer`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.in_flight {
            Some(flight) => Some(flight.deadline),
            None => self.flush_at,
        }
    }

    /// Drop the pending edit, leaving any in-flight command alone.
    pub fn cancel_pending(&mut self) {
        self.pending = None;
        self.flush_at = None;
    }

    /// Drop the pending edit and release `command` in its place, now.
    /// The released command is not tracked for acknowledgement but does
    /// open a new interval window.
    pub fn preempt(&mut self, now: Instant, command: T) -> Vec<Outcome<T>> {
        self.cancel_pending();
        self.last_sent = Some(now);
        vec![Outcome::Sent { command, attempt: 1 }]
    }

    /// Forget everything, e.g. after the link closed.
    pub fn reset(&mut self) {
        self.cancel_pending();
        self.in_flight = None;
        self.last_sent = None;
    }

    fn retry(&mut self, now: Instant, flight: InFlight<T>, out: &mut Vec<Outcome<T>>) {
        if flight.attempts >= self.policy.max_attempts {
            out.push(Outcome::Exhausted {
                command: flight.command,
                attempts: flight.attempts,
            });
            return;
        }
        self.transmit(now, flight.command, flight.attempts + 1, out);
    }

    fn pump(&mut self, now: Instant, out: &mut Vec<Outcome<T>>) {
        if self.in_flight.is_some() {
            return;
        }
        if self.pending.is_none() {
            self.flush_at = None;
            return;
        }
        let ready_at = self
            .last_sent
            .map(|sent| sent + self.policy.min_interval)
            .unwrap_or(now);
        if ready_at <= now {
            if let Some(command) = self.pending.take() {
                self.flush_at = None;
                self.transmit(now, command, 1, out);
            }
        } else {
            self.flush_at = Some(ready_at);
        }
    }

    fn transmit(&mut self, now: Instant, command: T, attempt: u8, out: &mut Vec<Outcome<T>>) {
        self.last_sent = Some(now);
        if self.policy.await_ack {
            self.in_flight = Some(InFlight {
                command: command.clone(),
                attempts: attempt,
                deadline: now + self.policy.ack_timeout,
            });
        }
        out.push(Outcome::Sent { command, attempt });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn pid_policy() -> ThrottlePolicy {
        ThrottlePolicy::acknowledged(&ThrottleConfig::default())
    }

    fn sent<T: Clone>(out: &[Outcome<T>]) -> Vec<T> {
        out.iter()
            .filter_map(|o| match o {
                Outcome::Sent { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn coalesces_edits_within_one_window() {
        let mut throttle = Throttle::new(ThrottlePolicy::fire_and_forget(&ThrottleConfig::default()));
        let t0 = Instant::now();
        assert_eq!(sent(&throttle.submit(t0, 1)), vec![1]);

        let mut transmitted = Vec::new();
        for (i, value) in (2..=10).enumerate() {
            transmitted.extend(sent(&throttle.submit(t0 + ms(20 * (i as u64 + 1)), value)));
        }
        assert!(transmitted.is_empty());
        assert_eq!(throttle.next_deadline(), Some(t0 + ms(400)));

        assert!(sent(&throttle.on_timer(t0 + ms(399))).is_empty());
        assert_eq!(sent(&throttle.on_timer(t0 + ms(400))), vec![10]);
        assert_eq!(throttle.next_deadline(), None);
    }

    #[test]
    fn sends_immediately_when_interval_elapsed() {
        let mut throttle = Throttle::new(ThrottlePolicy::fire_and_forget(&ThrottleConfig::default()));
        let t0 = Instant::now();
        throttle.submit(t0, "a");
        assert_eq!(sent(&throttle.submit(t0 + ms(450), "b")), vec!["b"]);
    }

    #[test]
    fn ack_releases_pending_edit_after_interval() {
        let mut throttle = Throttle::new(pid_policy());
        let t0 = Instant::now();
        throttle.submit(t0, 1);
        throttle.submit(t0 + ms(50), 2);
        throttle.submit(t0 + ms(60), 3);

        let out = throttle.on_ack(t0 + ms(100), true);
        assert_eq!(out[0], Outcome::Acknowledged { command: 1 });
        assert!(sent(&out).is_empty());
        assert_eq!(throttle.next_deadline(), Some(t0 + ms(400)));

        let out = throttle.on_timer(t0 + ms(400));
        assert_eq!(out, vec![Outcome::Sent { command: 3, attempt: 1 }]);
        assert!(throttle.awaiting_ack());
    }

    #[test]
    fn ack_after_interval_sends_pending_at_once() {
        let mut throttle = Throttle::new(pid_policy());
        let t0 = Instant::now();
        throttle.submit(t0, 1);
        throttle.submit(t0 + ms(100), 2);
        let out = throttle.on_ack(t0 + ms(500), true);
        assert_eq!(sent(&out), vec![2]);
    }

    #[test]
    fn rejection_resends_same_command() {
        let mut throttle = Throttle::new(pid_policy());
        let t0 = Instant::now();
        throttle.submit(t0, 7);
        throttle.submit(t0 + ms(10), 8);
        let out = throttle.on_ack(t0 + ms(20), false);
        assert_eq!(
            out,
            vec![
                Outcome::Rejected { command: 7, attempt: 1 },
                Outcome::Sent { command: 7, attempt: 2 },
            ]
        );
        assert!(throttle.has_pending());
    }

    #[test]
    fn retries_are_bounded_and_exhaustion_is_reported() {
        let mut throttle = Throttle::new(pid_policy());
        let t0 = Instant::now();
        let mut now = t0;
        let mut transmissions = sent(&throttle.submit(now, 'p')).len();
        let mut exhausted = None;
        for _ in 0..10 {
            let Some(deadline) = throttle.next_deadline() else {
                break;
            };
            now = deadline;
            for outcome in throttle.on_timer(now) {
                match outcome {
                    Outcome::Sent { .. } => transmissions += 1,
                    Outcome::Exhausted { attempts, .. } => exhausted = Some(attempts),
                    _ => {}
                }
            }
        }
        assert_eq!(transmissions, 3);
        assert_eq!(exhausted, Some(3));
        assert!(!throttle.awaiting_ack());
        assert_eq!(now, t0 + ms(3000));
    }

    #[test]
    fn exhaustion_moves_on_to_pending_edit() {
        let mut throttle = Throttle::new(ThrottlePolicy {
            max_attempts: 1,
            ..pid_policy()
        });
        let t0 = Instant::now();
        throttle.submit(t0, 1);
        throttle.submit(t0 + ms(100), 2);
        let out = throttle.on_timer(t0 + ms(1000));
        assert_eq!(
            out,
            vec![
                Outcome::TimedOut { command: 1, attempt: 1 },
                Outcome::Exhausted { command: 1, attempts: 1 },
                Outcome::Sent { command: 2, attempt: 1 },
            ]
        );
    }

    #[test]
    fn cancel_pending_prevents_delayed_flush() {
        let mut throttle = Throttle::new(ThrottlePolicy::fire_and_forget(&ThrottleConfig::default()));
        let t0 = Instant::now();
        throttle.submit(t0, 30);
        throttle.submit(t0 + ms(100), 60);
        throttle.cancel_pending();
        assert_eq!(throttle.next_deadline(), None);
        assert!(throttle.on_timer(t0 + ms(500)).is_empty());
    }

    #[test]
    fn preempt_replaces_overdue_edit() {
        let mut throttle = Throttle::new(ThrottlePolicy::fire_and_forget(&ThrottleConfig::default()));
        let t0 = Instant::now();
        throttle.submit(t0, 30);
        throttle.submit(t0 + ms(100), 70);
        let out = throttle.preempt(t0 + ms(450), 0);
        assert_eq!(out, vec![Outcome::Sent { command: 0, attempt: 1 }]);
        assert!(!throttle.has_pending());
        assert_eq!(throttle.next_deadline(), None);
        assert!(throttle.on_timer(t0 + ms(900)).is_empty());

        let out = throttle.submit(t0 + ms(500), 40);
        assert!(out.is_empty());
        assert_eq!(throttle.next_deadline(), Some(t0 + ms(850)));
    }

    #[test]
    fn stale_ack_is_ignored() {
        let mut throttle: Throttle<u8> = Throttle::new(pid_policy());
        assert!(throttle.on_ack(Instant::now(), true).is_empty());
    }
}
