use std::time::{Duration, Instant};

/// How long the server may stay silent before connectivity counts as
/// lost.
pub const SERVER_LOSS_DELAY: Duration = Duration::from_secs(35);
/// Keep-alive solicitation interval while qualified.
pub const SERVER_PING_DELAY: Duration = Duration::from_secs(30);
/// Back-off before restarting a failed qualification.
pub const RESTART_DELAY: Duration = Duration::from_secs(300);
/// Retransmission interval while probing.
pub const PROBE_DELAY: Duration = Duration::from_secs(4);

/// Solicitations sent in one probing phase before moving on.
const MAX_PROBES: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Qualified,
    ProbeCone,
    ProbeRestricted,
    ProbeSymmetric,
}

/// Router Solicitation the timer asks the endpoint to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Solicit {
    /// Source the cone sentinel instead of the restricted one.
    pub cone: bool,
    /// Address the server's secondary IPv4 address.
    pub secondary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerAction {
    pub solicit: Option<Solicit>,
    /// Server connectivity was lost; requalification has begun.
    pub lost: bool,
}

/// Qualification timer state. Reception-driven transitions live with the
/// packet paths; this tracks the probe schedule and counts timeouts.
#[derive(Debug)]
pub struct Qualification {
    pub phase: Phase,
    pub count: u8,
    /// When the next solicitation is due.
    pub next: Instant,
    /// Moment the server counts as lost.
    pub server_deadline: Instant,
    pub nonce: [u8; 8],
}

impl Qualification {
    pub fn new(nonce: [u8; 8], now: Instant) -> Self {
        Qualification {
            phase: Phase::ProbeCone,
            count: 0,
            next: now,
            server_deadline: now + SERVER_LOSS_DELAY,
            nonce,
        }
    }

    /// Already-running state for endpoints that skip qualification.
    pub fn always_running(now: Instant) -> Self {
        Qualification {
            phase: Phase::Qualified,
            count: 0,
            next: now + SERVER_PING_DELAY,
            server_deadline: now + SERVER_LOSS_DELAY,
            nonce: [0u8; 8],
        }
    }

    /// Advances the schedule to `now`. At most one solicitation is due
    /// per call; the driver is expected to tick at least once per
    /// [`PROBE_DELAY`].
    pub fn advance(&mut self, cone_flag: bool, now: Instant) -> TimerAction {
        if now < self.next {
            return TimerAction {
                solicit: None,
                lost: false,
            };
        }

        let mut lost = false;
        let delay;

        if self.phase == Phase::Qualified {
            if now >= self.server_deadline {
                self.count = 1;
                self.phase = if cone_flag {
                    Phase::ProbeCone
                } else {
                    Phase::ProbeRestricted
                };
                lost = true;
                delay = PROBE_DELAY;
            } else {
                delay = SERVER_PING_DELAY;
            }
        } else {
            let mut probe_delay = PROBE_DELAY;
            if self.phase == Phase::ProbeCone {
                if self.count == MAX_PROBES {
                    // Cone qualification failed
                    self.phase = Phase::ProbeRestricted;
                    self.count = 0;
                }
            } else {
                if self.phase == Phase::ProbeSymmetric {
                    // Second half of restricted qualification went
                    // unanswered; fall back to soliciting the primary.
                    self.phase = Phase::ProbeRestricted;
                }
                if self.count == MAX_PROBES {
                    // Restricted qualification failed, restart from zero.
                    self.phase = Phase::ProbeCone;
                    self.count = 0;
                } else if self.count == MAX_PROBES - 1 {
                    // Last restricted attempt; defer the next round.
                    probe_delay = RESTART_DELAY;
                }
            }
            self.count += 1;
            delay = probe_delay;
        }

        self.next = now + delay;
        TimerAction {
            solicit: Some(Solicit {
                cone: self.phase == Phase::ProbeCone,
                secondary: self.phase == Phase::ProbeRestricted,
            }),
            lost,
        }
    }
}
