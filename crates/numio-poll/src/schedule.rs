//! The adaptive poll schedule.
//!
//! Fresh orders poll fast; stale orders back off. Orders that already got a
//! message poll on a tight post-SMS cadence, then relax. Error and open-
//! breaker items take their own lanes. First matching rule wins.

use rand::Rng;

// ── Inputs / outputs ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default)]
pub struct ScheduleInput {
    pub order_age_secs: i64,
    pub sms_count: u64,
    /// Seconds since the newest message; meaningful only when `sms_count > 0`.
    pub since_last_sms_secs: i64,
    pub poll_attempt: u32,
    pub circuit_open: bool,
    pub last_poll_error: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PollPhase {
    CircuitOpen,
    ErrorRetry,
    /// Post-SMS cadence tier (0 = hottest).
    PostSms(usize),
    /// Pre-SMS age tier (0 = freshest).
    PreSms(usize),
}

impl PollPhase {
    pub fn label(self) -> &'static str {
        match self {
            PollPhase::CircuitOpen => "circuit_open",
            PollPhase::ErrorRetry => "error_retry",
            PollPhase::PostSms(0) => "post_sms_hot",
            PollPhase::PostSms(1) => "post_sms_warm",
            PollPhase::PostSms(_) => "post_sms_cold",
            PollPhase::PreSms(0) => "pre_sms_0",
            PollPhase::PreSms(1) => "pre_sms_1",
            PollPhase::PreSms(2) => "pre_sms_2",
            PollPhase::PreSms(3) => "pre_sms_3",
            PollPhase::PreSms(4) => "pre_sms_4",
            PollPhase::PreSms(_) => "pre_sms_5",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScheduleDecision {
    pub delay_secs: f64,
    /// Whether this item may ride a batched status call.
    pub batched: bool,
    pub phase: PollPhase,
}

// ── Tables ───────────────────────────────────────────────────────────────────

const POST_SMS_CYCLES: [[f64; 4]; 3] = [
    [3.0, 4.0, 5.0, 4.0],
    [5.0, 6.0, 7.0, 6.0],
    [8.0, 10.0, 12.0, 10.0],
];

/// Seconds since the last SMS separating the post-SMS tiers.
const POST_SMS_THRESHOLDS: [i64; 2] = [30, 120];

const PRE_SMS_CYCLES: [[f64; 4]; 6] = [
    [2.0, 3.0, 4.0, 5.0],
    [4.0, 5.0, 6.0, 7.0],
    [6.0, 8.0, 10.0, 8.0],
    [10.0, 12.0, 15.0, 12.0],
    [12.0, 15.0, 18.0, 15.0],
    [15.0, 20.0, 25.0, 20.0],
];

/// Order-age boundaries separating the pre-SMS tiers.
const PRE_SMS_THRESHOLDS: [i64; 6] = [30, 120, 300, 600, 900, 1200];

/// Pre-SMS items older than this ride batched calls.
const BATCH_AGE_SECS: i64 = 60;

// ── Schedule ─────────────────────────────────────────────────────────────────

/// Decide the next poll delay for one item. First matching rule wins.
pub fn next_poll<R: Rng>(input: ScheduleInput, rng: &mut R) -> ScheduleDecision {
    // Rule 1: breaker open — exponential backoff, single-call mode.
    if input.circuit_open {
        let exp = input.poll_attempt.min(5);
        let base = f64::min(30.0, 2f64.powi(exp as i32));
        return ScheduleDecision {
            delay_secs: base + rng.gen_range(0.0..2.0),
            batched: false,
            phase: PollPhase::CircuitOpen,
        };
    }

    // Rule 2: last poll errored — linear backoff, still batched.
    if input.last_poll_error {
        let base = f64::min(20.0, 5.0 + 2.0 * input.poll_attempt as f64);
        return ScheduleDecision {
            delay_secs: base + rng.gen_range(0.0..2.0),
            batched: true,
            phase: PollPhase::ErrorRetry,
        };
    }

    // Rule 3: a message already arrived — post-SMS cadence.
    if input.sms_count > 0 {
        let tier = POST_SMS_THRESHOLDS
            .iter()
            .position(|t| input.since_last_sms_secs < *t)
            .unwrap_or(POST_SMS_THRESHOLDS.len());
        let cycle = &POST_SMS_CYCLES[tier];
        let base = cycle[input.poll_attempt as usize % cycle.len()];
        return ScheduleDecision {
            delay_secs: jittered(base, rng),
            batched: false,
            phase: PollPhase::PostSms(tier),
        };
    }

    // Rule 4: waiting for the first message — age-tiered cadence.
    let tier = PRE_SMS_THRESHOLDS
        .iter()
        .position(|t| input.order_age_secs < *t)
        .unwrap_or(PRE_SMS_CYCLES.len() - 1);
    let cycle = &PRE_SMS_CYCLES[tier];
    let base = cycle[input.poll_attempt as usize % cycle.len()];
    ScheduleDecision {
        delay_secs: jittered(base, rng),
        batched: input.order_age_secs > BATCH_AGE_SECS,
        phase: PollPhase::PreSms(tier),
    }
}

fn jittered<R: Rng>(base: f64, rng: &mut R) -> f64 {
    base + rng.gen_range(0.0..base * 0.3)
}
