//! Bounded, improvement-gated retry policy for step verification.
//!
//! Every step gets at most [`MAX_ATTEMPTS`] attempts. After a rejected attempt
//! the tracker compares it against the best attempt seen so far and only
//! authorizes another try while attempts keep improving; two consecutive
//! non-improving attempts stop the loop early.
//!
//! Quality proxy: `confidence / (1 + missing)` from the judge verdict, clamped
//! to `[0, 1]`. A tool failure is never judged and scores zero. An attempt
//! improves on the best one when its quality beats it by more than
//! `min_improvement` and its sampled output is not near-identical to the best
//! output (token Jaccard similarity below `similarity_ceiling`). Long outputs
//! are sampled head + tail + evenly spaced middle windows so the comparison
//! covers the whole document.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Hard ceiling on attempts per step, regardless of configuration.
pub const MAX_ATTEMPTS: u32 = 6;

/// Number of windows taken from the middle of a long output.
const MIDDLE_WINDOWS: usize = 4;
const GAP_MARKER: &str = "\n[...]\n";

/// Missing items and output tail forwarded to the next attempt.
const FEEDBACK_MISSING_ITEMS: usize = 8;
const FEEDBACK_TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_improvement: f64,
    pub max_stale_attempts: u32,
    pub sample_chars: usize,
    pub similarity_ceiling: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            min_improvement: 0.05,
            max_stale_attempts: 2,
            sample_chars: 12_000,
            similarity_ceiling: 0.95,
        }
    }
}

/// Judge response for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_done: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub rationale: String,
}

impl Verdict {
    pub fn quality(&self) -> f64 {
        let confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        confidence / (1.0 + self.missing.len() as f64)
    }
}

/// One recorded attempt at a step.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub output: String,
    pub success: bool,
    /// `None` when the tool failed and the judge was skipped.
    pub verdict: Option<Verdict>,
    pub quality: f64,
    pub improved: bool,
}

impl Attempt {
    pub fn confidence(&self) -> f64 {
        self.verdict.as_ref().map_or(0.0, |v| v.confidence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    NotImproving,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::NotImproving => "not_improving",
        }
    }
}

/// What the dispatcher should do after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Retry,
    Stop(StopReason),
}

/// Context handed to the next attempt after a rejection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryFeedback {
    /// Attempt number that was rejected.
    pub attempt: u32,
    pub max_attempts: u32,
    pub rationale: String,
    pub missing: Vec<String>,
    pub previous_output_tail: String,
}

/// Per-step attempt bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    attempts: Vec<Attempt>,
    best: Option<usize>,
    stale: u32,
}

impl RetryTracker {
    pub fn new(mut policy: RetryPolicy) -> Self {
        policy.max_attempts = policy.max_attempts.clamp(1, MAX_ATTEMPTS);
        policy.max_stale_attempts = policy.max_stale_attempts.max(1);
        Self {
            policy,
            attempts: Vec::new(),
            best: None,
            stale: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn next_attempt(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    /// Highest-quality attempt so far; ties keep the earlier attempt.
    pub fn best(&self) -> Option<&Attempt> {
        self.best.and_then(|idx| self.attempts.get(idx))
    }

    pub fn last(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Sample of `text` sized for comparison and judging.
    pub fn sample(&self, text: &str) -> String {
        sample_output(text, self.policy.sample_chars)
    }

    /// Record an attempt and decide what happens next.
    ///
    /// `verdict` must be `None` for tool failures.
    pub fn record(&mut self, output: String, success: bool, verdict: Option<Verdict>) -> Decision {
        let number = self.next_attempt();
        let accepted = success && verdict.as_ref().is_some_and(|v| v.is_done);
        let quality = match (&verdict, success) {
            (Some(v), true) => v.quality(),
            _ => 0.0,
        };

        let (improved, new_best) = match self.best() {
            None => (true, true),
            Some(best) => {
                let distinct = similarity(&self.sample(&output), &self.sample(&best.output))
                    < self.policy.similarity_ceiling;
                (
                    distinct && quality > best.quality + self.policy.min_improvement,
                    quality > best.quality,
                )
            }
        };

        self.attempts.push(Attempt {
            number,
            output,
            success,
            verdict,
            quality,
            improved,
        });
        if accepted || new_best {
            self.best = Some(self.attempts.len() - 1);
        }
        if accepted {
            return Decision::Accept;
        }

        if improved {
            self.stale = 0;
        } else {
            self.stale += 1;
        }
        if number >= self.policy.max_attempts {
            return Decision::Stop(StopReason::BudgetExhausted);
        }
        if self.stale >= self.policy.max_stale_attempts {
            return Decision::Stop(StopReason::NotImproving);
        }
        Decision::Retry
    }

    /// Feedback for the attempt after the last rejected one.
    pub fn feedback(&self) -> Option<RetryFeedback> {
        let last = self.attempts.last()?;
        let (rationale, missing) = match &last.verdict {
            Some(verdict) => (
                verdict.rationale.clone(),
                verdict
                    .missing
                    .iter()
                    .take(FEEDBACK_MISSING_ITEMS)
                    .cloned()
                    .collect(),
            ),
            None => (
                "the previous attempt reported a tool failure".to_string(),
                Vec::new(),
            ),
        };
        Some(RetryFeedback {
            attempt: last.number,
            max_attempts: self.policy.max_attempts,
            rationale,
            missing,
            previous_output_tail: tail_chars(&last.output, FEEDBACK_TAIL_CHARS),
        })
    }
}

/// Fixed-size sample of `text`: head, tail and evenly spaced middle windows.
///
/// Texts within `max_chars` are returned whole. Windows are cut on char
/// boundaries.
pub fn sample_output(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total <= max_chars {
        return text.to_string();
    }
    let window = max_chars / 4;
    if window == 0 {
        return chars[..max_chars].iter().collect();
    }

    let span = total - 2 * window;
    let middle_len = (max_chars - 2 * window) / MIDDLE_WINDOWS;
    let mut pieces: Vec<String> = Vec::with_capacity(MIDDLE_WINDOWS + 2);
    pieces.push(chars[..window].iter().collect());
    if middle_len > 0 {
        let upper = total - window - middle_len;
        for i in 0..MIDDLE_WINDOWS {
            let center = window + span * (2 * i + 1) / (2 * MIDDLE_WINDOWS);
            let start = center
                .saturating_sub(middle_len / 2)
                .max(window)
                .min(upper);
            pieces.push(chars[start..start + middle_len].iter().collect());
        }
    }
    pieces.push(chars[total - window..].iter().collect());
    pieces.join(GAP_MARKER)
}

/// Jaccard similarity of lowercase word tokens, in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.len() + right.len() - shared;
    shared as f64 / union as f64
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn tail_chars(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(limit)).collect()
}
