use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::content::ContentScanner;
use super::loop_detector::LoopDetector;
use super::rate_limiter::SlidingWindowLimiter;
use crate::config::SafetyConfig;
use crate::types::{SafetyLevel, SafetyViolation, ViolationKind};

/// Releases one concurrent-request slot when dropped.
pub struct RequestPermit {
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for RequestPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPermit").finish_non_exhaustive()
    }
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize)]
pub struct ApiValidation {
    pub is_safe: bool,
    pub violation_type: Option<ViolationKind>,
    pub reason: Option<String>,
    #[serde(skip)]
    pub permit: Option<RequestPermit>,
}

impl ApiValidation {
    fn allowed(permit: RequestPermit) -> Self {
        Self {
            is_safe: true,
            violation_type: None,
            reason: None,
            permit: Some(permit),
        }
    }

    fn denied(kind: ViolationKind, reason: String) -> Self {
        Self {
            is_safe: false,
            violation_type: Some(kind),
            reason: Some(reason),
            permit: None,
        }
    }
}

/// Point-in-time verdict consumed by the workflow state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyAssessment {
    pub level: SafetyLevel,
    pub consecutive_errors: u32,
    pub error_limit_reached: bool,
    pub loop_detected: bool,
    pub is_safe: bool,
}

impl SafetyAssessment {
    /// Denied only because of the consecutive-error counter.
    pub fn error_limit_only(&self) -> bool {
        !self.is_safe && self.error_limit_reached && !self.level.blocks_progress()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub level: SafetyLevel,
    pub is_safe: bool,
    pub consecutive_errors: u32,
    pub max_consecutive_errors: u32,
    pub requests_in_window: usize,
    pub max_requests_per_window: u32,
    pub in_flight_requests: usize,
    pub max_concurrent_requests: u32,
    pub loop_detected: bool,
    pub violations_in_window: usize,
    pub total_violations: usize,
    pub violation_counts: BTreeMap<String, usize>,
    pub recent_violations: Vec<SafetyViolation>,
    pub checked_at: DateTime<Utc>,
}

struct SafetyState {
    config: SafetyConfig,
    limiter: SlidingWindowLimiter,
    loops: LoopDetector,
    scanner: ContentScanner,
    violations: VecDeque<SafetyViolation>,
    consecutive_errors: u32,
    error_burst_recorded: bool,
    loop_detected: bool,
}

impl SafetyState {
    fn new(config: SafetyConfig) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(
                config.max_requests_per_window,
                config.rate_window_secs,
            ),
            loops: LoopDetector::new(config.loop_detection_threshold, config.loop_history_len),
            scanner: ContentScanner::new(&config.self_invocation_commands),
            violations: VecDeque::new(),
            consecutive_errors: 0,
            error_burst_recorded: false,
            loop_detected: false,
            config,
        }
    }

    fn record(&mut self, violation: SafetyViolation) {
        match violation.kind {
            ViolationKind::CriticalError => {
                log::error!("Safety violation {}: {}", violation.kind.as_str(), violation.context)
            }
            _ => log::warn!("Safety violation {}: {}", violation.kind.as_str(), violation.context),
        }
        self.violations.push_back(violation);
        while self.violations.len() > self.config.max_violation_history {
            self.violations.pop_front();
        }
    }

    fn in_window(&self, now: DateTime<Utc>) -> impl Iterator<Item = &SafetyViolation> {
        let cutoff = now - Duration::seconds(self.config.violation_window_secs as i64);
        self.violations.iter().filter(move |v| v.timestamp > cutoff)
    }

    fn level_at(&self, now: DateTime<Utc>) -> SafetyLevel {
        let mut count = 0u32;
        let mut critical = false;
        for violation in self.in_window(now) {
            count += 1;
            critical |= violation.kind == ViolationKind::CriticalError;
        }

        if critical || count >= self.config.critical_violations {
            SafetyLevel::Critical
        } else if count >= self.config.warning_violations {
            SafetyLevel::Warning
        } else if count >= self.config.caution_violations {
            SafetyLevel::Caution
        } else {
            SafetyLevel::Normal
        }
    }

    fn assess_at(&self, now: DateTime<Utc>) -> SafetyAssessment {
        let level = self.level_at(now);
        let error_limit_reached = self.consecutive_errors >= self.config.max_consecutive_errors;
        SafetyAssessment {
            level,
            consecutive_errors: self.consecutive_errors,
            error_limit_reached,
            loop_detected: self.loop_detected,
            is_safe: !level.blocks_progress() && !error_limit_reached,
        }
    }
}

/// Guard consulted before every cycle and every outbound action.
///
/// All counters live behind one mutex; the concurrent-request count is an
/// atomic shared with outstanding [`RequestPermit`]s.
pub struct SafetyOrchestrator {
    state: Mutex<SafetyState>,
    in_flight: Arc<AtomicUsize>,
}

impl SafetyOrchestrator {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            state: Mutex::new(SafetyState::new(config)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SafetyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_safe_to_proceed(&self) -> bool {
        self.assess().is_safe
    }

    pub fn assess(&self) -> SafetyAssessment {
        self.lock().assess_at(Utc::now())
    }

    pub fn level_at(&self, now: DateTime<Utc>) -> SafetyLevel {
        self.lock().level_at(now)
    }

    pub fn validate_api_request(&self, kind: &str) -> ApiValidation {
        self.validate_api_request_at(kind, Utc::now())
    }

    pub fn validate_api_request_at(&self, kind: &str, now: DateTime<Utc>) -> ApiValidation {
        let mut state = self.lock();

        let in_flight = self.in_flight.load(Ordering::SeqCst);
        let max_concurrent = state.config.max_concurrent_requests as usize;
        if in_flight >= max_concurrent {
            let reason = format!(
                "{} concurrent requests in flight (max {})",
                in_flight, max_concurrent
            );
            state.record(SafetyViolation::at(
                ViolationKind::RateLimit,
                json!({ "request_kind": kind, "description": reason, "in_flight": in_flight }),
                now,
            ));
            return ApiValidation::denied(ViolationKind::RateLimit, reason);
        }

        if !state.limiter.try_acquire_at(now) {
            let retry_after = state.limiter.retry_after_at(now);
            let reason = format!(
                "rate limit of {} requests per {}s exceeded",
                state.config.max_requests_per_window, state.config.rate_window_secs
            );
            state.record(SafetyViolation::at(
                ViolationKind::RateLimit,
                json!({
                    "request_kind": kind,
                    "description": reason,
                    "retry_after_secs": retry_after,
                }),
                now,
            ));
            return ApiValidation::denied(ViolationKind::RateLimit, reason);
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        ApiValidation::allowed(RequestPermit {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Scans hook or command text for self-invoking unbounded loops.
    ///
    /// Every finding is recorded as a `DANGEROUS_CONTENT` violation.
    pub fn validate_hook_content(&self, text: &str) -> (bool, Vec<SafetyViolation>) {
        let mut state = self.lock();
        let findings = state.scanner.scan(text);
        let now = Utc::now();

        let violations: Vec<SafetyViolation> = findings
            .into_iter()
            .map(|finding| {
                SafetyViolation::at(
                    ViolationKind::DangerousContent,
                    json!({
                        "rule": finding.rule,
                        "description": finding.description,
                        "excerpt": finding.excerpt,
                    }),
                    now,
                )
            })
            .collect();

        for violation in &violations {
            state.record(violation.clone());
        }
        (violations.is_empty(), violations)
    }

    pub fn handle_safety_violation(&self, kind: ViolationKind, context: Value) -> SafetyLevel {
        let now = Utc::now();
        let mut state = self.lock();
        state.record(SafetyViolation::at(kind, context, now));
        let level = state.level_at(now);
        if level.blocks_progress() {
            log::warn!("Safety level is now {}", level.as_str());
        }
        level
    }

    /// Counts a failed task. Reaching the maximum records one `ERROR_BURST`
    /// per burst. Returns the consecutive-error count.
    pub fn record_task_failure(&self, reason: &str) -> u32 {
        let mut state = self.lock();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        let count = state.consecutive_errors;

        if count >= state.config.max_consecutive_errors && !state.error_burst_recorded {
            state.error_burst_recorded = true;
            let max = state.config.max_consecutive_errors;
            state.record(SafetyViolation::new(
                ViolationKind::ErrorBurst,
                json!({
                    "description": format!("{} consecutive task failures", count),
                    "last_error": reason,
                    "max_consecutive_errors": max,
                }),
            ));
        }
        count
    }

    pub fn record_task_success(&self) {
        let mut state = self.lock();
        state.consecutive_errors = 0;
        state.error_burst_recorded = false;
    }

    pub fn reset_error_counter(&self) {
        let mut state = self.lock();
        if state.consecutive_errors > 0 {
            log::info!(
                "Resetting consecutive error counter from {}",
                state.consecutive_errors
            );
        }
        state.consecutive_errors = 0;
        state.error_burst_recorded = false;
    }

    /// Feeds an action fingerprint to loop detection; true when a loop was
    /// just detected.
    pub fn record_action(&self, fingerprint: &str) -> bool {
        let mut state = self.lock();
        if !state.loops.record(fingerprint) {
            return false;
        }
        state.loop_detected = true;
        let threshold = state.config.loop_detection_threshold;
        state.record(SafetyViolation::new(
            ViolationKind::LoopDetected,
            json!({
                "description": format!("same action repeated {} times", threshold),
                "fingerprint": fingerprint,
            }),
        ));
        true
    }

    pub fn clear_loop_detection(&self) {
        let mut state = self.lock();
        state.loop_detected = false;
        state.loops.clear();
    }

    /// Applies new bounds. Violation history and admitted requests are kept.
    pub fn reconfigure(&self, config: SafetyConfig) {
        let mut state = self.lock();
        state
            .limiter
            .reconfigure(config.max_requests_per_window, config.rate_window_secs);
        state
            .loops
            .reconfigure(config.loop_detection_threshold, config.loop_history_len);
        if state.scanner.commands() != config.self_invocation_commands.as_slice() {
            state.scanner = ContentScanner::new(&config.self_invocation_commands);
        }
        state.config = config;
        let max = state.config.max_violation_history;
        while state.violations.len() > max {
            state.violations.pop_front();
        }
    }

    pub fn get_comprehensive_safety_status(&self) -> SafetyStatus {
        let now = Utc::now();
        let mut state = self.lock();
        let assessment = state.assess_at(now);
        let requests_in_window = state.limiter.count_at(now);

        let mut violation_counts = BTreeMap::new();
        let mut violations_in_window = 0;
        for violation in state.in_window(now) {
            violations_in_window += 1;
            *violation_counts
                .entry(violation.kind.as_str().to_string())
                .or_insert(0) += 1;
        }

        let recent_violations = state
            .violations
            .iter()
            .rev()
            .take(10)
            .cloned()
            .collect();

        SafetyStatus {
            level: assessment.level,
            is_safe: assessment.is_safe,
            consecutive_errors: state.consecutive_errors,
            max_consecutive_errors: state.config.max_consecutive_errors,
            requests_in_window,
            max_requests_per_window: state.limiter.max_requests(),
            in_flight_requests: self.in_flight.load(Ordering::SeqCst),
            max_concurrent_requests: state.config.max_concurrent_requests,
            loop_detected: state.loop_detected,
            violations_in_window,
            total_violations: state.violations.len(),
            violation_counts,
            recent_violations,
            checked_at: now,
        }
    }
}
