//! Safety orchestrator behaviour over time: rate windows, violation aging
//! and content checks feeding the overall level.

use chrono::{Duration, Utc};
use serde_json::json;

use nova_ecosystem::config::SafetyConfig;
use nova_ecosystem::safety::SafetyOrchestrator;
use nova_ecosystem::types::{SafetyLevel, ViolationKind};

fn create_test_safety(max_requests: u32, window_secs: u64) -> SafetyOrchestrator {
    SafetyOrchestrator::new(SafetyConfig {
        max_requests_per_window: max_requests,
        rate_window_secs: window_secs,
        ..SafetyConfig::default()
    })
}

#[test]
fn test_rate_window_rolls_over() {
    let safety = create_test_safety(3, 60);
    let start = Utc::now();

    for i in 0..3 {
        let validation = safety.validate_api_request_at("task_execution", start + Duration::seconds(i));
        assert!(validation.is_safe);
    }
    let denied = safety.validate_api_request_at("task_execution", start + Duration::seconds(10));
    assert!(!denied.is_safe);
    assert_eq!(denied.violation_type, Some(ViolationKind::RateLimit));

    let later = safety.validate_api_request_at("task_execution", start + Duration::seconds(61));
    assert!(later.is_safe);
}

#[test]
fn test_violations_age_out_of_window() {
    let safety = create_test_safety(25, 60);
    for _ in 0..3 {
        safety.handle_safety_violation(ViolationKind::LoopDetected, json!({}));
    }
    let now = Utc::now();
    assert_eq!(safety.level_at(now), SafetyLevel::Warning);
    assert!(safety.level_at(now).blocks_progress());

    assert_eq!(safety.level_at(now + Duration::seconds(301)), SafetyLevel::Normal);
}

#[test]
fn test_dangerous_hooks_raise_level() {
    let safety = create_test_safety(25, 60);
    let hook = "#!/bin/sh\nwhile true; do\n  claude -p \"continue\"\ndone\n";

    let (safe, violations) = safety.validate_hook_content(hook);
    assert!(!safe);
    assert_eq!(violations.len(), 1);
    assert_eq!(safety.level_at(Utc::now()), SafetyLevel::Caution);

    let (safe, violations) = safety.validate_hook_content("for f in *.rs; do claude review $f; done");
    assert!(safe);
    assert!(violations.is_empty());
}

#[test]
fn test_success_clears_error_streak() {
    let safety = create_test_safety(25, 60);
    for _ in 0..4 {
        safety.record_task_failure("boom");
    }
    assert!(!safety.assess().error_limit_reached);
    safety.record_task_success();
    assert_eq!(safety.assess().consecutive_errors, 0);

    for _ in 0..5 {
        safety.record_task_failure("boom");
    }
    let assessment = safety.assess();
    assert!(assessment.error_limit_reached);
    assert!(assessment.error_limit_only());
    assert!(!assessment.is_safe);
}
