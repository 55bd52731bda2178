//! Scenarios over the driver signal primitive.

use dspq_testkit::Signaling;

const MODE: Signaling = Signaling::Driver;

#[test]
fn ping_pong() {
    dspq_testkit::run_ping_pong(MODE);
}

#[test]
fn fill_drain() {
    dspq_testkit::run_fill_drain(MODE);
}

#[test]
fn parameter_checks() {
    dspq_testkit::run_parameter_checks(MODE);
}

#[test]
fn wraparound() {
    dspq_testkit::run_wraparound(MODE);
}

#[test]
fn fifo_multiple_writers() {
    dspq_testkit::run_fifo_multiple_writers(MODE);
}

#[test]
fn blocking_wake() {
    dspq_testkit::run_blocking_wake(MODE);
}

#[test]
fn close_cancels_waiters() {
    dspq_testkit::run_close_cancels_waiters(MODE);
}

#[test]
fn domain_death() {
    dspq_testkit::run_domain_death(MODE);
}

#[test]
fn signal_failure_after_publish() {
    dspq_testkit::run_signal_failure_after_publish(MODE);
}

#[test]
fn signal_suppression() {
    dspq_testkit::run_signal_suppression(MODE);
}

#[test]
fn legacy_negotiation() {
    dspq_testkit::run_legacy_negotiation(MODE);
}

#[test]
fn early_wakeup() {
    dspq_testkit::run_early_wakeup(MODE);
}

#[test]
fn buffer_refs() {
    dspq_testkit::run_buffer_refs(MODE);
}

#[test]
fn import_rules() {
    dspq_testkit::run_import_rules(MODE);
}

#[test]
fn slot_exhaustion() {
    dspq_testkit::run_slot_exhaustion(MODE);
}

#[test]
fn callbacks() {
    dspq_testkit::run_callbacks(MODE);
}

#[test]
fn corruption() {
    dspq_testkit::run_corruption(MODE);
}

#[test]
fn multi_domain() {
    dspq_testkit::run_multi_domain(MODE);
}

#[test]
fn multi_domain_partial_failure() {
    dspq_testkit::run_multi_domain_partial_failure(MODE);
}
