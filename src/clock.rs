use std::time::Instant;

/// Current time from the tokio clock, in the form the protocol core takes.
///
/// Reading through tokio keeps cooldowns and deadlines consistent with
/// paused time in tests.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
