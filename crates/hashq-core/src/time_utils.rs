/// Milliseconds since the Unix epoch, saturating instead of panicking.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Milliseconds elapsed since `earlier_unix_ms`; zero if it lies in the future.
pub fn elapsed_ms_since(earlier_unix_ms: u64) -> u64 {
    current_unix_timestamp_ms().saturating_sub(earlier_unix_ms)
}
