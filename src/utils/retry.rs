//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Only the change feed
//! retries on its own; claims and transfers are never retried here.

use backon::ExponentialBuilder;

use crate::config::FeedConfig;

/// Backoff for silent resubscription after a feed disconnect.
///
/// - Min delay: `feed.reconnect_min_delay_ms`
/// - Max delay: `feed.reconnect_max_delay_ms`
/// - Unbounded attempts
/// - Jitter enabled
pub fn feed_backoff(config: &FeedConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.reconnect_min_delay())
        .with_max_delay(config.reconnect_max_delay())
        .with_max_times(usize::MAX)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;
    use std::time::Duration;

    #[test]
    fn test_feed_backoff_never_gives_up() {
        let config = FeedConfig {
            reconnect_min_delay_ms: 1,
            reconnect_max_delay_ms: 4,
            ..FeedConfig::default()
        };
        let mut delays = feed_backoff(&config).build();
        for _ in 0..200 {
            let delay = delays.next().unwrap();
            // Jitter adds at most one extra delay on top of the cap.
            assert!(delay <= Duration::from_millis(8));
        }
    }
}
