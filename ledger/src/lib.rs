// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod chain_client;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod rates;
pub mod reconciler;
pub mod sequential_queue;
pub mod simulator;
pub mod store;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub mod test_utils;

/// Retries a fallible async call with exponential backoff.
///
/// Only errors with `is_retryable()` are retried. After `max_attempts`
/// tries the last error is wrapped in `LedgerError::RetriesExhausted`.
/// Evaluates to `(LedgerResult<T>, attempts)`.
#[macro_export]
macro_rules! retry_with_max_attempts {
    ($func:expr, $fetch_config:expr) => {{
        let fetch_config: &$crate::config::FetchConfig = $fetch_config;
        // 0.4, 0.8, 1.6, 3.2, ... capped at max_backoff_secs, applied with jitter
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(fetch_config.initial_backoff_ms),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(fetch_config.max_backoff_secs),
            max_elapsed_time: None,
            ..Default::default()
        };
        let max_attempts = fetch_config.max_attempts;
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = backoff::future::retry(backoff, || {
            let fut = async {
                let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                match $func.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && attempt < max_attempts => {
                        tracing::debug!("Retrying after attempt {}: {:?}", attempt, e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) if e.is_retryable() => Err(backoff::Error::permanent(
                        $crate::error::LedgerError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        },
                    )),
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await;
        (result, attempts.load(std::sync::atomic::Ordering::SeqCst))
    }};
}

#[cfg(test)]
mod tests {
    use crate::config::FetchConfig;
    use crate::error::{LedgerError, LedgerResult};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> FetchConfig {
        FetchConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_secs: 1,
            ..Default::default()
        }
    }

    async fn flaky(calls: &AtomicU32, fail_times: u32, error: LedgerError) -> LedgerResult<u32> {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= fail_times {
            Err(error)
        } else {
            Ok(call)
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = fast_config(5);
        let (result, attempts) = retry_with_max_attempts!(
            flaky(&calls, 2, LedgerError::Rpc("timeout".into())),
            &config
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let config = fast_config(3);
        let (result, attempts) = retry_with_max_attempts!(
            flaky(&calls, 10, LedgerError::Provider("reset".into())),
            &config
        );
        assert_eq!(attempts, 3);
        assert!(matches!(
            result,
            Err(LedgerError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let config = fast_config(5);
        let (result, attempts) = retry_with_max_attempts!(
            flaky(&calls, 10, LedgerError::MissingPledgeAdmin(3)),
            &config
        );
        assert_eq!(attempts, 1);
        assert_eq!(result.unwrap_err(), LedgerError::MissingPledgeAdmin(3));
    }
}
