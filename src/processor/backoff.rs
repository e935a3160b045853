use crate::ledger::LedgerError;
use crate::runtime::config::IndexerConfig;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Owned retry settings shared by every stage that talks to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: usize,
}

impl RetryPolicy {
    pub(crate) fn from_config(config: &IndexerConfig) -> Self {
        Self {
            initial_delay: config.initial_backoff(),
            max_delay: config.max_backoff(),
            max_attempts: config.max_attempts(),
        }
    }

    pub(crate) fn backoff<'a>(&self, token: &'a CancellationToken) -> RetryBackoff<'a> {
        RetryBackoff::new(self.initial_delay, self.max_delay)
            .with_max_attempts(self.max_attempts)
            .with_cancellation(token)
    }
}

#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<usize>,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
            cancellation: None,
        }
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    Abort,
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub(crate) enum RetryFailure<E> {
    Cancelled,
    Aborted(E),
    Exhausted { attempts: usize, last: E },
}

impl<E: fmt::Display> fmt::Display for RetryFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryFailure::Cancelled => write!(f, "retry cancelled"),
            RetryFailure::Aborted(err) => write!(f, "{err}"),
            RetryFailure::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
        }
    }
}

impl<E> RetryFailure<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Converts a non-cancellation failure into an error; `None` when cancelled.
    pub(crate) fn into_error(self) -> Option<anyhow::Error> {
        match self {
            RetryFailure::Cancelled => None,
            RetryFailure::Aborted(err) => Some(err.into()),
            RetryFailure::Exhausted { attempts, last } => Some(
                anyhow::Error::new(last).context(format!("gave up after {attempts} attempts")),
            ),
        }
    }
}

pub(crate) async fn retry_with_backoff<'a, T, E, F, Fut, L, C>(
    config: RetryBackoff<'a>,
    mut operation: F,
    mut on_retry: L,
    mut classify_error: C,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    L: FnMut(usize, Duration, &E, bool),
    C: FnMut(usize, &E) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = config.initial_delay;

    loop {
        attempt += 1;

        let result = match config.cancellation {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(RetryFailure::Cancelled);
                }
                tokio::select! {
                    _ = token.cancelled() => return Err(RetryFailure::Cancelled),
                    result = operation(attempt) => result,
                }
            }
            None => operation(attempt).await,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) => match classify_error(attempt, &err) {
                RetryDisposition::Abort => return Err(RetryFailure::Aborted(err)),
                RetryDisposition::Retry => {
                    let exhausted = config
                        .max_attempts
                        .map(|max| attempt >= max)
                        .unwrap_or(false);

                    on_retry(attempt, backoff, &err, !exhausted);

                    if exhausted {
                        return Err(RetryFailure::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }

                    if !sleep_with_cancellation(backoff, config.cancellation).await {
                        return Err(RetryFailure::Cancelled);
                    }
                    backoff = next_backoff(backoff, config.max_delay);
                }
            },
        }
    }
}

/// Retries a ledger call, treating every non-fatal [`LedgerError`] as transient.
pub(crate) async fn retry_ledger_call<'a, T, F, Fut, L>(
    config: RetryBackoff<'a>,
    operation: F,
    on_retry: L,
) -> Result<T, RetryFailure<LedgerError>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
    L: FnMut(usize, Duration, &LedgerError, bool),
{
    retry_with_backoff(config, operation, on_retry, |_, err: &LedgerError| {
        if err.is_retryable() {
            RetryDisposition::Retry
        } else {
            RetryDisposition::Abort
        }
    })
    .await
}

/// Sleeps for `delay`; returns `false` if cancellation fired first.
pub(crate) async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> bool {
    if delay.is_zero() {
        yield_now().await;
        return cancellation.map_or(true, |token| !token.is_cancelled());
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => false,
            _ = sleep(delay) => true,
        }
    } else {
        sleep(delay).await;
        true
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_backoff {
        next = max_backoff;
    }
    next
}
