use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::service::probe::{ConnectivityProbe, ConnectivityReading, ProbeEndpoint};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

// Stand-in for "never" when a deadline would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("Timeout waiting for connection after {elapsed:?} ({attempts} attempts)")]
    Timeout { elapsed: Duration, attempts: u32 },
    #[error("Polling cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

/// Probes an endpoint on a fixed cadence until it reports an identity.
///
/// Probe failures are the expected state while a tunnel comes back up, so
/// they are logged and swallowed. Only the deadline (or cancellation) ends
/// the loop without a reading.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for Poller {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl Poller {
    pub fn new(interval: Duration, max_wait: Duration) -> Self {
        Self { interval, max_wait }
    }

    pub async fn wait_for_reading(
        &self,
        probe: &dyn ConnectivityProbe,
        endpoint: &ProbeEndpoint,
    ) -> Result<ConnectivityReading, PollError> {
        self.wait_for_reading_or_cancel(probe, endpoint, std::future::pending())
            .await
    }

    pub async fn wait_for_reading_or_cancel<C>(
        &self,
        probe: &dyn ConnectivityProbe,
        endpoint: &ProbeEndpoint,
        cancel: C,
    ) -> Result<ConnectivityReading, PollError>
    where
        C: Future<Output = ()>,
    {
        log::info!("Waiting for connection on {endpoint}...");

        let start = Instant::now();
        let deadline = tokio::time::sleep_until(instant_after(start, self.max_wait));
        // First attempt one interval in, same as a plain ticker
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(instant_after(start, period), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(deadline);
        tokio::pin!(cancel);

        let mut attempts = 0u32;
        loop {
            let attempt = async {
                ticker.tick().await;
                probe.probe(endpoint).await
            };

            tokio::select! {
                biased;
                _ = &mut cancel => {
                    log::warn!("Stopped waiting for {endpoint}: cancelled");
                    return Err(PollError::Cancelled { attempts });
                }
                _ = &mut deadline => {
                    return Err(PollError::Timeout {
                        elapsed: start.elapsed(),
                        attempts,
                    });
                }
                result = attempt => {
                    attempts += 1;
                    match result {
                        Ok(reading) => {
                            log::info!(
                                "Connection on {endpoint} restored after {attempts} attempts ({:?})",
                                start.elapsed()
                            );
                            return Ok(reading);
                        }
                        Err(e) => log::info!("Waiting for connection on {endpoint}... ({e})"),
                    }
                }
            }
        }
    }
}

fn instant_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .unwrap_or_else(|| start + FAR_FUTURE)
}
