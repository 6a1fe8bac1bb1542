//! Bounded, fixed-interval retry.
//!
//! Every check against the cluster is eventually consistent (boot time,
//! unseal propagation, DNS registration), so each one polls with an attempt
//! budget and interval chosen for that particular call site.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{HarnessError, Result};

/// Attempt budget and spacing for one kind of check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (values below 1 are treated as 1).
    pub max_attempts: u32,
    /// Delay between two consecutive attempts.
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl RetryPolicy {
    /// Build a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Build a policy with the interval in seconds.
    #[must_use]
    pub const fn secs(max_attempts: u32, interval_secs: u64) -> Self {
        Self::new(max_attempts, Duration::from_secs(interval_secs))
    }
}

/// Retry policies for every call site, overridable from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    /// Listing external addresses of the instance group.
    pub list_addresses: RetryPolicy,
    /// Listing member instances of the instance group (bastion mode).
    pub list_instances: RetryPolicy,
    /// Plain `exit` over ssh until the transport works.
    pub ssh_reachable: RetryPolicy,
    /// Health probe until a node reports the expected status.
    pub node_status: RetryPolicy,
    /// Combined unseal command.
    pub unseal: RetryPolicy,
    /// `vault status` against the Consul DNS name.
    pub consul_dns: RetryPolicy,
    /// `vault --version` edition check.
    pub enterprise_version: RetryPolicy,
    /// Init status through the external endpoint.
    pub external_endpoint: RetryPolicy,
    /// Secret served by the example web client.
    pub web_client: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            list_addresses: RetryPolicy::secs(10, 10),
            list_instances: RetryPolicy::secs(30, 10),
            ssh_reachable: RetryPolicy::secs(30, 10),
            node_status: RetryPolicy::secs(30, 10),
            unseal: RetryPolicy::secs(10, 10),
            consul_dns: RetryPolicy::secs(10, 5),
            enterprise_version: RetryPolicy::secs(10, 5),
            external_endpoint: RetryPolicy::secs(30, 10),
            web_client: RetryPolicy::secs(30, 10),
        }
    }
}

impl RetryPolicies {
    /// Every policy set to the same attempt count with no delay.
    ///
    /// Meant for tests driving scripted transports.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        let p = RetryPolicy::new(max_attempts, Duration::ZERO);
        Self {
            list_addresses: p,
            list_instances: p,
            ssh_reachable: p,
            node_status: p,
            unseal: p,
            consul_dns: p,
            enterprise_version: p,
            external_endpoint: p,
            web_client: p,
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// Attempts are strictly sequential. There is no sleep after the final
/// attempt. On exhaustion the last error is returned wrapped together with
/// `description`.
///
/// # Errors
/// Returns [`HarnessError::RetryExhausted`] holding the last error if all
/// attempts fail.
pub async fn do_with_retry<T, F, Fut>(
    description: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    info!(description, max_attempts, "Starting");

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                debug!(description, attempt, "Succeeded");
                return Ok(value);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(HarnessError::RetryExhausted {
                        description: description.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }

                info!(
                    "{description} returned an error (attempt {attempt}/{max_attempts}): {e}. Sleeping for {:?}...",
                    policy.interval
                );

                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn failing(msg: &str) -> HarnessError {
        HarnessError::verification("test", msg)
    }

    #[tokio::test]
    async fn test_gives_up_after_exactly_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<String> =
            do_with_retry("always failing", RetryPolicy::new(4, Duration::ZERO), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(failing(&format!("failure {n}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            HarnessError::RetryExhausted {
                description,
                attempts,
                source,
            } => {
                assert_eq!(description, "always failing");
                assert_eq!(attempts, 4);
                assert!(source.to_string().contains("failure 4"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_short_circuits_on_first_success() {
        let calls = AtomicU32::new(0);

        let result = do_with_retry("flaky", RetryPolicy::new(10, Duration::ZERO), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 3 {
                    Err(failing("not yet"))
                } else {
                    Ok(format!("ok after {n}"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "ok after 4");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);

        let _ = do_with_retry("zero", RetryPolicy::new(0, Duration::ZERO), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(failing("nope")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_policies_match_operational_values() {
        let p = RetryPolicies::default();
        assert_eq!(p.list_addresses, RetryPolicy::secs(10, 10));
        assert_eq!(p.node_status, RetryPolicy::secs(30, 10));
        assert_eq!(p.consul_dns, RetryPolicy::secs(10, 5));
    }

    #[test]
    fn test_policies_deserialize_partially_from_toml() {
        let p: RetryPolicies = toml::from_str(
            r"
            [consul_dns]
            max_attempts = 20
            interval = 3
            ",
        )
        .unwrap();

        assert_eq!(p.consul_dns, RetryPolicy::secs(20, 3));
        assert_eq!(p.node_status, RetryPolicies::default().node_status);
    }
}
