use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::exchange::{ExchangeError, TokenExchanger};
use crate::identity::{HealthState, Identity};

/// Consecutive failures before an identity is considered degraded.
pub const DEGRADED_THRESHOLD: u32 = 1;
/// Consecutive failures before an identity is quarantined.
pub const QUARANTINE_THRESHOLD: u32 = 3;
/// Quarantined identities become selectable again after this cool-down.
pub const QUARANTINE_COOLDOWN_SECS: i64 = 30 * 60;

/// Classification of a request failure for pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401/403 or a body naming an invalid token. Quarantines immediately
    /// and flags the identity for refresh.
    Auth,
    /// Upstream replied with an error status.
    Upstream,
    /// Connection-level failure before any response arrived.
    Transport,
}

/// Aggregate counts for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub quarantined: usize,
    pub initialized: bool,
    /// Soonest token expiry across the pool, unix seconds.
    pub soonest_expiry: Option<i64>,
}

/// Per-identity result of a refresh sweep.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub id: String,
    pub refreshed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct PoolInner {
    identities: Vec<Identity>,
    cursor: usize,
    initialized: bool,
}

/// Shared identity registry. A single mutex guards the ordered identity list
/// and the round-robin cursor; the lock is never held across I/O.
pub struct IdentityPool {
    inner: Mutex<PoolInner>,
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                identities: Vec::new(),
                cursor: 0,
                initialized: false,
            }),
        }
    }

    /// Load credential pairs into the pool. Identities whose token is missing
    /// or expired get a cookie → token exchange before admission; the outcome
    /// is recorded in their health state. Safe to call once at startup; later
    /// calls are no-ops.
    pub async fn initialize(&self, pairs: Vec<(String, String)>, exchanger: &dyn TokenExchanger) {
        if self.inner.lock().unwrap().initialized {
            return;
        }

        let mut identities = Vec::with_capacity(pairs.len());
        for (n, (token, cookie)) in pairs.into_iter().enumerate() {
            let mut ident = Identity::new(format!("qwen-{}", n + 1), token, cookie);

            if ident.is_token_expired() {
                match self.admit_exchange(&mut ident, exchanger).await {
                    Ok(()) => {
                        info!(identity = %ident.id, "admitted with refreshed token");
                    }
                    Err(e) => {
                        warn!(identity = %ident.id, error = %e, "token exchange failed at startup");
                        ident.health = HealthState::Quarantined;
                        ident.quarantined_at = Some(Utc::now().timestamp());
                        ident.needs_refresh = true;
                        ident.refresh_failures = 1;
                    }
                }
            }

            identities.push(ident);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.initialized {
            return;
        }
        info!(identities = identities.len(), "identity pool initialized");
        inner.identities = identities;
        inner.initialized = true;
    }

    async fn admit_exchange(
        &self,
        ident: &mut Identity,
        exchanger: &dyn TokenExchanger,
    ) -> Result<(), ExchangeError> {
        if ident.cookie.is_empty() {
            return Err(ExchangeError::MissingCookie);
        }
        let refreshed = exchanger.exchange(&ident.cookie).await?;
        ident.token = refreshed.token;
        ident.last_refresh_at = Some(Utc::now().timestamp());
        Ok(())
    }

    /// Select an identity for a request, or `None` if nothing is selectable.
    /// Round-robin over non-quarantined identities, healthy before degraded;
    /// quarantined identities re-enter rotation once their cool-down passed.
    /// There is no exclusive lease: concurrent callers may share an identity.
    pub fn acquire(&self) -> Option<Identity> {
        let now = Utc::now().timestamp();
        let mut inner = self.inner.lock().unwrap();
        let len = inner.identities.len();
        if len == 0 {
            return None;
        }

        let pick = |inner: &PoolInner, want_healthy: bool| -> Option<usize> {
            (0..len)
                .map(|offset| (inner.cursor + offset) % len)
                .find(|&idx| {
                    let ident = &inner.identities[idx];
                    if !selectable(ident, now) {
                        return false;
                    }
                    !want_healthy || ident.health == HealthState::Healthy
                })
        };

        let idx = pick(&*inner, true).or_else(|| pick(&*inner, false))?;
        inner.cursor = (idx + 1) % len;
        let ident = &mut inner.identities[idx];
        ident.last_used_at = Some(now);
        debug!(identity = %ident.id, health = ?ident.health, "identity acquired");
        Some(ident.clone())
    }

    /// Select a healthy identity only (used by housekeeping).
    pub fn healthy_identity(&self) -> Option<Identity> {
        let inner = self.inner.lock().unwrap();
        inner
            .identities
            .iter()
            .find(|i| i.health == HealthState::Healthy)
            .cloned()
    }

    pub fn mark_success(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ident) = inner.identities.iter_mut().find(|i| i.id == id) {
            ident.consecutive_failures = 0;
            ident.health = HealthState::Healthy;
            ident.last_success_at = Some(Utc::now().timestamp());
            ident.needs_refresh = false;
            ident.quarantined_at = None;
        }
    }

    pub fn mark_failure(&self, id: &str, kind: FailureKind) {
        let now = Utc::now().timestamp();
        let mut inner = self.inner.lock().unwrap();
        let Some(ident) = inner.identities.iter_mut().find(|i| i.id == id) else {
            return;
        };

        ident.consecutive_failures += 1;
        ident.last_failure_at = Some(now);

        if kind == FailureKind::Auth {
            warn!(identity = %ident.id, "auth failure, quarantining for refresh");
            ident.health = HealthState::Quarantined;
            ident.quarantined_at = Some(now);
            ident.needs_refresh = true;
            return;
        }

        if ident.consecutive_failures >= QUARANTINE_THRESHOLD {
            warn!(
                identity = %ident.id,
                failures = ident.consecutive_failures,
                "quarantine threshold reached"
            );
            ident.health = HealthState::Quarantined;
            ident.quarantined_at = Some(now);
        } else if ident.consecutive_failures >= DEGRADED_THRESHOLD {
            ident.health = HealthState::Degraded;
        }
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock().unwrap();
        let mut status = PoolStatus {
            total: inner.identities.len(),
            healthy: 0,
            degraded: 0,
            quarantined: 0,
            initialized: inner.initialized,
            soonest_expiry: None,
        };
        for ident in &inner.identities {
            match ident.health {
                HealthState::Healthy => status.healthy += 1,
                HealthState::Degraded => status.degraded += 1,
                HealthState::Quarantined => status.quarantined += 1,
            }
            if let Some(exp) = ident.token_expiry() {
                status.soonest_expiry = Some(match status.soonest_expiry {
                    Some(cur) => cur.min(exp),
                    None => exp,
                });
            }
        }
        status
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().identities.is_empty()
    }

    /// Count of identities a request could currently be routed to.
    pub fn selectable_count(&self) -> usize {
        let now = Utc::now().timestamp();
        let inner = self.inner.lock().unwrap();
        inner
            .identities
            .iter()
            .filter(|i| selectable(i, now))
            .count()
    }

    /// Refresh identities whose token is expired, expiring within the warning
    /// window, or flagged after an auth failure. `force` sweeps every
    /// identity with a cookie. Exchanges run outside the pool lock; the lock
    /// is taken only for the short per-identity updates.
    pub async fn refresh_expired(
        &self,
        exchanger: &dyn TokenExchanger,
        warn_window_secs: i64,
        force: bool,
    ) -> Vec<RefreshOutcome> {
        let targets: Vec<(String, String)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .identities
                .iter()
                .filter(|i| {
                    force
                        || i.needs_refresh
                        || i.is_token_expired()
                        || i.expires_within(warn_window_secs)
                })
                .map(|i| (i.id.clone(), i.cookie.clone()))
                .collect()
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for (id, cookie) in targets {
            let result = if cookie.is_empty() {
                Err(ExchangeError::MissingCookie)
            } else {
                exchanger.exchange(&cookie).await
            };

            match result {
                Ok(refreshed) => {
                    self.apply_refresh(&id, &refreshed.token);
                    info!(identity = %id, "token refreshed");
                    outcomes.push(RefreshOutcome {
                        id,
                        refreshed: true,
                        error: None,
                    });
                }
                Err(e) => {
                    self.apply_refresh_failure(&id);
                    warn!(identity = %id, error = %e, "token refresh failed");
                    outcomes.push(RefreshOutcome {
                        id,
                        refreshed: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        outcomes
    }

    fn apply_refresh(&self, id: &str, token: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ident) = inner.identities.iter_mut().find(|i| i.id == id) {
            ident.token = token.to_string();
            ident.last_refresh_at = Some(Utc::now().timestamp());
            ident.needs_refresh = false;
            ident.consecutive_failures = 0;
            ident.health = HealthState::Healthy;
            ident.quarantined_at = None;
        }
    }

    fn apply_refresh_failure(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ident) = inner.identities.iter_mut().find(|i| i.id == id) {
            ident.refresh_failures += 1;
        }
    }

    #[cfg(test)]
    fn backdate_quarantine(&self, id: &str, secs: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ident) = inner.identities.iter_mut().find(|i| i.id == id) {
            ident.quarantined_at = Some(Utc::now().timestamp() - secs);
        }
    }
}

fn selectable(ident: &Identity, now: i64) -> bool {
    match ident.health {
        HealthState::Healthy | HealthState::Degraded => true,
        HealthState::Quarantined => ident
            .quarantined_at
            .is_some_and(|at| now - at >= QUARANTINE_COOLDOWN_SECS),
    }
}
