//! Credential lifecycle: hand out a usable mailbox handle for a tenant,
//! refreshing the access token under the tenant's refresh lock when it is
//! close to expiry, and revoking the channel when a refresh fails.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::channel::{MailProvider, MailProviders, Mailbox};
use crate::error::{FollowupError, Result};
use crate::lock::{LockManager, DEFAULT_LOCK_TTL};
use crate::store::{DocumentStore, LockStore};
use crate::tenant::Credential;

/// Refresh a token once it is within this window of expiry.
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::minutes(10);

/// Timing knobs for credential refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshPolicy {
    /// How long a refresh lock stays live if its holder never releases it.
    pub lock_ttl: Duration,
    /// Tokens expiring sooner than this are refreshed.
    pub expiry_buffer: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
        }
    }
}

impl RefreshPolicy {
    /// Longest a handed-out token may be past the refresh threshold.
    ///
    /// A caller that loses the lock race keeps using the current token rather
    /// than waiting for the winner. That token is inside the expiry buffer,
    /// so it is still valid for up to `expiry_buffer`, which bounds how stale
    /// the losing caller's view can be.
    pub fn max_staleness(&self) -> Duration {
        self.expiry_buffer
    }
}

/// Where the access token in a [`ConnectedChannel`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Stored token, comfortably outside the expiry buffer.
    Current,
    /// Stored token inside the buffer; another worker holds the refresh lock.
    Stale,
    /// Freshly refreshed and persisted by this call.
    Refreshed,
}

pub struct ConnectedChannel {
    pub credential: Credential,
    pub token_source: TokenSource,
    pub mailbox: Arc<dyn Mailbox>,
}

impl fmt::Debug for ConnectedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedChannel")
            .field("provider", &self.credential.provider)
            .field("expires_at", &self.credential.expires_at)
            .field("token_source", &self.token_source)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum ChannelResolution {
    /// No mailbox linked. A normal state, not an error.
    NotConnected,
    Connected(ConnectedChannel),
}

pub struct CredentialManager {
    store: Arc<dyn DocumentStore>,
    locks: LockManager,
    providers: MailProviders,
    policy: RefreshPolicy,
}

impl CredentialManager {
    /// `locks` must be shared by every worker that refreshes tokens for the
    /// same tenants.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: Arc<dyn LockStore>,
        providers: MailProviders,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            locks: LockManager::new(locks, policy.lock_ttl),
            providers,
            policy,
        }
    }

    /// Resolve a mailbox handle for `tenant_id`.
    ///
    /// Fails with `FollowupError::Auth` only when this call performed a
    /// refresh that failed; the tenant's credential has then been cleared.
    pub async fn resolve(&self, tenant_id: &str, now: DateTime<Utc>) -> Result<ChannelResolution> {
        let tenant = self
            .store
            .tenant(tenant_id)?
            .ok_or_else(|| FollowupError::TenantNotFound(tenant_id.to_string()))?;
        let Some(credential) = tenant.credential else {
            return Ok(ChannelResolution::NotConnected);
        };
        let provider = self.providers.get(credential.provider).ok_or_else(|| {
            FollowupError::Configuration(format!(
                "no mail provider registered for '{}'",
                credential.provider
            ))
        })?;

        if credential.is_fresh(now, self.policy.expiry_buffer) {
            return Ok(connected(provider.as_ref(), credential, TokenSource::Current));
        }

        let Some(guard) = self.locks.lock(tenant_id, now)? else {
            tracing::info!(
                tenant_id,
                max_staleness_secs = self.policy.max_staleness().num_seconds(),
                "token refresh already in progress; using current token"
            );
            return Ok(connected(provider.as_ref(), credential, TokenSource::Stale));
        };

        let result = self
            .refresh_locked(tenant_id, provider.as_ref(), credential, now)
            .await;
        if let Err(e) = guard.release() {
            tracing::warn!(tenant_id, error = %e, "failed to release refresh lock");
        }
        result
    }

    async fn refresh_locked(
        &self,
        tenant_id: &str,
        provider: &dyn MailProvider,
        credential: Credential,
        now: DateTime<Utc>,
    ) -> Result<ChannelResolution> {
        tracing::info!(tenant_id, provider = %credential.provider, "refreshing access token");
        let refreshed = provider
            .refresh(&credential.refresh_token)
            .await
            .and_then(|grant| {
                let expires_at = Duration::try_seconds(grant.expires_in_seconds)
                    .and_then(|lifetime| now.checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        FollowupError::Provider(format!(
                            "token lifetime of {}s is out of range",
                            grant.expires_in_seconds
                        ))
                    })?;
                Ok(Credential {
                    access_token: grant.access_token,
                    refresh_token: grant
                        .refresh_token
                        .unwrap_or_else(|| credential.refresh_token.clone()),
                    expires_at,
                    ..credential.clone()
                })
            });
        match refreshed {
            Ok(refreshed) => {
                self.store.set_credential(tenant_id, refreshed.clone())?;
                tracing::info!(tenant_id, expires_at = %refreshed.expires_at, "access token refreshed");
                Ok(connected(provider, refreshed, TokenSource::Refreshed))
            }
            Err(e) => {
                tracing::warn!(tenant_id, error = %e, "token refresh failed; revoking channel");
                provider.revoke(&credential).await;
                if let Err(clear_err) = self.store.clear_credential(tenant_id) {
                    tracing::error!(tenant_id, error = %clear_err, "failed to clear revoked credential");
                }
                let reason = match e {
                    FollowupError::Auth { reason, .. } => reason,
                    other => other.to_string(),
                };
                Err(FollowupError::auth(tenant_id, reason))
            }
        }
    }
}

fn connected(
    provider: &dyn MailProvider,
    credential: Credential,
    token_source: TokenSource,
) -> ChannelResolution {
    let mailbox = provider.connect(&credential.access_token);
    ChannelResolution::Connected(ConnectedChannel {
        credential,
        token_source,
        mailbox,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::RedbStore;
    use crate::tenant::Tenant;
    use crate::testing::FakeProvider;
    use crate::types::ProviderKind;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    struct Fixture {
        _dir: TempDir,
        store: Arc<RedbStore>,
    }

    fn fixture(expires_in: Duration, now: DateTime<Utc>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbStore::open(&dir.path().join("state.redb")).unwrap());
        let mut tenant = Tenant::new("t1", "Rose Hall", "events@rosehall.test");
        tenant.credential = Some(Credential {
            provider: ProviderKind::Google,
            access_token: "old-access".into(),
            refresh_token: "old-refresh".into(),
            expires_at: now + expires_in,
            subscription_id: None,
        });
        tenant.connected_inbox = Some("events@rosehall.test".into());
        store.put_tenant(&tenant).unwrap();
        Fixture { _dir: dir, store }
    }

    fn manager(store: &Arc<RedbStore>, provider: Arc<FakeProvider>) -> CredentialManager {
        CredentialManager::new(
            store.clone(),
            store.clone(),
            MailProviders::new().with(provider),
            RefreshPolicy::default(),
        )
    }

    fn expect_connected(res: ChannelResolution) -> ConnectedChannel {
        match res {
            ChannelResolution::Connected(c) => c,
            ChannelResolution::NotConnected => panic!("expected a connected channel"),
        }
    }

    #[tokio::test]
    async fn no_credential_is_not_connected_without_network() {
        let now = Utc::now();
        let fx = fixture(Duration::hours(1), now);
        let mut tenant = fx.store.tenant("t1").unwrap().unwrap();
        tenant.credential = None;
        fx.store.put_tenant(&tenant).unwrap();

        let provider = Arc::new(FakeProvider::new(ProviderKind::Google));
        let res = manager(&fx.store, provider.clone())
            .resolve("t1", now)
            .await
            .unwrap();
        assert!(matches!(res, ChannelResolution::NotConnected));
        assert_eq!(provider.refreshes(), 0);
        assert!(provider.connected_with.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fresh_token_is_used_directly() {
        let now = Utc::now();
        let fx = fixture(Duration::hours(1), now);
        let provider = Arc::new(FakeProvider::new(ProviderKind::Google));

        let channel = expect_connected(
            manager(&fx.store, provider.clone())
                .resolve("t1", now)
                .await
                .unwrap(),
        );
        assert_eq!(channel.token_source, TokenSource::Current);
        assert_eq!(channel.credential.access_token, "old-access");
        assert_eq!(provider.refreshes(), 0);
        assert_eq!(*provider.connected_with.lock().unwrap(), vec!["old-access"]);
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_once_and_persisted() {
        let now = Utc::now();
        let fx = fixture(Duration::minutes(3), now);
        let provider = Arc::new(FakeProvider::new(ProviderKind::Google));
        let mgr = manager(&fx.store, provider.clone());

        let channel = expect_connected(mgr.resolve("t1", now).await.unwrap());
        assert_eq!(channel.token_source, TokenSource::Refreshed);
        assert_eq!(channel.credential.access_token, "refreshed-access");
        assert_eq!(provider.refreshes(), 1);

        let stored = fx.store.tenant("t1").unwrap().unwrap().credential.unwrap();
        assert_eq!(stored.access_token, "refreshed-access");
        assert_eq!(stored.refresh_token, "old-refresh", "unrotated refresh token kept");
        assert_eq!(stored.expires_at, now + Duration::seconds(3600));
        assert!(fx.store.refresh_lock("t1").unwrap().is_none(), "lock released");
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_old_one() {
        let now = Utc::now();
        let fx = fixture(Duration::minutes(1), now);
        let mut provider = FakeProvider::new(ProviderKind::Google);
        provider.grant.refresh_token = Some("new-refresh".into());
        let provider = Arc::new(provider);

        manager(&fx.store, provider).resolve("t1", now).await.unwrap();
        let stored = fx.store.tenant("t1").unwrap().unwrap().credential.unwrap();
        assert_eq!(stored.refresh_token, "new-refresh");
    }

    #[tokio::test]
    async fn concurrent_resolve_without_lock_returns_pre_refresh_token() {
        let now = Utc::now();
        let fx = fixture(Duration::minutes(3), now);
        let entered = Arc::new(Notify::new());
        let proceed = Arc::new(Notify::new());
        let mut provider = FakeProvider::new(ProviderKind::Google);
        provider.gate = Some((entered.clone(), proceed.clone()));
        let provider = Arc::new(provider);
        let mgr = Arc::new(manager(&fx.store, provider.clone()));

        let first = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.resolve("t1", now).await })
        };
        entered.notified().await;

        let second = expect_connected(mgr.resolve("t1", now).await.unwrap());
        assert_eq!(second.token_source, TokenSource::Stale);
        assert_eq!(second.credential.access_token, "old-access");

        proceed.notify_one();
        let first = expect_connected(first.await.unwrap().unwrap());
        assert_eq!(first.token_source, TokenSource::Refreshed);
        assert_eq!(provider.refreshes(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_revokes_and_clears_credential() {
        let now = Utc::now();
        let fx = fixture(Duration::minutes(3), now);
        let mut provider = FakeProvider::new(ProviderKind::Google);
        provider.fail_refresh = true;
        let provider = Arc::new(provider);

        let err = manager(&fx.store, provider.clone())
            .resolve("t1", now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(provider.revokes(), 1);

        let tenant = fx.store.tenant("t1").unwrap().unwrap();
        assert!(tenant.credential.is_none());
        assert!(tenant.connected_inbox.is_none());
        assert!(fx.store.refresh_lock("t1").unwrap().is_none(), "lock released");
    }

    #[tokio::test]
    async fn out_of_range_token_lifetime_is_a_failed_refresh() {
        let now = Utc::now();
        let fx = fixture(Duration::minutes(3), now);
        let mut provider = FakeProvider::new(ProviderKind::Google);
        provider.grant.expires_in_seconds = i64::MAX;
        let provider = Arc::new(provider);

        let err = manager(&fx.store, provider.clone())
            .resolve("t1", now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.to_string().contains("out of range"));
        assert_eq!(provider.revokes(), 1);
        assert!(fx.store.tenant("t1").unwrap().unwrap().credential.is_none());
        assert!(fx.store.refresh_lock("t1").unwrap().is_none(), "lock released");
    }

    #[tokio::test]
    async fn unregistered_provider_is_configuration_error() {
        let now = Utc::now();
        let fx = fixture(Duration::hours(1), now);
        let provider = Arc::new(FakeProvider::new(ProviderKind::Outlook));

        let err = manager(&fx.store, provider)
            .resolve("t1", now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn staleness_window_equals_expiry_buffer() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.max_staleness(), Duration::minutes(10));
        assert_eq!(policy.lock_ttl, Duration::minutes(1));
    }
}
