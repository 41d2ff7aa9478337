//! Privileged-action orchestration.
//!
//! The gateway authenticates the caller, resolves the target, issues the
//! directory mutation and guarantees the audit record is committed before
//! reporting the outcome. An unaudited privileged action is treated as a
//! failed operation by policy.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::audit::{AuditAction, AuditOutcome, AuditRecord, AuditStore};
use crate::directory::{DirectoryBackend, DirectoryError, DirectoryUser};
use crate::error::Result;
use crate::token::{Claims, TokenManager};
use crate::ServerError;

/// Orchestrates privileged directory actions.
#[derive(Clone)]
pub struct Gateway {
    directory: Arc<dyn DirectoryBackend>,
    audit: Arc<dyn AuditStore>,
    token: TokenManager,
    /// Serializes concurrent mutations on the same target account.
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Gateway {
    /// Create a new [`Gateway`].
    pub fn new(
        directory: Arc<dyn DirectoryBackend>,
        audit: Arc<dyn AuditStore>,
        token: TokenManager,
    ) -> Self {
        Self {
            directory,
            audit,
            token,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Disable a directory account. Audited on every path, including a
    /// rejected token: the refused attempt is itself security-relevant.
    pub async fn disable_account(
        &self,
        bearer: Option<&str>,
        target: &str,
        source: &str,
    ) -> Result<()> {
        self.set_account_flag(bearer, target, false, AuditAction::Disable, source)
            .await
    }

    /// Re-enable a directory account. Symmetric to [`Self::disable_account`].
    pub async fn enable_account(
        &self,
        bearer: Option<&str>,
        target: &str,
        source: &str,
    ) -> Result<()> {
        self.set_account_flag(bearer, target, true, AuditAction::Enable, source)
            .await
    }

    /// Look up a directory account. Read access to PII is sensitive, so
    /// searches are audited too.
    pub async fn search_account(
        &self,
        bearer: Option<&str>,
        query: &str,
        source: &str,
    ) -> Result<DirectoryUser> {
        let claims = match self.authorize(bearer) {
            Ok(claims) => claims,
            Err(err) => {
                self.unauthorized_record(AuditAction::Search, query, source)
                    .await?;
                return Err(err);
            },
        };

        let gateway = self.clone();
        let query = query.to_owned();
        let source = source.to_owned();

        detach(async move {
            let result = gateway.directory.search(&query).await;

            let (target, outcome) = match &result {
                Ok(user) => {
                    (user.account_id.clone(), AuditOutcome::Success)
                },
                Err(err) => (query.clone(), failure(err)),
            };
            gateway
                .record(&claims.sub, AuditAction::Search, &target, outcome, &source)
                .await?;

            Ok(result?)
        })
        .await
    }

    /// Replace the target account's credential.
    pub async fn reset_credential(
        &self,
        bearer: Option<&str>,
        target: &str,
        new_password: &str,
        source: &str,
    ) -> Result<()> {
        let claims = match self.authorize(bearer) {
            Ok(claims) => claims,
            Err(err) => {
                self.unauthorized_record(
                    AuditAction::ResetCredential,
                    target,
                    source,
                )
                .await?;
                return Err(err);
            },
        };

        let gateway = self.clone();
        let target = target.to_owned();
        let new_password = new_password.to_owned();
        let source = source.to_owned();

        detach(async move {
            let user = match gateway.directory.search(&target).await {
                Ok(user) => user,
                Err(err) => {
                    gateway
                        .record(
                            &claims.sub,
                            AuditAction::ResetCredential,
                            &target,
                            failure(&err),
                            &source,
                        )
                        .await?;
                    return Err(err.into());
                },
            };

            let lock = gateway.target_lock(&user.account_id);
            let result = {
                let _serialized = lock.lock().await;
                gateway
                    .directory
                    .reset_credential(&user.account_id, &new_password)
                    .await
            };
            // The local clone must go first, or the map entry looks shared
            // forever.
            drop(lock);
            gateway.release_lock(&user.account_id);

            let outcome = match &result {
                Ok(()) => AuditOutcome::Success,
                Err(err) => failure(err),
            };
            gateway
                .record(
                    &claims.sub,
                    AuditAction::ResetCredential,
                    &user.account_id,
                    outcome,
                    &source,
                )
                .await?;

            Ok(result?)
        })
        .await
    }

    /// Most recent audit records, newest first.
    pub async fn audit_trail(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        Ok(self.audit.list(limit).await?)
    }

    async fn set_account_flag(
        &self,
        bearer: Option<&str>,
        target: &str,
        enabled: bool,
        action: AuditAction,
        source: &str,
    ) -> Result<()> {
        let claims = match self.authorize(bearer) {
            Ok(claims) => claims,
            Err(err) => {
                self.unauthorized_record(action, target, source).await?;
                return Err(err);
            },
        };

        let gateway = self.clone();
        let target = target.to_owned();
        let source = source.to_owned();

        detach(async move {
            gateway
                .apply_flag(&claims, &target, enabled, action, &source)
                .await
        })
        .await
    }

    async fn apply_flag(
        &self,
        claims: &Claims,
        target: &str,
        enabled: bool,
        action: AuditAction,
        source: &str,
    ) -> Result<()> {
        let user = match self.directory.search(target).await {
            Ok(user) => user,
            Err(err) => {
                self.record(&claims.sub, action, target, failure(&err), source)
                    .await?;
                return Err(err.into());
            },
        };

        // Serialized per target: the second caller observes the effect of
        // the first, not a lost update.
        let lock = self.target_lock(&user.account_id);
        let result = {
            let _serialized = lock.lock().await;
            self.directory
                .modify_account_flag(&user.account_id, enabled)
                .await
        };
        // The local clone must go first, or the map entry looks shared
        // forever.
        drop(lock);
        self.release_lock(&user.account_id);

        let outcome = match &result {
            Ok(()) => AuditOutcome::Success,
            Err(err) => failure(err),
        };

        // Audit-before-acknowledge: committed before the caller hears back.
        self.record(&claims.sub, action, &user.account_id, outcome, source)
            .await?;

        Ok(result?)
    }

    fn authorize(&self, bearer: Option<&str>) -> Result<Claims> {
        let token = bearer.ok_or(ServerError::Unauthorized)?;
        Ok(self.token.decode(token)?)
    }

    async fn record(
        &self,
        actor: &str,
        action: AuditAction,
        target: &str,
        outcome: AuditOutcome,
        source: &str,
    ) -> Result<()> {
        let labels = [
            ("operation", action.as_str()),
            (
                "outcome",
                match outcome {
                    AuditOutcome::Success => "success",
                    AuditOutcome::Failure { .. } => "failure",
                },
            ),
        ];
        metrics::counter!("directory_operations_total", &labels)
            .increment(1);

        self.audit
            .append(AuditRecord::new(actor, action, target, outcome, source))
            .await?;
        Ok(())
    }

    async fn unauthorized_record(
        &self,
        action: AuditAction,
        target: &str,
        source: &str,
    ) -> Result<()> {
        self.record(
            "unknown",
            action,
            target,
            AuditOutcome::Failure {
                reason: "unauthorized".into(),
            },
            source,
        )
        .await
    }

    fn target_lock(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(account_id.to_owned()).or_default())
    }

    fn release_lock(&self, account_id: &str) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(entry) = locks.get(account_id) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(account_id);
            }
        }
    }
}

/// Run `fut` on its own task so caller cancellation cannot lose an audit
/// record for a mutation that already went through.
async fn detach<T>(
    fut: impl Future<Output = Result<T>> + Send + 'static,
) -> Result<T>
where
    T: Send + 'static,
{
    tokio::spawn(fut).await.map_err(|err| ServerError::Internal {
        details: err.to_string(),
    })?
}

fn failure(err: &DirectoryError) -> AuditOutcome {
    let reason = match err {
        DirectoryError::NotFound => "target not found".into(),
        _ => err.to_string(),
    };
    AuditOutcome::Failure { reason }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::fake::{FailingAudit, MemoryAudit};
    use crate::credentials::AdminIdentity;
    use crate::directory::fake::FakeDirectory;
    use crate::token::TokenError;

    const SOURCE: &str = "127.0.0.1";

    fn gateway(
        directory: Arc<FakeDirectory>,
        audit: Arc<MemoryAudit>,
    ) -> (Gateway, String) {
        let token = TokenManager::new(b"test-secret", "dirgate-test", None);
        let bearer = token
            .create(&AdminIdentity {
                username: "admin".into(),
                password_hash: String::default(),
                display_name: "Administrator".into(),
                role: "admin".into(),
            })
            .unwrap();

        (Gateway::new(directory, audit, token), bearer)
    }

    #[tokio::test]
    async fn test_disable_success_is_audited_once() {
        let directory = Arc::new(FakeDirectory::seeded());
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, bearer) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        gateway
            .disable_account(Some(&bearer), "jsilva", SOURCE)
            .await
            .unwrap();

        assert!(!directory.get("jsilva").unwrap().enabled);

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::Disable);
        assert_eq!(records[0].actor, "admin");
        assert_eq!(records[0].target, "jsilva");
        assert_eq!(records[0].outcome, AuditOutcome::Success);
        assert_eq!(records[0].source_address, SOURCE);
    }

    #[tokio::test]
    async fn test_rejected_token_is_audited() {
        let directory = Arc::new(FakeDirectory::seeded());
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, _) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        let err = gateway
            .disable_account(None, "jsilva", SOURCE)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized));

        let err = gateway
            .disable_account(Some("garbage"), "jsilva", SOURCE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Token(TokenError::Malformed)
        ));

        // Target untouched, both attempts on the record.
        assert!(directory.get("jsilva").unwrap().enabled);
        let records = audit.records();
        assert_eq!(records.len(), 2);
        for record in records {
            assert_eq!(record.actor, "unknown");
            assert_eq!(
                record.outcome,
                AuditOutcome::Failure {
                    reason: "unauthorized".into()
                }
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_target_is_audited() {
        let directory = Arc::new(FakeDirectory::seeded());
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, bearer) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        let err = gateway
            .disable_account(Some(&bearer), "ghost", SOURCE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Directory(DirectoryError::NotFound)
        ));

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].outcome,
            AuditOutcome::Failure {
                reason: "target not found".into()
            }
        );
    }

    #[tokio::test]
    async fn test_disable_already_disabled_is_idempotent() {
        let directory =
            Arc::new(FakeDirectory::seeded_failing_after_one_mutation());
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, bearer) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        gateway
            .disable_account(Some(&bearer), "jsilva", SOURCE)
            .await
            .unwrap();
        // Second call must not reach the mutation path again.
        gateway
            .disable_account(Some(&bearer), "jsilva", SOURCE)
            .await
            .unwrap();

        assert_eq!(directory.mutations(), 1);
        assert_eq!(audit.records().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_disable_single_mutation() {
        let directory =
            Arc::new(FakeDirectory::seeded_failing_after_one_mutation());
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, bearer) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        let (first, second) = tokio::join!(
            gateway.disable_account(Some(&bearer), "jsilva", SOURCE),
            gateway.disable_account(Some(&bearer), "jsilva", SOURCE),
        );

        first.unwrap();
        second.unwrap();
        assert_eq!(directory.mutations(), 1);
        assert!(!directory.get("jsilva").unwrap().enabled);
        assert_eq!(audit.records().len(), 2);
    }

    #[tokio::test]
    async fn test_target_locks_released_after_operations() {
        let directory = Arc::new(FakeDirectory::seeded());
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, bearer) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        gateway
            .disable_account(Some(&bearer), "jsilva", SOURCE)
            .await
            .unwrap();
        gateway
            .disable_account(Some(&bearer), "mcosta", SOURCE)
            .await
            .unwrap();
        gateway
            .reset_credential(Some(&bearer), "jsilva", "N3w-Secret!", SOURCE)
            .await
            .unwrap();

        // The lock map is transient state, not a per-target registry.
        assert_eq!(gateway.locks.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_audit_failure_fails_request_despite_mutation() {
        let directory = Arc::new(FakeDirectory::seeded());
        let (gateway, bearer) = {
            let token =
                TokenManager::new(b"test-secret", "dirgate-test", None);
            let bearer = token
                .create(&AdminIdentity {
                    username: "admin".into(),
                    ..Default::default()
                })
                .unwrap();
            (
                Gateway::new(
                    Arc::clone(&directory) as Arc<dyn DirectoryBackend>,
                    Arc::new(FailingAudit),
                    token,
                ),
                bearer,
            )
        };

        let err = gateway
            .disable_account(Some(&bearer), "jsilva", SOURCE)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Audit(_)));

        // The mutation went through, yet the caller sees a failure.
        assert!(!directory.get("jsilva").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_enable_account_roundtrip() {
        let directory = Arc::new(FakeDirectory::seeded());
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, bearer) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        gateway
            .disable_account(Some(&bearer), "jsilva", SOURCE)
            .await
            .unwrap();
        gateway
            .enable_account(Some(&bearer), "jsilva", SOURCE)
            .await
            .unwrap();

        assert!(directory.get("jsilva").unwrap().enabled);

        let actions: Vec<AuditAction> =
            audit.records().iter().map(|r| r.action).collect();
        assert_eq!(actions, [AuditAction::Disable, AuditAction::Enable]);
    }

    #[tokio::test]
    async fn test_search_is_audited() {
        let directory = Arc::new(FakeDirectory::seeded());
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, bearer) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        let user = gateway
            .search_account(Some(&bearer), "jsilva", SOURCE)
            .await
            .unwrap();
        assert!(user.enabled);

        let err = gateway
            .search_account(Some(&bearer), "ghost", SOURCE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Directory(DirectoryError::NotFound)
        ));

        let records = audit.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.action == AuditAction::Search));
        assert_eq!(records[0].outcome, AuditOutcome::Success);
        assert!(matches!(
            records[1].outcome,
            AuditOutcome::Failure { .. }
        ));
    }

    #[tokio::test]
    async fn test_reset_credential_audited() {
        let directory = Arc::new(FakeDirectory::seeded());
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, bearer) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        gateway
            .reset_credential(Some(&bearer), "jsilva", "N3w-Secret!", SOURCE)
            .await
            .unwrap();

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::ResetCredential);
        assert_eq!(records[0].outcome, AuditOutcome::Success);
    }

    #[tokio::test]
    async fn test_cancelled_caller_still_commits_audit() {
        let directory = Arc::new(FakeDirectory::seeded());
        let gate = directory.gate_mutations();
        let audit = Arc::new(MemoryAudit::default());
        let (gateway, bearer) =
            self::gateway(Arc::clone(&directory), Arc::clone(&audit));

        // The gate holds the mutation open, so the request cannot finish
        // before we drop it mid-flight.
        let mut request = Box::pin(gateway.disable_account(
            Some(&bearer),
            "jsilva",
            SOURCE,
        ));
        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), &mut request)
                .await;
        assert!(cancelled.is_err());
        drop(request);

        assert!(directory.get("jsilva").unwrap().enabled);
        assert!(audit.records().is_empty());

        // The detached task finishes the mutation and the audit write.
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!directory.get("jsilva").unwrap().enabled);
        assert_eq!(audit.records().len(), 1);
        assert_eq!(audit.records()[0].outcome, AuditOutcome::Success);
    }
}
