//! LDAP support: pooled, reconnecting connections and the production
//! [`DirectoryBackend`] implementation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ldap3::{
    Ldap as Ldap3, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope,
    SearchEntry,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};

use crate::config;
use crate::directory::{DirectoryBackend, DirectoryError, DirectoryUser};

/// `userAccountControl` bit marking a disabled account.
const ACCOUNT_DISABLE: u32 = 0x2;
/// `userAccountControl` for a plain enabled account.
const NORMAL_ACCOUNT: u32 = 512;

/// First retry delay; doubles on every failed connect attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(300);
const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

const SEARCH_ATTRS: &[&str] = &[
    "sAMAccountName",
    "displayName",
    "userPrincipalName",
    "userAccountControl",
    "memberOf",
    "department",
    "lastLogon",
];

/// Backend connection lifecycle, owned exclusively by the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Bound,
    Failed,
}

#[derive(Clone, Debug)]
struct PoolSettings {
    address: String,
    bind_dn: String,
    bind_password: String,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    operation_timeout: Duration,
    max_lifetime: Duration,
    connect_attempts: u32,
}

struct PooledConn {
    ldap: Ldap3,
    created_at: Instant,
}

/// Bounded pool of bound LDAP connections.
///
/// Acquisition waits up to a configurable timeout, then yields
/// [`DirectoryError::BackendUnavailable`]. Connections past their max
/// lifetime are recycled on release even when idle-looking.
pub struct LdapPool {
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<PooledConn>>,
    state: Mutex<ConnectionState>,
}

impl LdapPool {
    /// Create a new [`LdapPool`] from configuration.
    ///
    /// The `LDAP_PASSWORD` environment variable overrides the file value.
    pub fn new(config: &config::Ldap) -> Self {
        let bind_password = std::env::var("LDAP_PASSWORD")
            .ok()
            .or_else(|| config.bind_password.clone())
            .unwrap_or_default();

        let secs = Duration::from_secs;
        let settings = PoolSettings {
            address: config.address.clone(),
            bind_dn: config.bind_dn.clone(),
            bind_password,
            acquire_timeout: config
                .acquire_timeout_secs
                .map_or(DEFAULT_ACQUIRE_TIMEOUT, secs),
            connect_timeout: config
                .connect_timeout_secs
                .map_or(DEFAULT_CONNECT_TIMEOUT, secs),
            operation_timeout: config
                .operation_timeout_secs
                .map_or(DEFAULT_OPERATION_TIMEOUT, secs),
            max_lifetime: config
                .max_lifetime_secs
                .map_or(DEFAULT_MAX_LIFETIME, secs),
            connect_attempts: config
                .connect_attempts
                .unwrap_or(DEFAULT_CONNECT_ATTEMPTS),
        };

        Self {
            settings,
            permits: Arc::new(Semaphore::new(
                config.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            )),
            idle: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Last observed lifecycle transition.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn per_op_timeout(&self) -> Duration {
        self.settings.operation_timeout
    }

    /// Take a bound connection out of the pool, connecting when none is
    /// available. The returned guard gives it back on drop.
    async fn acquire(&self) -> Result<PoolGuard<'_>, DirectoryError> {
        let permit =
            timeout(self.settings.acquire_timeout, async {
                Arc::clone(&self.permits).acquire_owned().await
            })
            .await
            .map_err(|_| DirectoryError::BackendUnavailable)?
            .map_err(|_| DirectoryError::BackendUnavailable)?;

        loop {
            let candidate = self.idle.lock().unwrap().pop();
            match candidate {
                Some(conn)
                    if conn.created_at.elapsed()
                        < self.settings.max_lifetime =>
                {
                    return Ok(PoolGuard {
                        conn: Some(conn),
                        pool: self,
                        broken: false,
                        _permit: permit,
                    });
                },
                Some(stale) => {
                    tracing::debug!(
                        "recycling ldap connection past max lifetime"
                    );
                    unbind_detached(stale.ldap);
                },
                None => break,
            }
        }

        let conn = self.connect().await?;
        Ok(PoolGuard {
            conn: Some(conn),
            pool: self,
            broken: false,
            _permit: permit,
        })
    }

    /// Connect and bind, with bounded exponential backoff on transient
    /// failures. A bind rejection is fatal and never retried.
    async fn connect(&self) -> Result<PooledConn, DirectoryError> {
        let mut delay = BACKOFF_BASE;

        for attempt in 0..self.settings.connect_attempts {
            if attempt > 0 {
                sleep(delay).await;
                delay *= 2;
            }

            self.set_state(ConnectionState::Connecting);
            match self.try_connect().await {
                Ok(conn) => {
                    self.set_state(ConnectionState::Bound);
                    return Ok(conn);
                },
                Err(DirectoryError::PermissionDenied) => {
                    self.set_state(ConnectionState::Failed);
                    tracing::error!(
                        bind_dn = %self.settings.bind_dn,
                        "ldap bind rejected"
                    );
                    return Err(DirectoryError::PermissionDenied);
                },
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        error = %err,
                        address = %self.settings.address,
                        "ldap connect failed"
                    );
                },
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(DirectoryError::BackendUnavailable)
    }

    async fn try_connect(&self) -> Result<PooledConn, DirectoryError> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.settings.connect_timeout);

        let (conn, mut ldap) = timeout(
            self.settings.connect_timeout,
            LdapConnAsync::with_settings(settings, &self.settings.address),
        )
        .await
        .map_err(|_| DirectoryError::BackendUnavailable)?
        .map_err(|err| classify(&err))?;

        tokio::spawn(async move {
            if let Err(err) = conn.drive().await {
                tracing::warn!(error = %err, "ldap connection driver error");
            }
        });

        let result = timeout(
            self.settings.connect_timeout,
            ldap.simple_bind(
                &self.settings.bind_dn,
                &self.settings.bind_password,
            ),
        )
        .await
        .map_err(|_| DirectoryError::BackendUnavailable)?
        .map_err(|err| classify(&err))?;

        match result.rc {
            0 => Ok(PooledConn {
                ldap,
                created_at: Instant::now(),
            }),
            49 | 50 => Err(DirectoryError::PermissionDenied),
            _ => Err(DirectoryError::BackendUnavailable),
        }
    }

    fn release(&self, conn: PooledConn, broken: bool) {
        if broken || conn.created_at.elapsed() >= self.settings.max_lifetime {
            unbind_detached(conn.ldap);
            return;
        }

        self.idle.lock().unwrap().push(conn);
    }
}

/// Scoped connection acquisition: release is guaranteed on drop.
struct PoolGuard<'a> {
    conn: Option<PooledConn>,
    pool: &'a LdapPool,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard<'_> {
    fn ldap(&mut self) -> &mut Ldap3 {
        // The option is only emptied on drop.
        &mut self.conn.as_mut().expect("connection taken").ldap
    }

    /// Mark the connection as unusable so it is closed instead of pooled.
    fn discard(&mut self) {
        self.broken = true;
    }
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.broken);
        }
    }
}

fn unbind_detached(mut ldap: Ldap3) {
    tokio::spawn(async move {
        let _ = ldap.unbind().await;
    });
}

/// Map an [`LdapError`] onto the backend taxonomy.
///
/// Result-code errors leave the connection usable; anything else means the
/// session state is unknown and the caller should discard it.
fn classify(err: &LdapError) -> DirectoryError {
    match err {
        LdapError::LdapResult { result } => match result.rc {
            32 => DirectoryError::NotFound,
            49 | 50 => DirectoryError::PermissionDenied,
            _ => DirectoryError::BackendUnavailable,
        },
        _ => DirectoryError::BackendUnavailable,
    }
}

fn is_connection_error(err: &LdapError) -> bool {
    !matches!(err, LdapError::LdapResult { .. })
}

/// Production [`DirectoryBackend`] over [`LdapPool`].
pub struct LdapBackend {
    pool: LdapPool,
    base_dn: String,
}

impl LdapBackend {
    /// Create a new [`LdapBackend`].
    pub fn new(config: &config::Ldap) -> Self {
        Self {
            pool: LdapPool::new(config),
            base_dn: config.base_dn.clone(),
        }
    }

    async fn search_entries(
        &self,
        guard: &mut PoolGuard<'_>,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<SearchEntry>, DirectoryError> {
        let op_timeout = self.pool.per_op_timeout();

        let result = timeout(
            op_timeout,
            guard.ldap().with_timeout(op_timeout).search(
                &self.base_dn,
                Scope::Subtree,
                filter,
                attrs.to_vec(),
            ),
        )
        .await
        .map_err(|_| {
            guard.discard();
            DirectoryError::BackendUnavailable
        })?
        .map_err(|err| {
            if is_connection_error(&err) {
                guard.discard();
            }
            classify(&err)
        })?;

        let (entries, _) = result.success().map_err(|err| classify(&err))?;
        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }

    /// Resolve an exact account identifier to its entry.
    async fn find_entry(
        &self,
        guard: &mut PoolGuard<'_>,
        account_id: &str,
        attrs: &[&str],
    ) -> Result<SearchEntry, DirectoryError> {
        let filter =
            format!("(sAMAccountName={})", escape_ldap(account_id));
        let mut entries = self.search_entries(guard, &filter, attrs).await?;

        if entries.is_empty() {
            return Err(DirectoryError::NotFound);
        }
        Ok(entries.remove(0))
    }

    async fn replace_attr(
        &self,
        guard: &mut PoolGuard<'_>,
        dn: &str,
        attr: &str,
        value: String,
    ) -> Result<(), DirectoryError> {
        let op_timeout = self.pool.per_op_timeout();
        let mods = vec![Mod::Replace(
            attr.to_string(),
            HashSet::from([value]),
        )];

        let result = timeout(
            op_timeout,
            guard.ldap().with_timeout(op_timeout).modify(dn, mods),
        )
        .await
        .map_err(|_| {
            guard.discard();
            DirectoryError::BackendUnavailable
        })?
        .map_err(|err| {
            if is_connection_error(&err) {
                guard.discard();
            }
            classify(&err)
        })?;

        result.success().map_err(|err| classify(&err))?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryBackend for LdapBackend {
    async fn search(
        &self,
        query: &str,
    ) -> Result<DirectoryUser, DirectoryError> {
        let mut guard = self.pool.acquire().await?;

        let q = escape_ldap(query);
        let filter = format!("(|(sAMAccountName={q})(displayName=*{q}*))");
        let entries = self
            .search_entries(&mut guard, &filter, SEARCH_ATTRS)
            .await?;

        let users: Vec<DirectoryUser> =
            entries.iter().map(entry_to_user).collect();

        pick_match(query, users).ok_or(DirectoryError::NotFound)
    }

    async fn modify_account_flag(
        &self,
        account_id: &str,
        enabled: bool,
    ) -> Result<(), DirectoryError> {
        let mut guard = self.pool.acquire().await?;

        let entry = self
            .find_entry(&mut guard, account_id, &["userAccountControl"])
            .await?;

        let current = entry
            .attrs
            .get("userAccountControl")
            .and_then(|values| values.first())
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(NORMAL_ACCOUNT);
        let desired = apply_flag(current, enabled);

        if desired == current {
            // Already in the requested state: idempotent success.
            return Ok(());
        }

        let dn = entry.dn.clone();
        self.replace_attr(
            &mut guard,
            &dn,
            "userAccountControl",
            desired.to_string(),
        )
        .await?;

        tracing::info!(account_id, enabled, "account flag updated");
        Ok(())
    }

    async fn reset_credential(
        &self,
        account_id: &str,
        new_password: &str,
    ) -> Result<(), DirectoryError> {
        let mut guard = self.pool.acquire().await?;

        // "1.1" requests no attributes, only the DN.
        let entry = self.find_entry(&mut guard, account_id, &["1.1"]).await?;
        let dn = entry.dn.clone();

        self.replace_attr(
            &mut guard,
            &dn,
            "userPassword",
            new_password.to_string(),
        )
        .await?;

        tracing::info!(account_id, "account credential replaced");
        Ok(())
    }
}

/// Set or clear the disabled bit on a `userAccountControl` value.
fn apply_flag(uac: u32, enabled: bool) -> u32 {
    if enabled {
        uac & !ACCOUNT_DISABLE
    } else {
        uac | ACCOUNT_DISABLE
    }
}

/// Deterministic tie-break for ambiguous search results: an exact
/// identifier match wins over a fuzzy one; otherwise the lowest account
/// identifier in lexicographic order is taken.
fn pick_match(
    query: &str,
    mut users: Vec<DirectoryUser>,
) -> Option<DirectoryUser> {
    if let Some(position) = users
        .iter()
        .position(|user| user.account_id.eq_ignore_ascii_case(query))
    {
        return Some(users.swap_remove(position));
    }

    users.sort_by(|a, b| a.account_id.cmp(&b.account_id));
    users.into_iter().next()
}

fn entry_to_user(entry: &SearchEntry) -> DirectoryUser {
    let first = |attr: &str| {
        entry
            .attrs
            .get(attr)
            .and_then(|values| values.first())
            .cloned()
    };

    let uac = first("userAccountControl")
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(NORMAL_ACCOUNT);

    DirectoryUser {
        account_id: first("sAMAccountName").unwrap_or_default(),
        display_name: first("displayName").unwrap_or_default(),
        principal_name: first("userPrincipalName").unwrap_or_default(),
        enabled: uac & ACCOUNT_DISABLE == 0,
        groups: entry.attrs.get("memberOf").cloned().unwrap_or_default(),
        department: first("department"),
        last_logon: first("lastLogon"),
    }
}

/// RFC 4515 escaping for filter values. Multi-byte characters pass
/// through untouched.
fn escape_ldap(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '*' => out.push_str(r"\2a"),
            '(' => out.push_str(r"\28"),
            ')' => out.push_str(r"\29"),
            '\\' => out.push_str(r"\5c"),
            '\0' => out.push_str(r"\00"),
            c => out.push(c),
        }
    }
    out
}
