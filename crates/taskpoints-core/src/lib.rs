//! Points ledger and task/referral rules engine.
//!
//! The crate holds the storage-independent half of the gamification backend:
//! the task catalog, the capability traits a storage backend must satisfy,
//! the error taxonomy, and the [`RulesEngine`] that composes them into the
//! public operations (complete-task, set-referrer, set-email, get-status,
//! get-history, get-points, get-leaderboard).

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bonus credited to the referrer when someone links them as referrer.
pub const TASK_GIVE_REFERRAL: TaskId = TaskId(1);
/// Bonus credited to the referred user when their referrer link is set.
pub const TASK_GET_REFERRAL: TaskId = TaskId(2);
pub const TASK_SUBSCRIBE_TELEGRAM: TaskId = TaskId(3);
pub const TASK_SUBSCRIBE_TWITTER: TaskId = TaskId(4);
/// Bonus credited on the first successful email submission.
pub const TASK_COMPLETE_EMAIL: TaskId = TaskId(5);

impl TaskId {
    /// Reserved tasks are only reachable through their dedicated operations
    /// (set-referrer, set-email) and are rejected by generic completion.
    #[must_use]
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            TASK_GIVE_REFERRAL | TASK_GET_REFERRAL | TASK_COMPLETE_EMAIL
        )
    }

    /// Referral bonuses repeat (a referrer earns one per referred user), so
    /// they are excluded from the once-per-user ledger uniqueness rule.
    #[must_use]
    pub fn repeats_per_user(self) -> bool {
        matches!(self, TASK_GIVE_REFERRAL | TASK_GET_REFERRAL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub name: String,
    pub points: i64,
}

/// Immutable task id -> point value mapping, loaded once at engine
/// construction and owned by the engine for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: BTreeMap<TaskId, TaskDefinition>,
}

impl TaskCatalog {
    #[must_use]
    pub fn new(tasks: impl IntoIterator<Item = TaskDefinition>) -> Self {
        Self {
            tasks: tasks.into_iter().map(|task| (task.id, task)).collect(),
        }
    }

    /// Returns `None` for unknown ids so callers can distinguish "exists
    /// with 0 points" from "unknown task".
    #[must_use]
    pub fn points_for(&self, id: TaskId) -> Option<i64> {
        self.tasks.get(&id).map(|task| task.points)
    }

    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<&TaskDefinition> {
        self.tasks.get(&id)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// One immutable record of points granted to a user for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub entry_seq: i64,
    pub entry_id: Ulid,
    pub user_id: UserId,
    pub task_id: TaskId,
    pub points: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub password_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub referrer: Option<UserId>,
    pub email: Option<String>,
}

/// User record joined with the current point balance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStatus {
    pub id: UserId,
    pub username: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub referrer: Option<UserId>,
    pub email: Option<String>,
    pub points: i64,
}

/// Aggregated (user, total) row as read from the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardRow {
    pub user_id: UserId,
    pub points: i64,
}

/// Username-resolved leaderboard view returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub username: String,
    pub points: i64,
}

/// A pending point grant: which task it is attributed to and its value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Grant {
    pub task: TaskId,
    pub points: i64,
}

pub const LEADERBOARD_LIMIT_MAX: u32 = 100;

/// Client-facing classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidArgument,
    Internal,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("referrer {0} not found")]
    ReferrerNotFound(UserId),
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("task {0} is only reachable through its dedicated operation")]
    ReservedTask(TaskId),
    #[error("task {task} already completed by user {user}")]
    AlreadyCompleted { user: UserId, task: TaskId },
    #[error("user {0} already has a referrer")]
    AlreadyLinked(UserId),
    #[error("user {0} cannot be their own referrer")]
    SelfReferral(UserId),
    #[error("leaderboard limit {0} outside 1..={LEADERBOARD_LIMIT_MAX}")]
    InvalidLimit(u32),
    #[error("username {0:?} already taken")]
    UsernameTaken(String),
    #[error("bonus task {0} missing from catalog")]
    MissingBonusTask(TaskId),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UserNotFound(_) | Self::ReferrerNotFound(_) | Self::TaskNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::AlreadyCompleted { .. }
            | Self::AlreadyLinked(_)
            | Self::SelfReferral(_)
            | Self::UsernameTaken(_) => ErrorKind::Conflict,
            Self::ReservedTask(_) | Self::InvalidLimit(_) => ErrorKind::InvalidArgument,
            Self::MissingBonusTask(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Failures surfaced by a storage backend. The engine maps conflict variants
/// to their [`EngineError`] counterparts and wraps everything else as
/// internal.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("ledger entry already exists for user {user} task {task}")]
    DuplicateEntry { user: UserId, task: TaskId },
    #[error("user row not found")]
    RowNotFound,
    #[error("referral link already present")]
    LinkConflict,
    #[error("username already taken")]
    UsernameTaken,
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Append-only point-grant log plus its aggregate read queries.
///
/// `credit` appends without enforcing once-per-user uniqueness in-process;
/// the backing store must carry a uniqueness constraint on
/// `(user_id, task_id)` for tasks where [`TaskId::repeats_per_user`] is
/// false, and report violations as [`StoreError::DuplicateEntry`].
pub trait PointsLedger {
    /// Appends one immutable ledger entry.
    ///
    /// # Errors
    /// [`StoreError::DuplicateEntry`] when the storage uniqueness constraint
    /// rejects a second grant for the same (user, task).
    fn credit(&mut self, user: UserId, task: TaskId, points: i64)
        -> Result<LedgerEntry, StoreError>;

    /// Sum of all granted points for the user; 0 when no rows exist.
    ///
    /// # Errors
    /// Backend failures only; absence of rows is not an error.
    fn balance(&self, user: UserId) -> Result<i64, StoreError>;

    /// Full grant history, most recent first; `recorded_at` ties break by
    /// descending insertion order.
    ///
    /// # Errors
    /// Backend failures only.
    fn history(&self, user: UserId) -> Result<Vec<LedgerEntry>, StoreError>;

    /// # Errors
    /// Backend failures only.
    fn has_completed(&self, user: UserId, task: TaskId) -> Result<bool, StoreError>;

    /// Totals per user, descending by total with ascending user id breaking
    /// ties; at most `limit` rows.
    ///
    /// # Errors
    /// Backend failures only.
    fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardRow>, StoreError>;
}

/// User-record lookups and mutations.
pub trait UserDirectory {
    /// # Errors
    /// [`StoreError::UsernameTaken`] when the username is already present.
    fn create_user(&mut self, username: &str, password_hash: &str) -> Result<User, StoreError>;

    /// # Errors
    /// Backend failures only; an unknown id yields `Ok(None)`.
    fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Stores the email and credits `bonus` at most once per user, as one
    /// atomic unit. A repeated call rewrites the address without a second
    /// grant.
    ///
    /// # Errors
    /// [`StoreError::RowNotFound`] when the user does not exist.
    fn set_email(&mut self, id: UserId, email: &str, bonus: Grant) -> Result<(), StoreError>;
}

/// Atomic dual-credit referral application.
pub trait ReferralUnit {
    /// Credits the referrer bonus, credits the referee bonus, and persists
    /// the referrer link, all in one transaction. Either all three commit or
    /// none do.
    ///
    /// # Errors
    /// [`StoreError::LinkConflict`] when the user's referrer was set
    /// concurrently; [`StoreError::RowNotFound`] when the user row is gone.
    fn apply_referral(
        &mut self,
        user: UserId,
        referrer: UserId,
        referrer_grant: Grant,
        referee_grant: Grant,
    ) -> Result<(), StoreError>;
}

/// Full capability set the rules engine needs from a storage backend.
pub trait GamificationStore: PointsLedger + UserDirectory + ReferralUnit {}

impl<S: PointsLedger + UserDirectory + ReferralUnit> GamificationStore for S {}

/// Stateless orchestrator over the task catalog and a storage backend.
///
/// Every operation is a single request/response; correctness under
/// concurrent requests rests on the storage-layer uniqueness constraint
/// (completion) and transactional referral application, not on in-process
/// locks.
#[derive(Debug)]
pub struct RulesEngine<S> {
    catalog: TaskCatalog,
    store: S,
}

impl<S: GamificationStore> RulesEngine<S> {
    #[must_use]
    pub fn new(catalog: TaskCatalog, store: S) -> Self {
        Self { catalog, store }
    }

    #[must_use]
    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Registers a user record with an opaque, already-hashed password.
    ///
    /// # Errors
    /// [`EngineError::UsernameTaken`] for duplicate usernames.
    pub fn create_user(
        &mut self,
        username: &str,
        password_hash: &str,
    ) -> Result<User, EngineError> {
        match self.store.create_user(username, password_hash) {
            Ok(user) => Ok(user),
            Err(StoreError::UsernameTaken) => {
                Err(EngineError::UsernameTaken(username.to_string()))
            }
            Err(err) => Err(storage_failure("create_user", None, None, &err)),
        }
    }

    /// Grants the task's points to the user at most once.
    ///
    /// The `has_completed` check and the `credit` append are not atomic; a
    /// concurrent duplicate slips through to the storage uniqueness
    /// constraint and comes back as `DuplicateEntry`, which is reported as
    /// `AlreadyCompleted` like the in-process check.
    ///
    /// # Errors
    /// [`EngineError::ReservedTask`], [`EngineError::TaskNotFound`],
    /// [`EngineError::AlreadyCompleted`], or an internal storage failure.
    pub fn complete_task(
        &mut self,
        user: UserId,
        task: TaskId,
    ) -> Result<LedgerEntry, EngineError> {
        if task.is_reserved() {
            return Err(EngineError::ReservedTask(task));
        }

        let points = self
            .catalog
            .points_for(task)
            .ok_or(EngineError::TaskNotFound(task))?;

        let completed = self
            .store
            .has_completed(user, task)
            .map_err(|err| storage_failure("complete_task", Some(user), Some(task), &err))?;
        if completed {
            return Err(EngineError::AlreadyCompleted { user, task });
        }

        match self.store.credit(user, task, points) {
            Ok(entry) => Ok(entry),
            Err(StoreError::DuplicateEntry { .. }) => {
                Err(EngineError::AlreadyCompleted { user, task })
            }
            Err(err) => Err(storage_failure("complete_task", Some(user), Some(task), &err)),
        }
    }

    /// Links `referrer` as the one-time referrer of `user` and credits both
    /// bonuses atomically.
    ///
    /// # Errors
    /// [`EngineError::ReferrerNotFound`], [`EngineError::UserNotFound`],
    /// [`EngineError::SelfReferral`], [`EngineError::AlreadyLinked`],
    /// [`EngineError::MissingBonusTask`], or an internal storage failure.
    pub fn set_referrer(&mut self, user: UserId, referrer: UserId) -> Result<(), EngineError> {
        self.store
            .get_user(referrer)
            .map_err(|err| storage_failure("set_referrer", Some(referrer), None, &err))?
            .ok_or(EngineError::ReferrerNotFound(referrer))?;

        let target = self
            .store
            .get_user(user)
            .map_err(|err| storage_failure("set_referrer", Some(user), None, &err))?
            .ok_or(EngineError::UserNotFound(user))?;

        if referrer == user {
            return Err(EngineError::SelfReferral(user));
        }
        if target.referrer.is_some() {
            return Err(EngineError::AlreadyLinked(user));
        }

        let referrer_grant = self.bonus_grant(TASK_GIVE_REFERRAL)?;
        let referee_grant = self.bonus_grant(TASK_GET_REFERRAL)?;

        match self
            .store
            .apply_referral(user, referrer, referrer_grant, referee_grant)
        {
            Ok(()) => Ok(()),
            Err(StoreError::LinkConflict) => Err(EngineError::AlreadyLinked(user)),
            Err(StoreError::RowNotFound) => Err(EngineError::UserNotFound(user)),
            Err(err) => Err(storage_failure("set_referrer", Some(user), None, &err)),
        }
    }

    /// Stores the user's email; the first successful set also credits the
    /// one-time email bonus. Later calls rewrite the address only.
    ///
    /// # Errors
    /// [`EngineError::UserNotFound`], [`EngineError::MissingBonusTask`], or
    /// an internal storage failure.
    pub fn set_email(&mut self, user: UserId, email: &str) -> Result<(), EngineError> {
        self.store
            .get_user(user)
            .map_err(|err| storage_failure("set_email", Some(user), None, &err))?
            .ok_or(EngineError::UserNotFound(user))?;

        let bonus = self.bonus_grant(TASK_COMPLETE_EMAIL)?;

        match self.store.set_email(user, email, bonus) {
            Ok(()) => Ok(()),
            Err(StoreError::RowNotFound) => Err(EngineError::UserNotFound(user)),
            Err(err) => Err(storage_failure("set_email", Some(user), None, &err)),
        }
    }

    /// # Errors
    /// [`EngineError::UserNotFound`] or an internal storage failure.
    pub fn get_status(&self, user: UserId) -> Result<UserStatus, EngineError> {
        let record = self
            .store
            .get_user(user)
            .map_err(|err| storage_failure("get_status", Some(user), None, &err))?
            .ok_or(EngineError::UserNotFound(user))?;

        let points = self
            .store
            .balance(user)
            .map_err(|err| storage_failure("get_status", Some(user), None, &err))?;

        Ok(UserStatus {
            id: record.id,
            username: record.username,
            created_at: record.created_at,
            referrer: record.referrer,
            email: record.email,
            points,
        })
    }

    /// # Errors
    /// Internal storage failures only; unknown users have empty history.
    pub fn get_history(&self, user: UserId) -> Result<Vec<LedgerEntry>, EngineError> {
        self.store
            .history(user)
            .map_err(|err| storage_failure("get_history", Some(user), None, &err))
    }

    /// # Errors
    /// Internal storage failures only; unknown users have balance 0.
    pub fn get_points(&self, user: UserId) -> Result<i64, EngineError> {
        self.store
            .balance(user)
            .map_err(|err| storage_failure("get_points", Some(user), None, &err))
    }

    /// Ranked snapshot of users by total points, usernames resolved.
    ///
    /// # Errors
    /// [`EngineError::InvalidLimit`] outside `1..=100`; a ledger row whose
    /// user record is missing is an internal inconsistency.
    pub fn get_leaderboard(&self, limit: u32) -> Result<Vec<LeaderboardEntry>, EngineError> {
        if limit == 0 || limit > LEADERBOARD_LIMIT_MAX {
            return Err(EngineError::InvalidLimit(limit));
        }

        let rows = self
            .store
            .leaderboard(limit as usize)
            .map_err(|err| storage_failure("get_leaderboard", None, None, &err))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let record = self
                .store
                .get_user(row.user_id)
                .map_err(|err| storage_failure("get_leaderboard", Some(row.user_id), None, &err))?
                .ok_or_else(|| {
                    tracing::error!(user = %row.user_id, "ledger references a missing user row");
                    EngineError::Internal(format!(
                        "ledger references missing user {}",
                        row.user_id
                    ))
                })?;
            entries.push(LeaderboardEntry {
                username: record.username,
                points: row.points,
            });
        }

        Ok(entries)
    }

    fn bonus_grant(&self, task: TaskId) -> Result<Grant, EngineError> {
        let points = self.catalog.points_for(task).ok_or_else(|| {
            tracing::error!(task = %task, "bonus task missing from catalog");
            EngineError::MissingBonusTask(task)
        })?;
        Ok(Grant { task, points })
    }
}

fn storage_failure(
    operation: &'static str,
    user: Option<UserId>,
    task: Option<TaskId>,
    err: &StoreError,
) -> EngineError {
    tracing::error!(operation, user = ?user, task = ?task, %err, "storage failure");
    EngineError::Internal(format!("{operation}: {err}"))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`EngineError::Internal`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Internal(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Internal(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EngineError::Internal`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Internal(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
