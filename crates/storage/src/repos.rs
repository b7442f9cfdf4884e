use chrono::{DateTime, Utc};
use quasar_core::{CustodialWallet, Handle};
use sqlx::{Executor, PgPool, Postgres};
use tracing::debug;

use crate::models::*;

const MENTION_CURSOR_KEY: &str = "mention_cursor";

// ─── Account Queries ────────────────────────────────────────────────────────

/// Get a single account by canonical handle.
pub async fn get_account<'e, E>(executor: E, handle: &Handle) -> Result<Option<AccountRow>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE handle = $1")
        .bind(handle.as_str())
        .fetch_optional(executor)
        .await
}

/// Insert a placeholder account for a tip recipient.
/// Returns `false` if a row for this handle already exists.
pub async fn insert_provisioned_account(
    pool: &PgPool,
    handle: &Handle,
    wallet: &CustodialWallet,
    at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO accounts (handle, display_name, address, encrypted_key, activated, created_at, updated_at)
        VALUES ($1, $2, $3, $4, FALSE, $5, $5)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(handle.as_str())
    .bind(handle.username())
    .bind(format!("{:#x}", wallet.address))
    .bind(&wallet.encrypted_key)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Attach custody material to an account that has none.
/// Never overwrites existing material.
pub async fn attach_wallet(
    pool: &PgPool,
    handle: &Handle,
    wallet: &CustodialWallet,
    at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE accounts
        SET address = $2, encrypted_key = $3, updated_at = $4
        WHERE handle = $1 AND encrypted_key IS NULL
        "#,
    )
    .bind(handle.as_str())
    .bind(format!("{:#x}", wallet.address))
    .bind(&wallet.encrypted_key)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Mark an account as owned by an authenticated user, creating it if needed.
/// `wallet` is only used when the account has no custody material yet.
pub async fn upsert_activated_account(
    pool: &PgPool,
    handle: &Handle,
    profile: &Profile,
    wallet: &CustodialWallet,
    at: DateTime<Utc>,
) -> Result<AccountRow, sqlx::Error> {
    sqlx::query_as::<_, AccountRow>(
        r#"
        INSERT INTO accounts (handle, display_name, avatar_url, bio, address, encrypted_key, activated, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $7)
        ON CONFLICT (handle) DO UPDATE SET
            display_name = EXCLUDED.display_name,
            avatar_url = EXCLUDED.avatar_url,
            bio = EXCLUDED.bio,
            activated = TRUE,
            address = CASE WHEN accounts.encrypted_key IS NULL THEN EXCLUDED.address ELSE accounts.address END,
            encrypted_key = COALESCE(accounts.encrypted_key, EXCLUDED.encrypted_key),
            updated_at = EXCLUDED.updated_at
        RETURNING *
        "#,
    )
    .bind(handle.as_str())
    .bind(&profile.display_name)
    .bind(&profile.avatar_url)
    .bind(&profile.bio)
    .bind(format!("{:#x}", wallet.address))
    .bind(&wallet.encrypted_key)
    .bind(at)
    .fetch_one(pool)
    .await
}

// ─── Ledger Queries ─────────────────────────────────────────────────────────

/// Insert a history entry (ignore if the same entry key was already recorded).
pub async fn insert_history_entry<'e, E>(
    executor: E,
    entry: &NewHistoryEntry,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO history_entries (account_handle, kind, amount, token, counterparty, settlement_ref, entry_key, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (account_handle, kind, entry_key) DO NOTHING
        "#,
    )
    .bind(entry.account_handle.as_str())
    .bind(entry.kind.as_str())
    .bind(entry.amount.to_base_string())
    .bind(entry.token.symbol())
    .bind(entry.counterparty.as_str())
    .bind(&entry.settlement_ref)
    .bind(&entry.entry_key)
    .bind(entry.at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Insert a pending claim (ignore if one exists for the same event and sender).
pub async fn insert_pending_claim<'e, E>(
    executor: E,
    claim: &NewPendingClaim,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO pending_claims (account_handle, amount, token, origin_event, sender, settlement_ref, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (account_handle, origin_event, sender) DO NOTHING
        "#,
    )
    .bind(claim.account_handle.as_str())
    .bind(claim.amount.to_base_string())
    .bind(claim.token.symbol())
    .bind(&claim.origin_event)
    .bind(claim.sender.as_str())
    .bind(&claim.settlement_ref)
    .bind(claim.at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Delete claims that a settled transfer made obsolete.
pub async fn delete_superseded_claims<'e, E>(
    executor: E,
    superseded: &SupersededClaims,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        DELETE FROM pending_claims
        WHERE account_handle = $1 AND sender = $2 AND origin_event = ANY($3)
        "#,
    )
    .bind(superseded.account_handle.as_str())
    .bind(superseded.sender.as_str())
    .bind(&superseded.origin_events)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

/// Apply every write of one batched tip inside a single transaction.
pub async fn commit_ledger_batch(pool: &PgPool, batch: &LedgerBatch) -> Result<LedgerCommit, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut commit = LedgerCommit::default();

    for entry in &batch.history {
        if insert_history_entry(&mut *tx, entry).await? {
            commit.history_inserted += 1;
        }
    }
    for claim in &batch.claims {
        if insert_pending_claim(&mut *tx, claim).await? {
            commit.claims_inserted += 1;
        }
    }
    if let Some(superseded) = &batch.superseded {
        commit.claims_removed = delete_superseded_claims(&mut *tx, superseded).await?;
    }

    tx.commit().await?;
    debug!(
        history = commit.history_inserted,
        claims = commit.claims_inserted,
        superseded = commit.claims_removed,
        "Ledger batch committed"
    );
    Ok(commit)
}

/// Get an account's history, newest first.
pub async fn get_history(pool: &PgPool, handle: &Handle) -> Result<Vec<HistoryEntry>, sqlx::Error> {
    sqlx::query_as::<_, HistoryEntry>(
        "SELECT * FROM history_entries WHERE account_handle = $1 ORDER BY created_at DESC, id DESC",
    )
    .bind(handle.as_str())
    .fetch_all(pool)
    .await
}

/// Get an account's pending claims, oldest first.
pub async fn get_pending_claims(
    pool: &PgPool,
    handle: &Handle,
) -> Result<Vec<PendingClaim>, sqlx::Error> {
    sqlx::query_as::<_, PendingClaim>(
        "SELECT * FROM pending_claims WHERE account_handle = $1 ORDER BY created_at, id",
    )
    .bind(handle.as_str())
    .fetch_all(pool)
    .await
}

/// Move one pending claim into the owner's history.
/// Returns `None` if the claim does not exist or belongs to someone else.
pub async fn claim_pending(
    pool: &PgPool,
    handle: &Handle,
    claim_id: i64,
    at: DateTime<Utc>,
) -> Result<Option<HistoryEntry>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let claim = sqlx::query_as::<_, PendingClaim>(
        "SELECT * FROM pending_claims WHERE id = $1 AND account_handle = $2 FOR UPDATE",
    )
    .bind(claim_id)
    .bind(handle.as_str())
    .fetch_optional(&mut *tx)
    .await?;

    let Some(claim) = claim else {
        return Ok(None);
    };

    let entry_key = format!("claim:{}", claim.id);
    sqlx::query(
        r#"
        INSERT INTO history_entries (account_handle, kind, amount, token, counterparty, settlement_ref, entry_key, created_at)
        VALUES ($1, 'tip', $2, $3, $4, $5, $6, $7)
        ON CONFLICT (account_handle, kind, entry_key) DO NOTHING
        "#,
    )
    .bind(&claim.account_handle)
    .bind(&claim.amount)
    .bind(&claim.token)
    .bind(&claim.sender)
    .bind(claim.settlement_ref.as_deref().unwrap_or(&claim.origin_event))
    .bind(&entry_key)
    .bind(at)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM pending_claims WHERE id = $1")
        .bind(claim.id)
        .execute(&mut *tx)
        .await?;

    let entry = sqlx::query_as::<_, HistoryEntry>(
        "SELECT * FROM history_entries WHERE account_handle = $1 AND kind = 'tip' AND entry_key = $2",
    )
    .bind(&claim.account_handle)
    .bind(&entry_key)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(entry))
}

// ─── Processed Event Queries ────────────────────────────────────────────────

/// Return the subset of `event_ids` that were already processed.
pub async fn get_processed_among(
    pool: &PgPool,
    event_ids: &[String],
) -> Result<Vec<String>, sqlx::Error> {
    if event_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT event_id FROM processed_events WHERE event_id = ANY($1)")
            .bind(event_ids)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Record an event as processed. Returns `false` if it already was.
pub async fn mark_event_processed(
    pool: &PgPool,
    event_id: &str,
    at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO processed_events (event_id, processed_at)
        VALUES ($1, $2)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(event_id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

// ─── Reply Queue Queries ────────────────────────────────────────────────────

/// Create or update the queue row for a failed delivery, bumping `attempts`.
/// Rows that already completed are left untouched.
pub async fn upsert_queued_reply(pool: &PgPool, failure: &ReplyFailure) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO queued_replies (event_id, reply_text, reply_to, settlement_ref, attempts, last_attempt_at, next_retry_at, status, last_error, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 1, $5, $6, $7, $8, $5, $5)
        ON CONFLICT (event_id) DO UPDATE SET
            reply_text = EXCLUDED.reply_text,
            settlement_ref = COALESCE(EXCLUDED.settlement_ref, queued_replies.settlement_ref),
            attempts = queued_replies.attempts + 1,
            last_attempt_at = EXCLUDED.last_attempt_at,
            next_retry_at = EXCLUDED.next_retry_at,
            status = EXCLUDED.status,
            last_error = EXCLUDED.last_error,
            updated_at = EXCLUDED.updated_at
        WHERE queued_replies.status <> 'completed'
        "#,
    )
    .bind(&failure.event_id)
    .bind(&failure.reply_text)
    .bind(&failure.reply_to)
    .bind(&failure.settlement_ref)
    .bind(failure.at)
    .bind(failure.next_retry_at)
    .bind(failure.status.as_str())
    .bind(&failure.error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a queued reply as delivered. No-op when the event was never queued.
pub async fn complete_queued_reply(
    pool: &PgPool,
    event_id: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE queued_replies
        SET status = 'completed', last_error = NULL, updated_at = $2
        WHERE event_id = $1
        "#,
    )
    .bind(event_id)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Lease due rows for a retry sweep: `pending` rows whose retry time passed,
/// plus `processing` rows abandoned before `stale_before`.
/// Leased rows move to `processing` with `attempts` incremented.
pub async fn lease_due_replies(
    pool: &PgPool,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<QueuedReply>, sqlx::Error> {
    let mut rows = sqlx::query_as::<_, QueuedReply>(
        r#"
        UPDATE queued_replies
        SET status = 'processing', attempts = attempts + 1, last_attempt_at = $1, updated_at = $1
        WHERE event_id IN (
            SELECT event_id FROM queued_replies
            WHERE (status = 'pending' AND next_retry_at <= $1)
               OR (status = 'processing' AND last_attempt_at <= $2)
            ORDER BY next_retry_at
            LIMIT $3
            FOR UPDATE SKIP LOCKED
        )
        RETURNING *
        "#,
    )
    .bind(now)
    .bind(stale_before)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.sort_by_key(|r| r.next_retry_at);
    if !rows.is_empty() {
        debug!(count = rows.len(), "Leased queued replies");
    }
    Ok(rows)
}

/// Return a leased row to `pending` with a new retry time.
pub async fn reschedule_queued_reply(
    pool: &PgPool,
    event_id: &str,
    next_retry_at: DateTime<Utc>,
    error: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE queued_replies
        SET status = 'pending', next_retry_at = $2, last_error = $3, updated_at = $4
        WHERE event_id = $1 AND status = 'processing'
        "#,
    )
    .bind(event_id)
    .bind(next_retry_at)
    .bind(error)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Park a leased row as `failed`; it stays visible to operators.
pub async fn fail_queued_reply(
    pool: &PgPool,
    event_id: &str,
    error: &str,
    at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE queued_replies
        SET status = 'failed', last_error = $2, updated_at = $3
        WHERE event_id = $1 AND status = 'processing'
        "#,
    )
    .bind(event_id)
    .bind(error)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Get the queue row for one event.
pub async fn get_queued_reply(
    pool: &PgPool,
    event_id: &str,
) -> Result<Option<QueuedReply>, sqlx::Error> {
    sqlx::query_as::<_, QueuedReply>("SELECT * FROM queued_replies WHERE event_id = $1")
        .bind(event_id)
        .fetch_optional(pool)
        .await
}

/// Queue counters by status.
pub async fn get_queue_stats(pool: &PgPool, now: DateTime<Utc>) -> Result<QueueStats, sqlx::Error> {
    let row: (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FILTER (WHERE status = 'pending'),
               COUNT(*) FILTER (WHERE status = 'processing'),
               COUNT(*) FILTER (WHERE status = 'completed'),
               COUNT(*) FILTER (WHERE status = 'failed'),
               COUNT(*) FILTER (WHERE status = 'pending' AND next_retry_at <= $1),
               COUNT(*)
        FROM queued_replies
        "#,
    )
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(QueueStats {
        pending: row.0,
        processing: row.1,
        completed: row.2,
        failed: row.3,
        ready_to_retry: row.4,
        total: row.5,
    })
}

// ─── Bot State ──────────────────────────────────────────────────────────────

/// Get the newest mention id handled by a completed poll cycle.
pub async fn get_mention_cursor(pool: &PgPool) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM bot_state WHERE key = $1")
        .bind(MENTION_CURSOR_KEY)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.0))
}

/// Persist the mention cursor.
pub async fn set_mention_cursor(pool: &PgPool, cursor: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO bot_state (key, value)
        VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(MENTION_CURSOR_KEY)
    .bind(cursor)
    .execute(pool)
    .await?;
    Ok(())
}
