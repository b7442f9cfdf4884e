use chrono::{DateTime, Utc};
use quasar_core::{Address, Amount, CustodialWallet, Handle, Token};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

// ─── Account ────────────────────────────────────────────────────────────────

/// Raw `accounts` row. Use [`Account::try_from`] to get the typed view.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountRow {
    pub handle: String,
    pub display_name: String,
    pub avatar_url: String,
    pub bio: String,
    pub address: Option<String>,
    #[serde(skip_serializing, default)]
    pub encrypted_key: Option<String>,
    pub activated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public profile attached when the owner authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    pub avatar_url: String,
    pub bio: String,
}

/// A custodial account whose custody material is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Account {
    /// Auto-provisioned as a tip recipient; the owner has not signed in.
    Provisioned {
        handle: Handle,
        wallet: CustodialWallet,
    },
    /// The owner authenticated at least once.
    Activated {
        handle: Handle,
        wallet: CustodialWallet,
        profile: Profile,
    },
}

impl Account {
    pub fn handle(&self) -> &Handle {
        match self {
            Self::Provisioned { handle, .. } | Self::Activated { handle, .. } => handle,
        }
    }

    pub fn wallet(&self) -> &CustodialWallet {
        match self {
            Self::Provisioned { wallet, .. } | Self::Activated { wallet, .. } => wallet,
        }
    }

    pub fn address(&self) -> Address {
        self.wallet().address
    }

    pub fn is_activated(&self) -> bool {
        matches!(self, Self::Activated { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountRowError {
    /// The row exists but carries no signing material.
    #[error("account {0} has no custody material")]
    MissingCustody(String),

    #[error("account {handle} is malformed: {reason}")]
    Corrupt { handle: String, reason: String },
}

impl TryFrom<AccountRow> for Account {
    type Error = AccountRowError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: &str| AccountRowError::Corrupt {
            handle: row.handle.clone(),
            reason: reason.to_string(),
        };
        let handle = Handle::parse(&row.handle).ok_or_else(|| corrupt("invalid handle"))?;
        let (address, encrypted_key) = match (&row.address, &row.encrypted_key) {
            (Some(address), Some(key)) => (address, key.clone()),
            _ => return Err(AccountRowError::MissingCustody(row.handle.clone())),
        };
        let address: Address = address.parse().map_err(|_| corrupt("invalid address"))?;
        let wallet = CustodialWallet {
            address,
            encrypted_key,
        };

        if row.activated {
            Ok(Self::Activated {
                handle,
                wallet,
                profile: Profile {
                    display_name: row.display_name,
                    avatar_url: row.avatar_url,
                    bio: row.bio,
                },
            })
        } else {
            Ok(Self::Provisioned { handle, wallet })
        }
    }
}

// ─── HistoryEntry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    /// Value received.
    Tip,
    /// Value sent.
    Transfer,
}

impl HistoryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tip => "tip",
            Self::Transfer => "transfer",
        }
    }
}

/// An immutable record of a settled movement on one account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub account_handle: String,
    pub kind: String,
    /// Base units.
    pub amount: String,
    pub token: String,
    pub counterparty: String,
    pub settlement_ref: String,
    /// Idempotency key, unique per (account, kind).
    pub entry_key: String,
    pub created_at: DateTime<Utc>,
}

/// Insert-ready history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub account_handle: Handle,
    pub kind: HistoryKind,
    pub amount: Amount,
    pub token: Token,
    /// A handle for tips, an external address for withdrawals.
    pub counterparty: String,
    pub settlement_ref: String,
    pub entry_key: String,
    pub at: DateTime<Utc>,
}

// ─── PendingClaim ───────────────────────────────────────────────────────────

/// Value owed to an account that has not claimed it yet.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingClaim {
    pub id: i64,
    pub account_handle: String,
    /// Base units.
    pub amount: String,
    pub token: String,
    /// Event that promised the value; also the idempotency key with `sender`.
    pub origin_event: String,
    pub sender: String,
    /// Present when the value already moved on-chain into the custodial wallet.
    pub settlement_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert-ready pending claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPendingClaim {
    pub account_handle: Handle,
    pub amount: Amount,
    pub token: Token,
    pub origin_event: String,
    pub sender: Handle,
    pub settlement_ref: Option<String>,
    pub at: DateTime<Utc>,
}

/// Claims made obsolete by a settled transfer to an activated recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupersededClaims {
    pub account_handle: Handle,
    pub sender: Handle,
    pub origin_events: Vec<String>,
}

/// Every ledger write produced by one batched tip, applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerBatch {
    pub history: Vec<NewHistoryEntry>,
    pub claims: Vec<NewPendingClaim>,
    pub superseded: Option<SupersededClaims>,
}

/// How many rows a [`LedgerBatch`] actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCommit {
    pub history_inserted: u64,
    pub claims_inserted: u64,
    pub claims_removed: u64,
}

// ─── QueuedReply ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ReplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A reply that could not be delivered on the first attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueuedReply {
    pub event_id: String,
    pub reply_text: String,
    pub reply_to: String,
    pub settlement_ref: Option<String>,
    pub attempts: i32,
    pub last_attempt_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedReply {
    pub fn status(&self) -> Option<ReplyStatus> {
        ReplyStatus::parse(&self.status)
    }
}

/// Upsert payload recorded after a failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFailure {
    pub event_id: String,
    pub reply_text: String,
    pub reply_to: String,
    pub settlement_ref: Option<String>,
    pub next_retry_at: DateTime<Utc>,
    /// `Pending` for retryable failures, `Failed` when no channel can ever succeed.
    pub status: ReplyStatus,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Queue counters for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub ready_to_retry: i64,
    pub total: i64,
}
