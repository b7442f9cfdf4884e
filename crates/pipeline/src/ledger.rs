use chrono::{DateTime, Utc};
use quasar_chain::Settlement;
use quasar_storage::models::{
    HistoryKind, LedgerBatch, LedgerCommit, NewHistoryEntry, NewPendingClaim, SupersededClaims,
};
use quasar_storage::{StoreError, TipStore};

use crate::batcher::BatchedIntent;

/// What the executor did for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Submitted; `confirmed` may still be false.
    Settled(Settlement),
    /// The sender has no custody material.
    SenderIncapable,
    Failed(String),
}

impl TransferOutcome {
    pub fn settlement(&self) -> Option<&Settlement> {
        match self {
            Self::Settled(settlement) => Some(settlement),
            _ => None,
        }
    }
}

fn claims(intent: &BatchedIntent, settlement_ref: Option<&str>, at: DateTime<Utc>) -> Vec<NewPendingClaim> {
    intent
        .members
        .iter()
        .map(|member| NewPendingClaim {
            account_handle: intent.recipient.clone(),
            amount: member.amount,
            token: intent.token,
            origin_event: member.event_id.clone(),
            sender: intent.sender.clone(),
            settlement_ref: settlement_ref.map(str::to_string),
            at,
        })
        .collect()
}

/// Every write a batch outcome implies. History entries are keyed by the
/// settlement reference, claims by `(origin event, sender)`, so committing
/// the same plan twice changes nothing.
pub fn plan(
    intent: &BatchedIntent,
    outcome: &TransferOutcome,
    recipient_activated: bool,
    at: DateTime<Utc>,
) -> LedgerBatch {
    let Some(settlement) = outcome.settlement() else {
        return LedgerBatch {
            claims: claims(intent, None, at),
            ..LedgerBatch::default()
        };
    };

    let reference = settlement.reference.as_str();
    let sent = NewHistoryEntry {
        account_handle: intent.sender.clone(),
        kind: HistoryKind::Transfer,
        amount: intent.total,
        token: intent.token,
        counterparty: intent.recipient.to_string(),
        settlement_ref: reference.to_string(),
        entry_key: reference.to_string(),
        at,
    };

    if recipient_activated {
        let received = NewHistoryEntry {
            account_handle: intent.recipient.clone(),
            kind: HistoryKind::Tip,
            counterparty: intent.sender.to_string(),
            ..sent.clone()
        };
        LedgerBatch {
            history: vec![received, sent],
            claims: Vec::new(),
            superseded: Some(SupersededClaims {
                account_handle: intent.recipient.clone(),
                sender: intent.sender.clone(),
                origin_events: intent.event_ids(),
            }),
        }
    } else {
        LedgerBatch {
            history: vec![sent],
            claims: claims(intent, Some(reference), at),
            superseded: None,
        }
    }
}

pub async fn commit(store: &dyn TipStore, batch: &LedgerBatch) -> Result<LedgerCommit, StoreError> {
    store.commit_ledger(batch).await
}
