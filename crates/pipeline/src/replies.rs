use crate::batcher::BatchedIntent;
use crate::ledger::TransferOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyUrls {
    /// Prefix the settlement reference is appended to.
    pub explorer_tx_url: String,
    pub signup_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTone {
    Delivered,
    DeliveredClaimOnSignup,
    Recorded,
    RecordedSenderMustSignUp,
}

impl ReplyTone {
    pub fn for_outcome(outcome: &TransferOutcome, recipient_activated: bool) -> Self {
        match outcome {
            TransferOutcome::Settled(_) if recipient_activated => Self::Delivered,
            TransferOutcome::Settled(_) => Self::DeliveredClaimOnSignup,
            TransferOutcome::Failed(_) => Self::Recorded,
            TransferOutcome::SenderIncapable => Self::RecordedSenderMustSignUp,
        }
    }
}

/// A reply ready for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub event_id: String,
    pub text: String,
    pub settlement_ref: Option<String>,
}

/// One reply per batch, addressed to its first member event.
/// Returns `None` for a batch with no members.
pub fn compose(
    intent: &BatchedIntent,
    outcome: &TransferOutcome,
    recipient_activated: bool,
    urls: &ReplyUrls,
) -> Option<Reply> {
    let event_id = intent.first_event()?.to_string();
    let count = intent.members.len();
    let single = count == 1;

    let tips = if single {
        format!("A {} {} tip", intent.total, intent.token)
    } else {
        format!("{count} tips totaling {} {}", intent.total, intent.token)
    };
    let has = if single { "has" } else { "have" };
    let it = if single { "it" } else { "them" };
    let head = format!("{} pay from {} {tips}", intent.recipient, intent.sender);

    let settlement_ref = outcome.settlement().map(|s| s.reference.clone());
    let tx_link = settlement_ref
        .as_deref()
        .map(|r| format!("{}{r}", urls.explorer_tx_url))
        .unwrap_or_default();

    let text = match ReplyTone::for_outcome(outcome, recipient_activated) {
        ReplyTone::Delivered => format!("{head} {has} been sent to your wallet! Tx: {tx_link}"),
        ReplyTone::DeliveredClaimOnSignup => format!(
            "{head} {has} been sent to your wallet! Claim {it} when you sign up on {}. Tx: {tx_link}",
            urls.signup_url
        ),
        ReplyTone::Recorded => format!(
            "{head} {has} been recorded for you! Claim {it} to receive the BscScan link:"
        ),
        ReplyTone::RecordedSenderMustSignUp => format!(
            "{head} {has} been recorded for you! The sender needs to sign up on {} first. Claim {it} to receive the BscScan link:",
            urls.signup_url
        ),
    };

    Some(Reply {
        event_id,
        text,
        settlement_ref,
    })
}

/// Posted to the originating event once a pending claim is claimed.
pub fn claimed_text(username: &str, urls: &ReplyUrls) -> String {
    format!(
        "@{username} has claimed their tip after signing up on {}",
        urls.signup_url
    )
}
