use std::collections::HashMap;

use quasar_core::{Amount, Handle, Token};

use crate::parser::TipIntent;

/// A parsed command together with who sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMention {
    pub event_id: String,
    pub sender: Handle,
    pub intent: TipIntent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    pub event_id: String,
    pub amount: Amount,
}

/// All commands of one poll from one sender to one recipient in one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchedIntent {
    pub sender: Handle,
    pub recipient: Handle,
    pub token: Token,
    pub total: Amount,
    /// Arrival order; never empty for a batch produced by [`group`].
    pub members: Vec<MemberEvent>,
}

impl BatchedIntent {
    /// The event a batch reply is addressed to.
    pub fn first_event(&self) -> Option<&str> {
        self.members.first().map(|m| m.event_id.as_str())
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.event_id.clone()).collect()
    }

    /// Keep only members accepted by `keep` and recompute the total.
    pub fn retain_members(&mut self, mut keep: impl FnMut(&MemberEvent) -> bool) {
        self.members.retain(|m| keep(m));
        self.total = self.members.iter().map(|m| m.amount).sum();
    }
}

/// Group commands by `(sender, recipient, token)`, batches ordered by first
/// appearance. A sender naming two tokens for one recipient gets one batch
/// per token. Self-tips are dropped.
pub fn group(parsed: Vec<ParsedMention>) -> Vec<BatchedIntent> {
    let mut index: HashMap<(Handle, Handle, Token), usize> = HashMap::new();
    let mut batches: Vec<BatchedIntent> = Vec::new();

    for mention in parsed {
        if mention.sender == mention.intent.recipient {
            continue;
        }
        let key = (
            mention.sender.clone(),
            mention.intent.recipient.clone(),
            mention.intent.token,
        );
        let member = MemberEvent {
            event_id: mention.event_id,
            amount: mention.intent.amount,
        };
        match index.get(&key) {
            Some(&i) => {
                let batch = &mut batches[i];
                batch.total = batch.total.saturating_add(member.amount);
                batch.members.push(member);
            }
            None => {
                index.insert(key, batches.len());
                batches.push(BatchedIntent {
                    sender: mention.sender,
                    recipient: mention.intent.recipient,
                    token: mention.intent.token,
                    total: member.amount,
                    members: vec![member],
                });
            }
        }
    }
    batches
}
