use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use quasar_chain::{
    AesCustody, ChainError, Custody, FeeQuote, PrivateKeySigner, Settlement, TransferRequest,
    ValueTransfer,
};
use quasar_core::{Address, Amount, AppError, CustodialWallet, Handle, Token, U256};
use quasar_social::{
    Delivery, EventSource, Mention, MentionPage, OperatorContext, OperatorNotifier, ReplyChannel,
    SocialError, SourceError,
};
use quasar_storage::models::{
    Account, AccountRow, HistoryEntry, LedgerBatch, LedgerCommit, PendingClaim, Profile,
    QueueStats, QueuedReply, ReplyFailure, ReplyStatus,
};
use quasar_storage::{MemoryStore, StoreError, TipStore};

use crate::claims::{ClaimError, ClaimService};
use crate::clock::{Clock, ManualClock};
use crate::cycle::{Pipeline, PipelineConfig};
use crate::dispatcher::{DispatchOutcome, DispatchPolicy, ReplyDispatcher};
use crate::executor::{TransferError, TransferExecutor};
use crate::parser::CommandParser;
use crate::replies::{Reply, ReplyUrls};
use crate::resolver::AccountResolver;
use crate::wallet::{WalletError, WalletService};

// ─── Fakes ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedSource {
    pages: Mutex<VecDeque<Result<MentionPage, SourceError>>>,
    calls: Mutex<Vec<Option<String>>>,
}

impl ScriptedSource {
    fn push(&self, page: Result<MentionPage, SourceError>) {
        self.pages.lock().unwrap().push_back(page);
    }

    fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn search(&self, _query: &str, since_id: Option<&str>) -> Result<MentionPage, SourceError> {
        self.calls.lock().unwrap().push(since_id.map(str::to_string));
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(MentionPage::default()))
    }
}

/// Replays scripted deliveries, then succeeds.
struct ScriptedChannel {
    name: String,
    script: Mutex<VecDeque<Delivery>>,
    posts: Mutex<Vec<(String, String)>>,
}

impl ScriptedChannel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::default(),
            posts: Mutex::default(),
        }
    }

    fn then(&self, delivery: Delivery) {
        self.script.lock().unwrap().push_back(delivery);
    }

    fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplyChannel for ScriptedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn post_reply(&self, text: &str, in_reply_to: &str) -> Delivery {
        let mut posts = self.posts.lock().unwrap();
        posts.push((text.to_string(), in_reply_to.to_string()));
        let n = posts.len();
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Delivery::Sent {
                reply_id: format!("reply-{n}"),
            })
    }
}

#[derive(Default)]
struct RecordingOperator {
    notes: Mutex<Vec<(String, OperatorContext)>>,
}

impl RecordingOperator {
    fn notes(&self) -> Vec<(String, OperatorContext)> {
        self.notes.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperatorNotifier for RecordingOperator {
    async fn notify_operator(&self, text: &str, context: &OperatorContext) -> Result<(), SocialError> {
        self.notes
            .lock()
            .unwrap()
            .push((text.to_string(), context.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainMode {
    Confirm,
    Revert,
    Timeout,
}

struct FakeChain {
    balances: Mutex<HashMap<(Address, Token), U256>>,
    fee: FeeQuote,
    mode: Mutex<ChainMode>,
    submissions: Mutex<Vec<TransferRequest>>,
}

impl FakeChain {
    fn new() -> Self {
        Self {
            balances: Mutex::default(),
            fee: FeeQuote {
                gas_limit: 21_000,
                gas_price: 1_000_000_000,
            },
            mode: Mutex::new(ChainMode::Confirm),
            submissions: Mutex::default(),
        }
    }

    fn set_balance(&self, owner: Address, token: Token, units: U256) {
        self.balances.lock().unwrap().insert((owner, token), units);
    }

    fn set_mode(&self, mode: ChainMode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn submissions(&self) -> Vec<TransferRequest> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ValueTransfer for FakeChain {
    async fn quote_fee(&self, _request: &TransferRequest) -> Result<FeeQuote, ChainError> {
        Ok(self.fee)
    }

    async fn balance(&self, owner: Address, token: Token) -> Result<U256, ChainError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&(owner, token))
            .copied()
            .unwrap_or(U256::ZERO))
    }

    async fn submit_and_await_settlement(
        &self,
        signer: PrivateKeySigner,
        request: &TransferRequest,
        _fee: FeeQuote,
        _timeout: StdDuration,
    ) -> Result<Settlement, ChainError> {
        assert_eq!(signer.address(), request.from);
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push(request.clone());
        let reference = format!("0xsettle{}", submissions.len());
        match *self.mode.lock().unwrap() {
            ChainMode::Confirm => Ok(Settlement {
                reference,
                confirmed: true,
            }),
            ChainMode::Timeout => Ok(Settlement {
                reference,
                confirmed: false,
            }),
            ChainMode::Revert => Err(ChainError::Reverted { reference }),
        }
    }
}

/// [`MemoryStore`] plus interleavings a second process could cause.
struct HookedStore {
    inner: Arc<MemoryStore>,
    /// Marking the key first marks the listed ids, as an overlapping cycle would.
    mark_races: Mutex<HashMap<String, Vec<String>>>,
    /// A concurrent resolver inserts this wallet just before ours.
    insert_race: Mutex<Option<CustodialWallet>>,
    /// Rows for these handles come back with an unparsable address.
    corrupt: Mutex<HashSet<String>>,
}

impl HookedStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            mark_races: Mutex::default(),
            insert_race: Mutex::default(),
            corrupt: Mutex::default(),
        }
    }

    fn race_mark(&self, trigger: &str, stolen: &[&str]) {
        self.mark_races.lock().unwrap().insert(
            trigger.to_string(),
            stolen.iter().map(|id| id.to_string()).collect(),
        );
    }

    fn race_insert(&self, wallet: CustodialWallet) {
        *self.insert_race.lock().unwrap() = Some(wallet);
    }

    fn corrupt(&self, name: &str) {
        self.corrupt.lock().unwrap().insert(handle(name).to_string());
    }
}

#[async_trait]
impl TipStore for HookedStore {
    async fn processed_among(&self, event_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        self.inner.processed_among(event_ids).await
    }

    async fn mark_processed(&self, event_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let stolen = self.mark_races.lock().unwrap().remove(event_id);
        for id in stolen.unwrap_or_default() {
            self.inner.mark_processed(&id, at).await?;
        }
        self.inner.mark_processed(event_id, at).await
    }

    async fn find_account(&self, handle: &Handle) -> Result<Option<AccountRow>, StoreError> {
        let row = self.inner.find_account(handle).await?;
        if self.corrupt.lock().unwrap().contains(handle.as_str()) {
            return Ok(row.map(|row| AccountRow {
                address: Some("not-an-address".into()),
                encrypted_key: Some("garbage".into()),
                ..row
            }));
        }
        Ok(row)
    }

    async fn insert_provisioned_account(
        &self,
        handle: &Handle,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let racer = self.insert_race.lock().unwrap().take();
        if let Some(racer) = racer {
            self.inner.insert_provisioned_account(handle, &racer, at).await?;
        }
        self.inner.insert_provisioned_account(handle, wallet, at).await
    }

    async fn attach_wallet(
        &self,
        handle: &Handle,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.attach_wallet(handle, wallet, at).await
    }

    async fn activate_account(
        &self,
        handle: &Handle,
        profile: &Profile,
        wallet: &CustodialWallet,
        at: DateTime<Utc>,
    ) -> Result<AccountRow, StoreError> {
        self.inner.activate_account(handle, profile, wallet, at).await
    }

    async fn commit_ledger(&self, batch: &LedgerBatch) -> Result<LedgerCommit, StoreError> {
        self.inner.commit_ledger(batch).await
    }

    async fn history(&self, handle: &Handle) -> Result<Vec<HistoryEntry>, StoreError> {
        self.inner.history(handle).await
    }

    async fn pending_claims(&self, handle: &Handle) -> Result<Vec<PendingClaim>, StoreError> {
        self.inner.pending_claims(handle).await
    }

    async fn claim_pending(
        &self,
        handle: &Handle,
        claim_id: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        self.inner.claim_pending(handle, claim_id, at).await
    }

    async fn enqueue_reply(&self, failure: &ReplyFailure) -> Result<(), StoreError> {
        self.inner.enqueue_reply(failure).await
    }

    async fn complete_reply(&self, event_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.complete_reply(event_id, at).await
    }

    async fn lease_due_replies(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueuedReply>, StoreError> {
        self.inner.lease_due_replies(now, stale_before, limit).await
    }

    async fn reschedule_reply(
        &self,
        event_id: &str,
        next_retry_at: DateTime<Utc>,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.reschedule_reply(event_id, next_retry_at, error, at).await
    }

    async fn fail_reply(
        &self,
        event_id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.fail_reply(event_id, error, at).await
    }

    async fn queued_reply(&self, event_id: &str) -> Result<Option<QueuedReply>, StoreError> {
        self.inner.queued_reply(event_id).await
    }

    async fn queue_stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
        self.inner.queue_stats(now).await
    }

    async fn cursor(&self) -> Result<Option<String>, StoreError> {
        self.inner.cursor().await
    }

    async fn set_cursor(&self, cursor: &str) -> Result<(), StoreError> {
        self.inner.set_cursor(cursor).await
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

fn handle(raw: &str) -> Handle {
    Handle::parse(raw).unwrap()
}

fn amount(text: &str) -> Amount {
    Amount::parse_decimal(text).unwrap()
}

fn urls() -> ReplyUrls {
    ReplyUrls {
        explorer_tx_url: "https://bscscan.com/tx/".into(),
        signup_url: "quasar.tips".into(),
    }
}

fn mention(id: &str, author: &str, text: &str) -> Mention {
    Mention {
        id: id.into(),
        text: text.into(),
        author: handle(author),
        created_at: None,
    }
}

fn page(mentions: Vec<Mention>) -> MentionPage {
    let newest_id = mentions.iter().map(|m| m.id.clone()).max_by_key(|id| (id.len(), id.clone()));
    MentionPage {
        mentions,
        newest_id,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    source: Arc<ScriptedSource>,
    channel: Arc<ScriptedChannel>,
    operator: Arc<RecordingOperator>,
    chain: Arc<FakeChain>,
    clock: Arc<ManualClock>,
    dispatcher: Arc<ReplyDispatcher>,
    pipeline: Pipeline,
    claims: ClaimService,
    wallets: WalletService,
}

impl Harness {
    fn new() -> Self {
        Self::with_channels(|primary| vec![primary])
    }

    fn with_channels(
        channels: impl FnOnce(Arc<dyn ReplyChannel>) -> Vec<Arc<dyn ReplyChannel>>,
    ) -> Self {
        Self::build(channels, |store| store as Arc<dyn TipStore>)
    }

    /// Components see `wrap(store)`; assertions read the inner store directly.
    fn with_store(wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn TipStore>) -> Self {
        Self::build(|primary| vec![primary], wrap)
    }

    fn build(
        channels: impl FnOnce(Arc<dyn ReplyChannel>) -> Vec<Arc<dyn ReplyChannel>>,
        wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn TipStore>,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let shared = wrap(store.clone());
        let source = Arc::new(ScriptedSource::default());
        let channel = Arc::new(ScriptedChannel::new("x"));
        let operator = Arc::new(RecordingOperator::default());
        let chain = Arc::new(FakeChain::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let custody = Arc::new(AesCustody::new("pipeline-test-key").unwrap());

        let dispatcher = Arc::new(ReplyDispatcher::new(
            shared.clone(),
            channels(channel.clone()),
            Some(operator.clone() as Arc<dyn OperatorNotifier>),
            clock.clone(),
            DispatchPolicy::default(),
        ));
        let bot = handle("@Quasartip");
        let pipeline = Pipeline::new(
            source.clone(),
            shared.clone(),
            CommandParser::new(&bot).unwrap(),
            AccountResolver::new(shared.clone(), custody.clone(), clock.clone()),
            TransferExecutor::new(custody.clone(), chain.clone(), StdDuration::from_secs(5)),
            dispatcher.clone(),
            clock.clone(),
            PipelineConfig {
                query: "@Quasartip -is:retweet".into(),
                bot_handle: bot,
                urls: urls(),
            },
        );
        let wallets = WalletService::new(
            shared.clone(),
            TransferExecutor::new(custody.clone(), chain.clone(), StdDuration::from_secs(5)),
            chain.clone(),
            clock.clone(),
        );
        let claims = ClaimService::new(
            shared,
            custody,
            dispatcher.clone(),
            clock.clone(),
            urls(),
        );

        Self {
            store,
            source,
            channel,
            operator,
            chain,
            clock,
            dispatcher,
            pipeline,
            claims,
            wallets,
        }
    }

    async fn activated(&self, name: &str) -> Account {
        self.claims
            .activate(&handle(name), Profile::default())
            .await
            .unwrap()
    }

    /// Activated sender holding `bnb` plus exactly one transfer fee.
    async fn funded(&self, name: &str, bnb: &str) -> Account {
        let account = self.activated(name).await;
        let units = amount(bnb).base_units() + self.chain.fee.total();
        self.chain.set_balance(account.address(), Token::Bnb, units);
        account
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn functional_activated_recipient_receives_transfer_and_history() {
    let h = Harness::new();
    let alice = h.funded("alice", "1").await;
    let bob = h.activated("bob").await;
    h.source.push(Ok(page(vec![mention(
        "100",
        "alice",
        "@Quasartip tip 0.5 bnb to @bob",
    )])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(report.batches, 1);
    assert_eq!(report.transfer_failures, 0);

    let submissions = h.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].from, alice.address());
    assert_eq!(submissions[0].to, bob.address());
    assert_eq!(submissions[0].amount, amount("0.5"));

    let sent = h.store.history(&handle("alice")).await.unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, "transfer");
    assert_eq!(sent[0].amount, amount("0.5").to_base_string());
    assert_eq!(sent[0].counterparty, "@bob");

    let received = h.store.history(&handle("bob")).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, "tip");
    assert_eq!(received[0].settlement_ref, "0xsettle1");
    assert!(h.store.pending_claims(&handle("bob")).await.unwrap().is_empty());

    let posts = h.channel.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].1, "100");
    assert!(posts[0].0.contains("https://bscscan.com/tx/0xsettle1"));
    assert!(h.store.queued_reply("100").await.unwrap().is_none());
}

#[tokio::test]
async fn functional_two_tips_to_unactivated_recipient_settle_once() {
    let h = Harness::new();
    h.funded("alice", "1").await;
    h.source.push(Ok(page(vec![
        mention("201", "alice", "@Quasartip tip 0.2 bnb to @bob"),
        mention("202", "alice", "@Quasartip tip @bob 0.3"),
    ])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.batches, 1);
    assert_eq!(report.processed, 2);

    let submissions = h.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].amount, amount("0.5"));

    let claims = h.store.pending_claims(&handle("bob")).await.unwrap();
    let origins: Vec<_> = claims.iter().map(|c| c.origin_event.as_str()).collect();
    assert_eq!(origins, ["201", "202"]);
    assert!(claims
        .iter()
        .all(|c| c.settlement_ref.as_deref() == Some("0xsettle1")));
    assert!(h.store.history(&handle("bob")).await.unwrap().is_empty());

    let bob = h.store.find_account(&handle("bob")).await.unwrap().unwrap();
    assert!(!bob.activated);
    assert!(bob.encrypted_key.is_some());

    let posts = h.channel.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].1, "201");
    assert!(posts[0].0.contains("2 tips totaling 0.5 BNB"));
    assert!(posts[0].0.contains("Claim them when you sign up on quasar.tips"));
}

#[tokio::test]
async fn functional_sender_without_custody_records_claim_without_chain_call() {
    let h = Harness::new();
    h.source.push(Ok(page(vec![mention(
        "300",
        "alice",
        "@Quasartip tip 1 bnb @bob",
    )])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.batches, 1);
    assert_eq!(report.transfer_failures, 0);
    assert!(h.chain.submissions().is_empty());
    assert!(h.store.find_account(&handle("alice")).await.unwrap().is_none());

    let claims = h.store.pending_claims(&handle("bob")).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].settlement_ref, None);
    assert_eq!(claims[0].sender, "@alice");

    let posts = h.channel.posts();
    assert!(posts[0].0.contains("The sender needs to sign up on quasar.tips first."));
}

#[tokio::test]
async fn functional_rate_limited_reply_is_queued_and_swept_after_resume() {
    let h = Harness::new();
    h.funded("alice", "1").await;
    h.channel.then(Delivery::Retryable {
        error: "429".into(),
        resume_at: Some(t0() + Duration::minutes(10)),
    });
    h.source.push(Ok(page(vec![mention(
        "400",
        "alice",
        "@Quasartip tip 0.1 to @bob",
    )])));

    h.pipeline.run_poll_cycle(None).await.unwrap();
    let queued = h.store.queued_reply("400").await.unwrap().unwrap();
    assert_eq!(queued.status(), Some(ReplyStatus::Pending));
    assert_eq!(queued.next_retry_at, t0() + Duration::minutes(10));
    assert_eq!(queued.attempts, 1);
    assert_eq!(queued.settlement_ref.as_deref(), Some("0xsettle1"));

    let notes = h.operator.notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].1.event_id, "400");

    h.clock.advance(Duration::minutes(5));
    let early = h.pipeline.run_retry_sweep().await.unwrap();
    assert_eq!(early.attempted, 0);
    assert_eq!(h.channel.posts().len(), 1);

    h.clock.advance(Duration::minutes(6));
    let late = h.pipeline.run_retry_sweep().await.unwrap();
    assert_eq!((late.attempted, late.succeeded, late.failed), (1, 1, 0));

    let queued = h.store.queued_reply("400").await.unwrap().unwrap();
    assert_eq!(queued.status(), Some(ReplyStatus::Completed));
    assert_eq!(queued.attempts, 2);
    let posts = h.channel.posts();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[1].1, "400");
}

// ─── Properties ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn functional_repeated_fetch_has_one_ledger_effect() {
    let h = Harness::new();
    h.funded("alice", "1").await;
    h.activated("bob").await;
    let fetch = page(vec![mention("500", "alice", "@Quasartip tip 0.5 bnb to @bob")]);
    h.source.push(Ok(fetch.clone()));
    h.source.push(Ok(fetch));

    h.pipeline.run_poll_cycle(None).await.unwrap();
    let second = h.pipeline.run_poll_cycle(None).await.unwrap();

    assert_eq!(second.fetched, 1);
    assert_eq!(second.fresh, 0);
    assert_eq!(second.batches, 0);
    assert_eq!(h.chain.submissions().len(), 1);
    assert_eq!(h.store.history(&handle("bob")).await.unwrap().len(), 1);
    assert_eq!(h.channel.posts().len(), 1);
}

#[tokio::test]
async fn functional_batch_total_is_the_sum_with_one_reference() {
    let h = Harness::new();
    h.funded("alice", "1").await;
    h.activated("bob").await;
    h.source.push(Ok(page(vec![
        mention("601", "alice", "@Quasartip tip 0.1 bnb to @bob"),
        mention("602", "carol", "@Quasartip tip 0.1 bnb to @bob"),
        mention("603", "alice", "@Quasartip tip 0.2 bnb to @bob"),
        mention("604", "alice", "@Quasartip tip 0.3 bnb to @bob"),
    ])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.batches, 2);
    assert_eq!(report.processed, 4);

    let submissions = h.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].amount, amount("0.6"));

    let received = h.store.history(&handle("bob")).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].amount, amount("0.6").to_base_string());
    // carol cannot send, so her tip waits as a claim.
    let claims = h.store.pending_claims(&handle("bob")).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].origin_event, "602");
}

#[tokio::test]
async fn functional_claim_round_trip_after_activation() {
    let h = Harness::new();
    h.funded("alice", "1").await;
    h.source.push(Ok(page(vec![
        mention("701", "alice", "@Quasartip tip 0.2 bnb to @bob"),
        mention("702", "carol", "@Quasartip tip 0.4 bnb to @bob"),
    ])));
    h.pipeline.run_poll_cycle(None).await.unwrap();

    let pending = h.store.pending_claims(&handle("bob")).await.unwrap();
    assert_eq!(pending.len(), 2);
    let err = h.claims.claim(&handle("bob"), pending[0].id).await.unwrap_err();
    assert!(matches!(err, ClaimError::NotActivated(_)));

    let provisioned = h.store.find_account(&handle("bob")).await.unwrap().unwrap();
    let bob = h.activated("bob").await;
    assert_eq!(Some(format!("{:#x}", bob.address())), provisioned.address);

    let first = h.claims.claim(&handle("bob"), pending[0].id).await.unwrap();
    assert_eq!(first.settlement_ref, "0xsettle1");
    assert_eq!(first.kind, "tip");
    let again = h.claims.claim(&handle("bob"), pending[0].id).await.unwrap_err();
    assert!(matches!(again, ClaimError::ClaimNotFound(_)));

    let rest = h.claims.claim_all(&handle("bob")).await.unwrap();
    assert_eq!(rest.len(), 1);
    // No transfer backed carol's tip, so the reference is the event itself.
    assert_eq!(rest[0].settlement_ref, "702");

    assert!(h.store.pending_claims(&handle("bob")).await.unwrap().is_empty());
    assert_eq!(h.store.history(&handle("bob")).await.unwrap().len(), 2);

    let posts = h.channel.posts();
    let confirmations: Vec<_> = posts
        .iter()
        .filter(|(text, _)| text.starts_with("@bob has claimed their tip"))
        .map(|(_, to)| to.as_str())
        .collect();
    assert_eq!(confirmations, ["701", "702"]);
}

#[tokio::test]
async fn functional_claim_for_unknown_account_is_not_found() {
    let h = Harness::new();
    let err = h.claims.claim_all(&handle("nobody")).await.unwrap_err();
    assert!(matches!(err, ClaimError::NotFound(_)));
}

#[tokio::test]
async fn functional_balance_covering_amount_plus_fee_exactly_succeeds() {
    let h = Harness::new();
    h.funded("alice", "0.5").await;
    h.source.push(Ok(page(vec![mention("800", "alice", "@Quasartip tip 0.5 to @bob")])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.transfer_failures, 0);
    assert_eq!(h.chain.submissions().len(), 1);
}

#[tokio::test]
async fn functional_balance_one_wei_short_of_fee_fails_and_records_claim() {
    let h = Harness::new();
    let alice = h.activated("alice").await;
    let short = amount("0.5").base_units() + h.chain.fee.total() - U256::from(1u8);
    h.chain.set_balance(alice.address(), Token::Bnb, short);
    h.source.push(Ok(page(vec![
        mention("810", "alice", "@Quasartip tip 0.5 to @bob"),
        mention("811", "carol", "@Quasartip tip 1 to @dave"),
    ])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.batches, 2);
    assert_eq!(report.transfer_failures, 1);
    assert!(h.chain.submissions().is_empty());

    let claims = h.store.pending_claims(&handle("bob")).await.unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].settlement_ref, None);
    // The failing batch did not stop the next one.
    assert_eq!(h.store.pending_claims(&handle("dave")).await.unwrap().len(), 1);

    let posts = h.channel.posts();
    assert!(posts[0].0.contains("has been recorded for you! Claim it"));
}

#[tokio::test]
async fn functional_usdc_transfer_needs_native_fee() {
    let h = Harness::new();
    let alice = h.activated("alice").await;
    h.chain
        .set_balance(alice.address(), Token::Usdc, amount("5").base_units());
    h.source.push(Ok(page(vec![mention("820", "alice", "@Quasartip tip 5 usdc to @bob")])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.transfer_failures, 1);
    assert!(h.chain.submissions().is_empty());

    h.chain
        .set_balance(alice.address(), Token::Bnb, h.chain.fee.total());
    h.source.push(Ok(page(vec![mention("821", "alice", "@Quasartip tip 5 usdc to @bob")])));
    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.transfer_failures, 0);
    let submissions = h.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].token, Token::Usdc);
}

#[tokio::test]
async fn functional_reverted_transfer_is_recorded_as_claim() {
    let h = Harness::new();
    h.funded("alice", "1").await;
    h.chain.set_mode(ChainMode::Revert);
    h.source.push(Ok(page(vec![mention("830", "alice", "@Quasartip tip 0.5 to @bob")])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.transfer_failures, 1);
    assert_eq!(h.chain.submissions().len(), 1);
    assert!(h.store.history(&handle("alice")).await.unwrap().is_empty());
    assert_eq!(h.store.pending_claims(&handle("bob")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn functional_unconfirmed_transfer_is_recorded_as_sent() {
    let h = Harness::new();
    h.funded("alice", "1").await;
    h.activated("bob").await;
    h.chain.set_mode(ChainMode::Timeout);
    h.source.push(Ok(page(vec![mention("840", "alice", "@Quasartip tip 0.5 to @bob")])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.transfer_failures, 0);
    let received = h.store.history(&handle("bob")).await.unwrap();
    assert_eq!(received[0].settlement_ref, "0xsettle1");
    assert!(h.channel.posts()[0].0.contains("0xsettle1"));
}

// ─── Cycle boundaries ───────────────────────────────────────────────────────

#[tokio::test]
async fn functional_scheduled_poll_advances_cursor_after_success() {
    let h = Harness::new();
    h.source.push(Ok(page(vec![
        mention("900", "alice", "gm"),
        mention("1001", "alice", "@Quasartip tip 1 to @bob"),
    ])));

    let report = h.pipeline.run_scheduled_poll().await.unwrap();
    assert_eq!(report.newest_id.as_deref(), Some("1001"));
    assert_eq!(h.store.cursor().await.unwrap().as_deref(), Some("1001"));

    h.source.push(Ok(MentionPage {
        mentions: Vec::new(),
        newest_id: Some("950".into()),
    }));
    h.pipeline.run_scheduled_poll().await.unwrap();
    assert_eq!(h.source.calls(), [None, Some("1001".to_string())]);
    // An older id never moves the cursor back.
    assert_eq!(h.store.cursor().await.unwrap().as_deref(), Some("1001"));
}

#[tokio::test]
async fn regression_ledger_failure_aborts_cycle_and_keeps_cursor() {
    let h = Harness::new();
    h.store.set_cursor("10").await.unwrap();
    h.store.fail_ledger_commits(true).await;
    h.source.push(Ok(page(vec![mention("11", "alice", "@Quasartip tip 1 to @bob")])));

    let err = h.pipeline.run_scheduled_poll().await.unwrap_err();
    assert!(matches!(err, AppError::Database(_)));
    assert_eq!(h.store.cursor().await.unwrap().as_deref(), Some("10"));
    assert!(h.channel.posts().is_empty());
}

#[tokio::test]
async fn regression_unavailable_store_aborts_before_any_effect() {
    let h = Harness::new();
    h.store.set_unavailable(true).await;
    h.source.push(Ok(page(vec![mention("12", "alice", "@Quasartip tip 1 to @bob")])));

    assert!(h.pipeline.run_poll_cycle(None).await.is_err());
    h.store.set_unavailable(false).await;
    assert_eq!(h.store.processed_count().await, 0);
    assert!(h.chain.submissions().is_empty());
}

#[tokio::test]
async fn functional_rate_limited_search_skips_the_cycle() {
    let h = Harness::new();
    let resume = t0() + Duration::minutes(15);
    h.source.push(Err(SourceError::RateLimited {
        resume_at: Some(resume),
    }));

    let report = h.pipeline.run_scheduled_poll().await.unwrap();
    assert_eq!(report.rate_limited_until, Some(resume));
    assert_eq!(report.fetched, 0);
    assert_eq!(h.store.cursor().await.unwrap(), None);
}

#[tokio::test]
async fn functional_unreachable_source_is_an_upstream_error() {
    let h = Harness::new();
    h.source.push(Err(SourceError::Upstream("connection reset".into())));

    let err = h.pipeline.run_poll_cycle(None).await.unwrap_err();
    assert!(matches!(err, AppError::Upstream(_)));
}

#[tokio::test]
async fn functional_non_commands_are_marked_and_ignored() {
    let h = Harness::new();
    h.source.push(Ok(page(vec![
        mention("21", "quasartip", "@Quasartip tip 1 to @bob"),
        mention("22", "alice", "@Quasartip how do I tip?"),
        mention("23", "alice", "@Quasartip tip 1 to @alice"),
        mention("24", "alice", "@Quasartip tip 0 to @bob"),
    ])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.fresh, 4);
    assert_eq!(report.ignored, 4);
    assert_eq!(report.batches, 0);
    assert_eq!(h.store.processed_count().await, 4);
    assert!(h.channel.posts().is_empty());
    assert!(h.store.find_account(&handle("bob")).await.unwrap().is_none());
}

// ─── Failure isolation ──────────────────────────────────────────────────────

fn hooked() -> (Harness, Arc<HookedStore>) {
    let mut hooks = None;
    let h = Harness::with_store(|inner| {
        let store = Arc::new(HookedStore::new(inner));
        hooks = Some(store.clone());
        store as Arc<dyn TipStore>
    });
    (h, hooks.unwrap())
}

#[tokio::test]
async fn regression_settled_transfer_with_failed_ledger_write_reaches_operator() {
    let h = Harness::new();
    h.funded("alice", "1").await;
    h.activated("bob").await;
    h.store.fail_ledger_commits(true).await;
    let fetch = page(vec![mention("1201", "alice", "@Quasartip tip 0.5 bnb to @bob")]);
    h.source.push(Ok(fetch.clone()));
    h.source.push(Ok(fetch));

    let err = h.pipeline.run_scheduled_poll().await.unwrap_err();
    assert!(matches!(err, AppError::Database(_)));
    assert_eq!(h.chain.submissions().len(), 1);

    let notes = h.operator.notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].1.event_id, "1201");
    assert_eq!(notes[0].1.settlement_ref.as_deref(), Some("0xsettle1"));
    assert!(notes[0].0.contains("transfer 0xsettle1 settled"));
    assert!(notes[0].0.contains("1201"));

    // The sender still learns the value moved.
    let posts = h.channel.posts();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].0.contains("0xsettle1"));

    h.store.fail_ledger_commits(false).await;
    let again = h.pipeline.run_scheduled_poll().await.unwrap();
    assert_eq!(again.fresh, 0);
    assert_eq!(h.chain.submissions().len(), 1);
}

#[tokio::test]
async fn regression_unresolvable_batch_is_dropped_and_later_batches_run() {
    let (h, hooks) = hooked();
    h.funded("alice", "1").await;
    h.activated("bob").await;
    hooks.corrupt("bob");
    let fetch = page(vec![
        mention("1101", "alice", "@Quasartip tip 0.1 to @bob"),
        mention("1102", "alice", "@Quasartip tip 0.2 to @carol"),
    ]);
    h.source.push(Ok(fetch.clone()));
    h.source.push(Ok(fetch));

    let report = h.pipeline.run_scheduled_poll().await.unwrap();
    assert_eq!(report.unresolved, 1);
    assert_eq!(report.batches, 1);
    assert_eq!(report.processed, 2);
    assert_eq!(h.store.cursor().await.unwrap().as_deref(), Some("1102"));

    let submissions = h.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].amount, amount("0.2"));
    assert!(h
        .operator
        .notes()
        .iter()
        .any(|(text, context)| context.event_id == "1101" && text.contains("Tip batch dropped")));

    let again = h.pipeline.run_scheduled_poll().await.unwrap();
    assert_eq!(again.fresh, 0);
    assert_eq!(h.chain.submissions().len(), 1);
}

#[tokio::test]
async fn regression_member_marked_by_overlapping_cycle_leaves_the_batch() {
    let (h, hooks) = hooked();
    h.funded("alice", "1").await;
    h.activated("bob").await;
    hooks.race_mark("1301", &["1302"]);
    h.source.push(Ok(page(vec![
        mention("1301", "alice", "@Quasartip tip 0.1 to @bob"),
        mention("1302", "alice", "@Quasartip tip 0.2 to @bob"),
        mention("1303", "alice", "@Quasartip tip 0.3 to @bob"),
    ])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.fresh, 3);
    assert_eq!(report.batches, 1);
    assert_eq!(report.processed, 2);

    let submissions = h.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].amount, amount("0.4"));
    let received = h.store.history(&handle("bob")).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].amount, amount("0.4").to_base_string());
    assert!(h.channel.posts()[0].0.contains("2 tips totaling 0.4 BNB"));
}

#[tokio::test]
async fn regression_batch_taken_entirely_by_overlapping_cycle_moves_nothing() {
    let (h, hooks) = hooked();
    h.funded("alice", "1").await;
    hooks.race_mark("1401", &["1401"]);
    h.source.push(Ok(page(vec![mention("1401", "alice", "@Quasartip tip 0.1 to @bob")])));

    let report = h.pipeline.run_poll_cycle(None).await.unwrap();
    assert_eq!(report.batches, 0);
    assert_eq!(report.processed, 0);
    assert!(h.chain.submissions().is_empty());
    assert!(h.store.pending_claims(&handle("bob")).await.unwrap().is_empty());
    assert!(h.channel.posts().is_empty());
}

#[tokio::test]
async fn regression_recipient_inserted_concurrently_keeps_the_winning_wallet() {
    let (h, hooks) = hooked();
    h.funded("alice", "1").await;
    let racer = AesCustody::new("pipeline-test-key").unwrap().provision().unwrap();
    let racer_address = racer.address;
    hooks.race_insert(racer);
    h.source.push(Ok(page(vec![mention("1501", "alice", "@Quasartip tip 0.1 to @bob")])));

    h.pipeline.run_poll_cycle(None).await.unwrap();
    let submissions = h.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].to, racer_address);

    let row = h.store.find_account(&handle("bob")).await.unwrap().unwrap();
    assert_eq!(Account::try_from(row).unwrap().address(), racer_address);
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

fn reply(event_id: &str) -> Reply {
    Reply {
        event_id: event_id.into(),
        text: "@bob pay from @alice A 1 BNB tip has been recorded for you!".into(),
        settlement_ref: None,
    }
}

#[tokio::test]
async fn unit_fallback_channel_delivers_after_primary_refuses() {
    let backup = Arc::new(ScriptedChannel::new("backup"));
    let second: Arc<dyn ReplyChannel> = backup.clone();
    let h = Harness::with_channels(|primary| vec![primary, second]);
    h.channel.then(Delivery::Fatal {
        error: "403".into(),
    });

    let outcome = h.dispatcher.dispatch(&reply("30")).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Sent {
            channel: "backup".into(),
            reply_id: "reply-1".into(),
        }
    );
    assert_eq!(backup.posts().len(), 1);
    assert!(h.operator.notes().is_empty());
}

#[tokio::test]
async fn unit_every_channel_fatal_parks_reply_as_failed() {
    let h = Harness::new();
    h.channel.then(Delivery::Fatal {
        error: "duplicate content".into(),
    });

    let outcome = h.dispatcher.dispatch(&reply("31")).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    let queued = h.store.queued_reply("31").await.unwrap().unwrap();
    assert_eq!(queued.status(), Some(ReplyStatus::Failed));
    assert_eq!(h.operator.notes().len(), 1);

    h.clock.advance(Duration::hours(1));
    assert_eq!(h.dispatcher.sweep().await.unwrap().attempted, 0);
}

#[tokio::test]
async fn unit_no_channels_is_fatal() {
    let h = Harness::with_channels(|_| Vec::new());
    let outcome = h.dispatcher.dispatch(&reply("32")).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
}

#[tokio::test]
async fn unit_retry_without_hint_uses_fallback_delay() {
    let h = Harness::new();
    h.channel.then(Delivery::Retryable {
        error: "502".into(),
        resume_at: None,
    });

    let outcome = h.dispatcher.dispatch(&reply("33")).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Queued {
            next_retry_at: t0() + DispatchPolicy::default().fallback_delay,
        }
    );
}

#[tokio::test]
async fn unit_sweep_keeps_retrying_until_delivered() {
    let h = Harness::new();
    for _ in 0..3 {
        h.channel.then(Delivery::Retryable {
            error: "503".into(),
            resume_at: None,
        });
    }
    h.dispatcher.dispatch(&reply("34")).await.unwrap();

    let mut attempts = Vec::new();
    for _ in 0..3 {
        h.clock.advance(Duration::minutes(16));
        h.dispatcher.sweep().await.unwrap();
        let row = h.store.queued_reply("34").await.unwrap().unwrap();
        attempts.push(row.attempts);
    }
    assert_eq!(attempts, [2, 3, 4]);
    let row = h.store.queued_reply("34").await.unwrap().unwrap();
    assert_eq!(row.status(), Some(ReplyStatus::Completed));
}

#[tokio::test]
async fn unit_sweep_marks_fatal_retry_as_failed() {
    let h = Harness::new();
    h.channel.then(Delivery::Retryable {
        error: "429".into(),
        resume_at: None,
    });
    h.channel.then(Delivery::Fatal {
        error: "tweet deleted".into(),
    });
    h.dispatcher.dispatch(&reply("35")).await.unwrap();

    h.clock.advance(Duration::minutes(20));
    let report = h.dispatcher.sweep().await.unwrap();
    assert_eq!((report.attempted, report.succeeded, report.failed), (1, 0, 1));
    let row = h.store.queued_reply("35").await.unwrap().unwrap();
    assert_eq!(row.status(), Some(ReplyStatus::Failed));
    assert_eq!(row.last_error.as_deref(), Some("x: tweet deleted"));
}

#[tokio::test]
async fn unit_best_effort_post_never_queues() {
    let h = Harness::new();
    h.channel.then(Delivery::Retryable {
        error: "429".into(),
        resume_at: None,
    });
    assert!(!h.dispatcher.post_best_effort("hello", "36").await);
    assert!(h.store.queued_reply("36").await.unwrap().is_none());
    assert!(h.dispatcher.post_best_effort("hello", "36").await);
    assert_eq!(h.clock.now(), t0());
}

// ─── Wallet ─────────────────────────────────────────────────────────────────

fn external() -> Address {
    "0x00000000000000000000000000000000000000aa".parse().unwrap()
}

#[tokio::test]
async fn functional_withdraw_sends_to_external_address_and_records_history() {
    let h = Harness::new();
    let alice = h.funded("alice", "1").await;

    let withdrawal = h
        .wallets
        .withdraw(&handle("alice"), external(), amount("0.4"), Token::Bnb)
        .await
        .unwrap();
    assert_eq!(withdrawal.reference, "0xsettle1");
    assert!(withdrawal.confirmed);
    assert!(withdrawal.recorded);
    assert_eq!(withdrawal.from, alice.address());

    let submissions = h.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].from, alice.address());
    assert_eq!(submissions[0].to, external());
    assert_eq!(submissions[0].amount, amount("0.4"));

    let history = h.store.history(&handle("alice")).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, "transfer");
    assert_eq!(history[0].counterparty, format!("{:#x}", external()));
    assert_eq!(history[0].entry_key, "withdraw:0xsettle1");
}

#[tokio::test]
async fn functional_withdraw_refusals_never_reach_the_chain() {
    let h = Harness::new();
    h.funded("alice", "1").await;
    // dave cannot send, which leaves erin provisioned but not activated.
    h.source.push(Ok(page(vec![mention("1601", "dave", "@Quasartip tip 1 to @erin")])));
    h.pipeline.run_poll_cycle(None).await.unwrap();

    let zero = Amount::from_base_units(U256::ZERO);
    assert!(matches!(
        h.wallets.withdraw(&handle("alice"), external(), zero, Token::Bnb).await,
        Err(WalletError::InvalidAmount)
    ));
    assert!(matches!(
        h.wallets.withdraw(&handle("alice"), external(), amount("2"), Token::Bnb).await,
        Err(WalletError::Transfer(TransferError::InsufficientBalance { .. }))
    ));
    assert!(matches!(
        h.wallets.withdraw(&handle("erin"), external(), amount("0.1"), Token::Bnb).await,
        Err(WalletError::NotActivated(_))
    ));
    assert!(matches!(
        h.wallets.withdraw(&handle("nobody"), external(), amount("0.1"), Token::Bnb).await,
        Err(WalletError::NotFound(_))
    ));
    assert!(h.chain.submissions().is_empty());
}

#[tokio::test]
async fn functional_balance_reads_both_assets() {
    let h = Harness::new();
    let alice = h.activated("alice").await;
    h.chain.set_balance(alice.address(), Token::Bnb, amount("1.5").base_units());
    h.chain.set_balance(alice.address(), Token::Usdc, amount("20").base_units());

    let balance = h.wallets.balance(&handle("alice")).await.unwrap();
    assert_eq!(balance.address, alice.address());
    assert_eq!(balance.bnb, amount("1.5"));
    assert_eq!(balance.usdc, amount("20"));
    assert!(matches!(
        h.wallets.balance(&handle("nobody")).await,
        Err(WalletError::NotFound(_))
    ));
}
