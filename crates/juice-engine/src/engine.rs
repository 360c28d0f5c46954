use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use juice_chain::{ChainPayload, PersonalChain};
use juice_core::config::EngineConfig;
use juice_core::error::JuiceError;
use juice_core::token::{Token, TokenStatus, WisselToken};
use juice_core::types::{Amount, OwnerId, TokenId, TransactionId};
use juice_crypto::KeyPair;
use juice_denom::{select_tokens_with_tail, DenominationVectorClock, Holdings};
use juice_store::{AttestationStore, HardwareSecurity, Kv, TokenStore};
use juice_store::token_store::SeedRecord;
use juice_time::{TimeAuthority, TimeStatus};
use juice_transport::MessagePipe;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::pak::Pak;
use crate::resolution;
use crate::state::{TransactionRecord, TxPhase, TxRole};
use crate::wire::{Envelope, MessageBody};

// ── Receipt ──────────────────────────────────────────────────────────────────

/// What the caller gets back from a resolved transaction, serializable
/// for user inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_id: TransactionId,
    pub role: TxRole,
    pub amount: Amount,
    pub sent: Vec<TokenId>,
    pub received: Vec<TokenId>,
    pub chain_head: [u8; 32],
    pub committed: bool,
}

impl TransactionReceipt {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("receipt serialization is infallible")
    }
}

// ── Lock table ───────────────────────────────────────────────────────────────

/// Per-token logical locks. Acquisition is always in sorted id order and
/// the protected sections are synchronous, so there is no lock-ordering
/// deadlock and no suspension while holding.
#[derive(Default)]
struct LockTable {
    inner: StdMutex<HashMap<TokenId, Arc<StdMutex<()>>>>,
}

impl LockTable {
    fn with_locked<R>(&self, ids: &[TokenId], f: impl FnOnce() -> R) -> R {
        let mut sorted: Vec<TokenId> = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let arcs: Vec<Arc<StdMutex<()>>> = {
            let mut table = self.inner.lock().expect("lock table");
            sorted
                .iter()
                .map(|id| Arc::clone(table.entry(*id).or_default()))
                .collect()
        };
        let _guards: Vec<_> = arcs.iter().map(|a| a.lock().expect("token lock")).collect();
        f()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// One participant's transaction engine: drives either end of the
/// Four-Packet protocol over an abstract message pipe, owns the user's
/// Personal Chain, and journals every state-mutating step for idempotent
/// crash recovery.
pub struct TransactionEngine {
    config: EngineConfig,
    keypair: Arc<KeyPair>,
    store: TokenStore,
    time: Arc<TimeAuthority>,
    dht: Arc<dyn AttestationStore>,
    tee: Arc<dyn HardwareSecurity>,
    chain: StdMutex<PersonalChain>,
    token_locks: LockTable,
    tx_locks: StdMutex<HashMap<TransactionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TransactionEngine {
    pub fn new(
        config: EngineConfig,
        keypair: Arc<KeyPair>,
        kv: Arc<dyn Kv>,
        time: Arc<TimeAuthority>,
        dht: Arc<dyn AttestationStore>,
        tee: Arc<dyn HardwareSecurity>,
    ) -> Result<Self, JuiceError> {
        let store = TokenStore::new(kv);
        let chain = store
            .get_chain(&keypair.owner_id)?
            .unwrap_or_else(|| PersonalChain::new(keypair.owner_id));
        Ok(Self {
            config,
            keypair,
            store,
            time,
            dht,
            tee,
            chain: StdMutex::new(chain),
            token_locks: LockTable::default(),
            tx_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn owner(&self) -> OwnerId {
        self.keypair.owner_id
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn dht(&self) -> &Arc<dyn AttestationStore> {
        &self.dht
    }

    pub(crate) fn time(&self) -> &Arc<TimeAuthority> {
        &self.time
    }

    pub(crate) fn keypair(&self) -> &Arc<KeyPair> {
        &self.keypair
    }

    pub fn chain_head(&self) -> [u8; 32] {
        self.chain.lock().expect("chain lock").head()
    }

    pub fn chain_len(&self) -> usize {
        self.chain.lock().expect("chain lock").len()
    }

    /// Take a token (with its Telomeer) into this engine's custody.
    /// Issuance and hatching feed new tokens in through here.
    pub fn install(&self, token: Token, telomeer: juice_core::telomeer::Telomeer) -> Result<(), JuiceError> {
        self.store.put_token(&token)?;
        self.store.put_telomeer(&telomeer)
    }

    pub fn install_wissel(&self, wissel: WisselToken) -> Result<(), JuiceError> {
        let telomeer =
            juice_core::telomeer::Telomeer::genesis(wissel.token.token_id, self.owner());
        self.store.put_token(&wissel.token)?;
        self.store.put_telomeer(&telomeer)?;
        self.store.put_wissel(&self.owner(), &wissel)
    }

    /// Spendable balance in whole units.
    pub fn balance(&self) -> Result<u64, JuiceError> {
        let now = self.time.now_ms();
        Ok(self
            .store
            .tokens_owned_by(&self.owner())?
            .iter()
            .filter(|t| t.spendable(now))
            .map(|t| t.value())
            .sum())
    }

    fn tx_lock(&self, id: TransactionId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.tx_locks
                .lock()
                .expect("tx lock table")
                .entry(id)
                .or_default(),
        )
    }

    // ── Reservation ──────────────────────────────────────────────────────────

    fn reserve(&self, ids: &[TokenId]) -> Result<(), JuiceError> {
        self.token_locks.with_locked(ids, || {
            for id in ids {
                let mut token = self.store.require_token(id)?;
                token.transition(TokenStatus::Reserved)?;
                self.store.put_token(&token)?;
            }
            Ok(())
        })
    }

    fn release(&self, ids: &[TokenId]) -> Result<(), JuiceError> {
        self.token_locks.with_locked(ids, || {
            for id in ids {
                let mut token = self.store.require_token(id)?;
                if token.status == TokenStatus::Reserved {
                    token.transition(TokenStatus::Active)?;
                    self.store.put_token(&token)?;
                }
            }
            Ok(())
        })
    }

    // ── Journal ──────────────────────────────────────────────────────────────

    pub(crate) fn journal(&self, record: &TransactionRecord) -> Result<(), JuiceError> {
        let seq = self.store.journal_entries(&record.transaction_id)?.len() as u32;
        self.store
            .append_journal(&record.transaction_id, seq, &record.to_bytes())
    }

    // ── Wire helpers ─────────────────────────────────────────────────────────

    async fn send_body(
        &self,
        pipe: &dyn MessagePipe,
        transaction_id: TransactionId,
        receiver: OwnerId,
        body: MessageBody,
    ) -> Result<(), JuiceError> {
        let bytes = Envelope::seal(
            transaction_id,
            receiver,
            self.time.now_ms(),
            body,
            self.keypair.as_ref(),
        );
        pipe.send(bytes).await
    }

    async fn recv_step(
        &self,
        pipe: &dyn MessagePipe,
        transaction_id: Option<TransactionId>,
        cancel: &CancelToken,
    ) -> Result<Envelope, JuiceError> {
        let fallback = transaction_id.unwrap_or(TransactionId::from_bytes([0u8; 16]));
        tokio::select! {
            message = pipe.recv() => {
                let envelope = Envelope::open(&message?)?;
                if let Some(expected) = transaction_id {
                    if envelope.transaction_id != expected {
                        return Err(JuiceError::UnknownTransaction(envelope.transaction_id));
                    }
                }
                if let MessageBody::Abort { reason } = &envelope.body {
                    return Err(JuiceError::TransactionAborted {
                        transaction_id: envelope.transaction_id,
                        reason: format!("peer aborted: {reason}"),
                    });
                }
                Ok(envelope)
            }
            _ = tokio::time::sleep(Duration::from_millis(self.config.tx_timeout_ms)) => {
                Err(JuiceError::TransactionTimeout(fallback))
            }
            _ = cancel.cancelled() => {
                Err(JuiceError::TransactionAborted {
                    transaction_id: fallback,
                    reason: "cancelled by caller".into(),
                })
            }
        }
    }

    fn commit_gate(&self, transaction_id: TransactionId) -> Result<(), JuiceError> {
        let integrity = self.time.integrity();
        if integrity.status == TimeStatus::Compromised
            || integrity.confidence < self.config.min_tx_confidence
        {
            warn!(tx = %transaction_id, status = %integrity.status, confidence = integrity.confidence,
                "refusing to commit under degraded time integrity");
            return Err(JuiceError::TimeIntegrityInsufficient {
                confidence: integrity.confidence,
                status: integrity.status.to_string(),
            });
        }
        Ok(())
    }

    // ── Sender side ──────────────────────────────────────────────────────────

    /// Drive the sender end: wait for the receiver's seed, select tokens,
    /// exchange the four paks, and commit. Disconnection after the point
    /// of no return enters resolution instead of failing.
    pub async fn pay(
        &self,
        pipe: &dyn MessagePipe,
        amount: Amount,
        context: &str,
        cancel: &CancelToken,
    ) -> Result<TransactionReceipt, JuiceError> {
        // Step 1: the receiver contributes the seed.
        let envelope = self.recv_step(pipe, None, cancel).await?;
        let MessageBody::Seed { seed, vector_clock } = envelope.body else {
            return Err(JuiceError::WireFormat("expected transaction seed".into()));
        };
        let transaction_id = envelope.transaction_id;
        let receiver = envelope.sender;
        if receiver == self.owner() {
            return Err(JuiceError::SameOwnerTransfer);
        }
        let receiver_clock = DenominationVectorClock::unpack(vector_clock);

        let tx_lock = self.tx_lock(transaction_id);
        let _tx_guard = tx_lock.lock().await;

        let now = self.time.now_ms();
        let wissel = self.store.get_wissel(&self.owner())?;
        let cents = amount.cents as u64;
        if cents > 0 && wissel.is_none() {
            return Err(JuiceError::InsufficientBalance {
                need: amount.units + 1,
                have: amount.units,
            });
        }
        let borrow: u64 = match &wissel {
            Some(w) if cents > (w.buffer_cents() as u64) => 1,
            _ => 0,
        };

        let holdings = self.store.tokens_owned_by(&self.owner())?;
        let view = Holdings {
            tokens: &holdings,
            wissel_id: wissel.as_ref().map(|w| w.token.token_id),
            now,
        };
        let selection = select_tokens_with_tail(
            &view,
            amount.units + borrow,
            Some(&receiver_clock),
            &self.config.ideal_counts,
            self.config.issuance_min,
        )?;

        self.reserve(&selection.token_ids)?;
        let mut record = TransactionRecord {
            transaction_id,
            role: TxRole::Sender,
            phase: TxPhase::Initiated,
            seed,
            counterparty: receiver,
            amount,
            reserved: selection.token_ids.clone(),
            their_exo: None,
            retro: None,
            wissel_spent: selection.includes_wissel,
            counterparty_head: [0u8; 32],
            deadline_ms: now + self.config.tx_timeout_ms,
            updated_ms: now,
        };
        self.journal(&record)?;
        info!(tx = %transaction_id, amount = %amount, "transaction initiated (sender)");

        let selection_includes_wissel = selection.includes_wissel;
        let result = self
            .pay_inner(pipe, cancel, &mut record, context, &selection.token_ids, borrow, selection_includes_wissel, &wissel)
            .await;

        match result {
            Ok(receipt) => Ok(receipt),
            Err(err) if record.phase == TxPhase::Committing => {
                // Past the point of no return: only resolution concludes.
                warn!(tx = %transaction_id, error = %err, "sender inconclusive; entering resolution");
                resolution::resolve_inconclusive(self, &mut record, selection_includes_wissel).await
            }
            Err(err) => {
                self.abort_local(Some(pipe), &mut record, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pay_inner(
        &self,
        pipe: &dyn MessagePipe,
        cancel: &CancelToken,
        record: &mut TransactionRecord,
        context: &str,
        exo_ids: &[TokenId],
        borrow: u64,
        includes_wissel: bool,
        wissel: &Option<WisselToken>,
    ) -> Result<TransactionReceipt, JuiceError> {
        let transaction_id = record.transaction_id;
        let receiver = record.counterparty;
        let amount = record.amount;

        // Step 2: initiation with the sExoPak.
        let mut tokens = Vec::with_capacity(exo_ids.len());
        let mut telomeers = Vec::with_capacity(exo_ids.len());
        for id in exo_ids {
            tokens.push(self.store.require_token(id)?);
            telomeers.push(self.store.require_telomeer(id)?);
        }
        let buffer_cents = amount.cents as u16
            + if includes_wissel {
                wissel.as_ref().map(|w| w.buffer_cents() as u16).unwrap_or(0)
            } else {
                0
            };
        let s_exo = Pak::s_exo(
            transaction_id,
            record.seed,
            tokens,
            telomeers,
            buffer_cents,
            self.keypair.as_ref(),
        );
        let my_clock = self.vector_clock()?;
        self.send_body(
            pipe,
            transaction_id,
            receiver,
            MessageBody::Initiation {
                context: context.to_string(),
                amount,
                sender_borrow: borrow as u8,
                s_exo: s_exo.clone(),
                vector_clock: my_clock.pack(),
                chain_head: self.chain_head(),
            },
        )
        .await?;
        record.phase = TxPhase::Preparing;
        record.updated_ms = self.time.now_ms();
        self.journal(record)?;

        // Step 3: receiver's preparation.
        let envelope = self.recv_step(pipe, Some(transaction_id), cancel).await?;
        let MessageBody::Preparation { r_exo, r_retro_id } = envelope.body else {
            return Err(JuiceError::WireFormat("expected preparation".into()));
        };
        let now = self.time.now_ms();
        r_exo.validate(&transaction_id, &record.seed, &receiver, now)?;
        let base_change = s_exo.total_units() - amount.units - borrow;
        let change = r_exo.total_units();
        // The receiver may materialize buffer-carry units into the change
        // (at most two: incoming cents never exceed 1.98).
        if change < base_change || change > base_change + 2 {
            return Err(JuiceError::TransactionAborted {
                transaction_id,
                reason: format!("change {change} does not cover overshoot {base_change}"),
            });
        }
        if r_retro_id == [0u8; 32] {
            return Err(JuiceError::TransactionAborted {
                transaction_id,
                reason: "missing receiver retro pak".into(),
            });
        }
        record.their_exo = Some(r_exo);
        record.phase = TxPhase::Prepared;
        record.updated_ms = now;
        self.journal(record)?;

        // Step 4: commitment, the point of no return.
        self.commit_gate(transaction_id)?;

        let retro_ids: Vec<TokenId> = self
            .store
            .tokens_owned_by(&self.owner())?
            .iter()
            .filter(|t| t.status == TokenStatus::Active && !exo_ids.contains(&t.token_id))
            .map(|t| t.token_id)
            .collect();
        self.reserve(&retro_ids)?;
        record.reserved.extend(retro_ids.iter().copied());
        let mut retro_tokens = Vec::with_capacity(retro_ids.len());
        let mut retro_telomeers = Vec::with_capacity(retro_ids.len());
        for id in &retro_ids {
            retro_tokens.push(self.store.require_token(id)?);
            retro_telomeers.push(self.store.require_telomeer(id)?);
        }
        let s_retro = Pak::s_retro(
            transaction_id,
            record.seed,
            retro_tokens,
            retro_telomeers,
            self.keypair.as_ref(),
        );
        record.retro = Some(s_retro.clone());
        record.phase = TxPhase::Committing;
        record.updated_ms = self.time.now_ms();
        self.journal(record)?;

        let commitment = MessageBody::Commitment { s_retro };
        let mut attempt = 0u32;
        loop {
            match self
                .send_body(pipe, transaction_id, receiver, commitment.clone())
                .await
            {
                Ok(()) => break,
                Err(err) if attempt < self.config.max_retries => {
                    warn!(tx = %transaction_id, attempt, error = %err, "commitment delivery failed; retrying");
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms(attempt)))
                        .await;
                    attempt += 1;
                }
                Err(_) => return Err(JuiceError::Inconclusive(transaction_id)),
            }
        }

        // Step 5: finalization.
        let envelope = match self.recv_step(pipe, Some(transaction_id), cancel).await {
            Ok(envelope) => envelope,
            Err(JuiceError::TransactionAborted { transaction_id, reason }) => {
                // A post-commitment abort from the receiver is still a
                // clean outcome for us only via resolution.
                warn!(tx = %transaction_id, %reason, "peer aborted after commitment");
                return Err(JuiceError::Inconclusive(transaction_id));
            }
            Err(_) => return Err(JuiceError::Inconclusive(transaction_id)),
        };
        let MessageBody::Finalization { chain_head } = envelope.body else {
            return Err(JuiceError::Inconclusive(transaction_id));
        };
        record.counterparty_head = chain_head;

        let receipt = self.commit_sender(record, includes_wissel)?;
        resolution::publish_commitment(self, record, &receipt).await;
        self.store.clear_journal(&transaction_id)?;
        Ok(receipt)
    }

    /// Apply the sender-side effects of a finalized transaction: exo
    /// tokens leave, change arrives, retro reservations release, buffers
    /// settle, and the chain records the transfer.
    pub(crate) fn commit_sender(
        &self,
        record: &TransactionRecord,
        includes_wissel: bool,
    ) -> Result<TransactionReceipt, JuiceError> {
        let transaction_id = record.transaction_id;
        let receiver = record.counterparty;
        let r_exo = record
            .their_exo
            .clone()
            .ok_or(JuiceError::UnknownTransaction(transaction_id))?;
        let retro_ids: Vec<TokenId> = record
            .retro
            .as_ref()
            .map(|p| p.token_ids())
            .unwrap_or_default();
        let exo_ids: Vec<TokenId> = record
            .reserved
            .iter()
            .copied()
            .filter(|id| !retro_ids.contains(id))
            .collect();

        let mut all_ids = record.reserved.clone();
        all_ids.extend(r_exo.token_ids());

        let received = self.token_locks.with_locked(&all_ids, || {
            // Outgoing tokens: consumed here, owned by the receiver now.
            // Replay after a crash must leave state identical, so already
            // applied steps are skipped.
            for id in &exo_ids {
                let mut token = self.store.require_token(id)?;
                if token.status != TokenStatus::Consumed {
                    token.transition(TokenStatus::Consumed)?;
                    self.store.put_token(&token)?;
                }
                let mut telomeer = self.store.require_telomeer(id)?;
                if telomeer.current_owner != receiver {
                    telomeer.transfer_with_bound(receiver, transaction_id, self.config.max_history)?;
                    self.store.put_telomeer(&telomeer)?;
                }
            }
            // Incoming change: adopt tokens and transferred telomeers.
            let mut received = Vec::new();
            let body = r_exo.body();
            for (token, telomeer) in body.tokens.iter().zip(&body.telomeers) {
                let mut token = token.clone();
                token.status = TokenStatus::Active;
                let mut telomeer = telomeer.clone();
                if telomeer.current_owner != self.owner() {
                    telomeer.transfer_with_bound(self.owner(), transaction_id, self.config.max_history)?;
                }
                self.store.put_token(&token)?;
                self.store.put_telomeer(&telomeer)?;
                received.push(token.token_id);
            }
            // Retro pledges release.
            for id in &retro_ids {
                let mut token = self.store.require_token(id)?;
                if token.status == TokenStatus::Reserved {
                    token.transition(TokenStatus::Active)?;
                    self.store.put_token(&token)?;
                }
            }
            Ok::<Vec<TokenId>, JuiceError>(received)
        })?;

        // Buffer settlement: debit the fractional part; a spent Wissel
        // leaves with its whole buffer. Change may carry the receiver's
        // own Wissel buffer in, which we absorb.
        if includes_wissel {
            self.store.delete_wissel(&self.owner())?;
        } else if record.amount.cents > 0 {
            if let Some(mut wissel) = self.store.get_wissel(&self.owner())? {
                wissel.debit(record.amount.cents as u64);
                self.store.put_wissel(&self.owner(), &wissel)?;
            }
        }
        let change_cents = r_exo.body().buffer_cents as u64;
        if change_cents > 0 {
            match self.store.get_wissel(&self.owner())? {
                Some(mut wissel) => {
                    let emitted = wissel.credit(change_cents);
                    if emitted > 0 {
                        warn!(tx = %transaction_id, emitted,
                            "buffer overflow absorbing change cents");
                    }
                    self.store.put_wissel(&self.owner(), &wissel)?;
                }
                None => {
                    warn!(tx = %transaction_id, change_cents,
                        "no WisselToken to absorb change cents");
                }
            }
        }

        let chain_head = self.append_commit_entry(
            transaction_id,
            receiver,
            record.counterparty_head,
            record.amount,
            exo_ids.clone(),
            received.clone(),
        )?;

        info!(tx = %transaction_id, sent = exo_ids.len(), received = received.len(),
            "transaction committed (sender)");
        Ok(TransactionReceipt {
            transaction_id,
            role: TxRole::Sender,
            amount: record.amount,
            sent: exo_ids,
            received,
            chain_head,
            committed: true,
        })
    }

    // ── Receiver side ────────────────────────────────────────────────────────

    /// Drive the receiver end: contribute the seed, validate the sender's
    /// pak, return change, and finalize. `expected` guards against an
    /// initiation for a different amount.
    pub async fn receive(
        &self,
        pipe: &dyn MessagePipe,
        expected: Option<Amount>,
        cancel: &CancelToken,
    ) -> Result<TransactionReceipt, JuiceError> {
        let transaction_id = TransactionId::generate();
        let seed = juice_crypto::random32();
        let now = self.time.now_ms();
        self.store.prune_seeds(now)?;
        self.store.put_seed(&SeedRecord {
            transaction_id,
            seed,
            issued_ms: now,
            resolved: false,
            window_closes_ms: now + self.config.seed_window_ms(),
        })?;

        let tx_lock = self.tx_lock(transaction_id);
        let _tx_guard = tx_lock.lock().await;

        let my_clock = self.vector_clock()?;
        // The counterparty is unknown until their first message; the seed
        // envelope carries a zero receiver fingerprint.
        self.send_body(
            pipe,
            transaction_id,
            OwnerId::from_bytes([0u8; 32]),
            MessageBody::Seed {
                seed,
                vector_clock: my_clock.pack(),
            },
        )
        .await?;

        // Step 2: the sender's initiation.
        let envelope = match self.recv_step(pipe, Some(transaction_id), cancel).await {
            Ok(envelope) => envelope,
            Err(err) => {
                // The seed was never answered; close its replay window.
                if let Some(mut seed_record) = self.store.get_seed(&transaction_id)? {
                    seed_record.resolved = true;
                    self.store.put_seed(&seed_record)?;
                }
                return Err(err);
            }
        };
        let sender = envelope.sender;
        let MessageBody::Initiation {
            context: _,
            amount,
            sender_borrow,
            s_exo,
            vector_clock,
            chain_head: sender_head,
        } = envelope.body
        else {
            return Err(JuiceError::WireFormat("expected initiation".into()));
        };

        let seed_record = self
            .store
            .get_seed(&transaction_id)?
            .ok_or(JuiceError::UnknownTransaction(transaction_id))?;
        if seed_record.resolved {
            return Err(JuiceError::DuplicateSeed);
        }
        let offered_seed = s_exo.body().transaction_seed;
        if offered_seed != seed || self.store.seed_already_used(&offered_seed)? {
            self.send_abort(pipe, transaction_id, sender, "seed replay refused").await;
            return Err(JuiceError::DuplicateSeed);
        }

        let mut record = TransactionRecord {
            transaction_id,
            role: TxRole::Receiver,
            phase: TxPhase::Initiated,
            seed,
            counterparty: sender,
            amount,
            reserved: Vec::new(),
            their_exo: None,
            retro: None,
            wissel_spent: false,
            counterparty_head: sender_head,
            deadline_ms: self.time.now_ms() + self.config.tx_timeout_ms,
            updated_ms: self.time.now_ms(),
        };

        if let Some(expected) = expected {
            if expected != amount {
                let err = JuiceError::TransactionAborted {
                    transaction_id,
                    reason: format!("amount {amount} differs from agreed {expected}"),
                };
                self.abort_local(Some(pipe), &mut record, &err.to_string()).await?;
                return Err(err);
            }
        }

        let result = self
            .receive_inner(pipe, cancel, &mut record, s_exo, sender_borrow as u64, vector_clock)
            .await;
        match result {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                self.abort_local(Some(pipe), &mut record, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn receive_inner(
        &self,
        pipe: &dyn MessagePipe,
        cancel: &CancelToken,
        record: &mut TransactionRecord,
        s_exo: Pak,
        sender_borrow: u64,
        sender_clock: u32,
    ) -> Result<TransactionReceipt, JuiceError> {
        let transaction_id = record.transaction_id;
        let sender = record.counterparty;
        let amount = record.amount;
        let now = self.time.now_ms();

        s_exo.validate(&transaction_id, &record.seed, &sender, now)?;
        let covered = amount.units + sender_borrow;
        if s_exo.total_units() < covered {
            return Err(JuiceError::InsufficientBalance {
                need: covered,
                have: s_exo.total_units(),
            });
        }

        // Step 3: change selection driven by the sender's clock, plus the
        // whole units our buffer would overflow into. The pak's cents
        // include the sender's Wissel buffer when that token travels.
        let wissel = self.store.get_wissel(&self.owner())?;
        let incoming_cents = s_exo.body().buffer_cents as u64;
        let carry: u64 = match &wissel {
            Some(w) if incoming_cents > 0 => (w.buffer_cents() as u64 + incoming_cents) / 100,
            _ => 0,
        };
        let change_target = s_exo.total_units() - covered + carry;

        let sender_clock = DenominationVectorClock::unpack(sender_clock);
        let holdings = self.store.tokens_owned_by(&self.owner())?;
        let view = Holdings {
            tokens: &holdings,
            wissel_id: wissel.as_ref().map(|w| w.token.token_id),
            now,
        };
        let change_selection = if change_target > 0 {
            select_tokens_with_tail(
                &view,
                change_target,
                Some(&sender_clock),
                &self.config.ideal_counts,
                self.config.issuance_min,
            )?
        } else {
            juice_denom::Selection {
                token_ids: Vec::new(),
                total: 0,
                overshoot: 0,
                includes_wissel: false,
            }
        };

        self.reserve(&change_selection.token_ids)?;
        record.reserved = change_selection.token_ids.clone();
        record.phase = TxPhase::Preparing;
        record.updated_ms = now;
        self.journal(record)?;

        let mut change_tokens = Vec::new();
        let mut change_telomeers = Vec::new();
        for id in &change_selection.token_ids {
            change_tokens.push(self.store.require_token(id)?);
            change_telomeers.push(self.store.require_telomeer(id)?);
        }
        let change_buffer_cents = if change_selection.includes_wissel {
            wissel.as_ref().map(|w| w.buffer_cents() as u16).unwrap_or(0)
        } else {
            0
        };
        let r_exo = Pak::r_exo(
            transaction_id,
            record.seed,
            change_tokens,
            change_telomeers,
            change_buffer_cents,
            self.keypair.as_ref(),
        );

        let retro_ids: Vec<TokenId> = holdings
            .iter()
            .filter(|t| {
                t.status == TokenStatus::Active
                    && !change_selection.token_ids.contains(&t.token_id)
            })
            .map(|t| t.token_id)
            .collect();
        self.reserve(&retro_ids)?;
        record.reserved.extend(retro_ids.iter().copied());
        let mut retro_tokens = Vec::new();
        let mut retro_telomeers = Vec::new();
        for id in &retro_ids {
            retro_tokens.push(self.store.require_token(id)?);
            retro_telomeers.push(self.store.require_telomeer(id)?);
        }
        let r_retro = Pak::r_retro(
            transaction_id,
            record.seed,
            retro_tokens,
            retro_telomeers,
            self.keypair.as_ref(),
        );
        record.retro = Some(r_retro.clone());
        record.their_exo = Some(s_exo.clone());
        record.phase = TxPhase::Prepared;
        record.updated_ms = self.time.now_ms();
        self.journal(record)?;

        self.send_body(
            pipe,
            transaction_id,
            sender,
            MessageBody::Preparation {
                r_exo: r_exo.clone(),
                r_retro_id: r_retro.digest(),
            },
        )
        .await?;

        // Step 4: the sender's commitment.
        let envelope = self.recv_step(pipe, Some(transaction_id), cancel).await?;
        let MessageBody::Commitment { s_retro } = envelope.body else {
            return Err(JuiceError::WireFormat("expected commitment".into()));
        };
        s_retro.validate(&transaction_id, &record.seed, &sender, self.time.now_ms())?;
        let exo_ids = s_exo.token_ids();
        if s_retro.token_ids().iter().any(|id| exo_ids.contains(id)) {
            return Err(JuiceError::TransactionAborted {
                transaction_id,
                reason: "sender retro pak overlaps the exo pak".into(),
            });
        }

        self.commit_gate(transaction_id)?;

        // Step 5: commit locally, publish the finalization attestation,
        // then best-effort deliver it. A lost finalization is recovered by
        // the sender through resolution.
        let receipt = self.commit_receiver(record, &s_exo, &r_exo, carry, change_selection.includes_wissel)?;
        resolution::publish_finalization(self, record, &receipt).await;

        let finalization = MessageBody::Finalization {
            chain_head: receipt.chain_head,
        };
        if let Err(err) = self
            .send_body(pipe, transaction_id, sender, finalization)
            .await
        {
            warn!(tx = %transaction_id, error = %err,
                "finalization delivery failed; sender will resolve via the attestation store");
        }
        self.store.clear_journal(&transaction_id)?;
        Ok(receipt)
    }

    /// Apply the receiver-side effects: the sender's tokens arrive, the
    /// change leaves, retro reservations release, the buffer credits, and
    /// the seed window marks resolved.
    fn commit_receiver(
        &self,
        record: &TransactionRecord,
        s_exo: &Pak,
        r_exo: &Pak,
        carry: u64,
        change_includes_wissel: bool,
    ) -> Result<TransactionReceipt, JuiceError> {
        let transaction_id = record.transaction_id;
        let sender = record.counterparty;
        let change_ids = r_exo.token_ids();
        let retro_ids: Vec<TokenId> = record
            .retro
            .as_ref()
            .map(|p| p.token_ids())
            .unwrap_or_default();

        let mut all_ids = record.reserved.clone();
        all_ids.extend(s_exo.token_ids());

        let received = self.token_locks.with_locked(&all_ids, || {
            let mut received = Vec::new();
            let body = s_exo.body();
            for (token, telomeer) in body.tokens.iter().zip(&body.telomeers) {
                let mut token = token.clone();
                token.status = TokenStatus::Active;
                let mut telomeer = telomeer.clone();
                if telomeer.current_owner != self.owner() {
                    telomeer.transfer_with_bound(self.owner(), transaction_id, self.config.max_history)?;
                }
                self.store.put_token(&token)?;
                self.store.put_telomeer(&telomeer)?;
                received.push(token.token_id);
            }
            for id in &change_ids {
                let mut token = self.store.require_token(id)?;
                if token.status != TokenStatus::Consumed {
                    token.transition(TokenStatus::Consumed)?;
                    self.store.put_token(&token)?;
                }
                let mut telomeer = self.store.require_telomeer(id)?;
                if telomeer.current_owner != sender {
                    telomeer.transfer_with_bound(sender, transaction_id, self.config.max_history)?;
                    self.store.put_telomeer(&telomeer)?;
                }
            }
            for id in &retro_ids {
                let mut token = self.store.require_token(id)?;
                if token.status == TokenStatus::Reserved {
                    token.transition(TokenStatus::Active)?;
                    self.store.put_token(&token)?;
                }
            }
            Ok::<Vec<TokenId>, JuiceError>(received)
        })?;

        // Buffer settlement: credit the incoming cents. The carry units
        // were already materialized into the change.
        let incoming_cents = s_exo.body().buffer_cents as u64;
        if change_includes_wissel {
            self.store.delete_wissel(&self.owner())?;
        } else if incoming_cents > 0 {
            match self.store.get_wissel(&self.owner())? {
                Some(mut wissel) => {
                    let emitted = wissel.credit(incoming_cents);
                    debug_assert_eq!(emitted, carry, "carry preview matches settlement");
                    self.store.put_wissel(&self.owner(), &wissel)?;
                }
                None => {
                    warn!(tx = %transaction_id, incoming_cents,
                        "no WisselToken to absorb incoming cents");
                }
            }
        }

        // Close the seed replay window only at its deadline.
        if let Some(mut seed_record) = self.store.get_seed(&transaction_id)? {
            seed_record.resolved = true;
            seed_record.window_closes_ms =
                self.time.now_ms() + self.config.seed_window_ms();
            self.store.put_seed(&seed_record)?;
        }

        let chain_head = self.append_commit_entry(
            transaction_id,
            sender,
            record.counterparty_head,
            record.amount,
            change_ids.clone(),
            received.clone(),
        )?;

        info!(tx = %transaction_id, received = received.len(), change = change_ids.len(),
            "transaction committed (receiver)");
        Ok(TransactionReceipt {
            transaction_id,
            role: TxRole::Receiver,
            amount: record.amount,
            sent: change_ids,
            received,
            chain_head,
            committed: true,
        })
    }

    // ── Abort ────────────────────────────────────────────────────────────────

    async fn send_abort(
        &self,
        pipe: &dyn MessagePipe,
        transaction_id: TransactionId,
        peer: OwnerId,
        reason: &str,
    ) {
        let body = MessageBody::Abort {
            reason: reason.to_string(),
        };
        if let Err(err) = self.send_body(pipe, transaction_id, peer, body).await {
            warn!(tx = %transaction_id, error = %err, "abort notification undeliverable");
        }
    }

    /// Release every reservation, journal the abort on the chain, tell
    /// the peer (best effort), and clear the transaction journal.
    pub(crate) async fn abort_local(
        &self,
        pipe: Option<&dyn MessagePipe>,
        record: &mut TransactionRecord,
        reason: &str,
    ) -> Result<(), JuiceError> {
        if record.phase.is_terminal() {
            return Ok(());
        }
        self.release(&record.reserved)?;

        if let Some(mut seed_record) = self.store.get_seed(&record.transaction_id)? {
            seed_record.resolved = true;
            seed_record.window_closes_ms = self.time.now_ms() + self.config.seed_window_ms();
            self.store.put_seed(&seed_record)?;
        }

        {
            let mut chain = self.chain.lock().expect("chain lock");
            chain.append(
                ChainPayload::Transaction {
                    transaction_id: record.transaction_id,
                    counterparty: record.counterparty,
                    counterparty_head: [0u8; 32],
                    amount: record.amount,
                    sent: Vec::new(),
                    received: Vec::new(),
                    aborted: true,
                    abort_reason: Some(reason.to_string()),
                },
                self.time.now_ms(),
                self.keypair.as_ref(),
            )?;
            self.store.put_chain(&chain)?;
        }

        if let Some(pipe) = pipe {
            self.send_abort(pipe, record.transaction_id, record.counterparty, reason)
                .await;
        }
        record.phase = TxPhase::Aborted;
        self.store.clear_journal(&record.transaction_id)?;
        info!(tx = %record.transaction_id, reason, "transaction aborted");
        Ok(())
    }

    // ── Recovery ─────────────────────────────────────────────────────────────

    /// Replay the write-ahead journal after a restart. Sender records past
    /// the point of no return enter resolution; everything else rolls
    /// back. Replay is idempotent: restored state matches first
    /// application.
    pub async fn recover(&self) -> Result<Vec<TransactionId>, JuiceError> {
        let mut handled = Vec::new();
        for transaction_id in self.store.journaled_transactions()? {
            let entries = self.store.journal_entries(&transaction_id)?;
            let Some(last) = entries.last() else { continue };
            let mut record = TransactionRecord::from_bytes(last)?;
            info!(tx = %transaction_id, phase = %record.phase, "journal replay");
            if record.role == TxRole::Sender && record.phase == TxPhase::Committing {
                let wissel_spent = record.wissel_spent;
                let _ = resolution::resolve_inconclusive(self, &mut record, wissel_spent).await;
            } else {
                self.abort_local(None, &mut record, "crash recovery rollback").await?;
            }
            handled.push(transaction_id);
        }
        Ok(handled)
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Journal the commit on the chain. Idempotent: replay after a crash
    /// finds the existing entry and leaves the chain untouched.
    fn append_commit_entry(
        &self,
        transaction_id: TransactionId,
        counterparty: OwnerId,
        counterparty_head: [u8; 32],
        amount: Amount,
        sent: Vec<TokenId>,
        received: Vec<TokenId>,
    ) -> Result<[u8; 32], JuiceError> {
        let mut chain = self.chain.lock().expect("chain lock");
        let already = chain.entries().iter().any(|e| {
            matches!(&e.payload,
                ChainPayload::Transaction { transaction_id: id, aborted: false, .. }
                    if *id == transaction_id)
        });
        if !already {
            chain.append(
                ChainPayload::Transaction {
                    transaction_id,
                    counterparty,
                    counterparty_head,
                    amount,
                    sent,
                    received,
                    aborted: false,
                    abort_reason: None,
                },
                self.time.now_ms(),
                self.keypair.as_ref(),
            )?;
            self.store.put_chain(&chain)?;
        }
        Ok(chain.head())
    }

    /// Journal a trust attestation this user issued.
    pub(crate) fn record_attestation_given(
        &self,
        subject: OwnerId,
        attestation_key: &str,
    ) -> Result<(), JuiceError> {
        let mut chain = self.chain.lock().expect("chain lock");
        chain.append(
            ChainPayload::AttestationGiven {
                subject,
                attestation_key: attestation_key.to_string(),
            },
            self.time.now_ms(),
            self.keypair.as_ref(),
        )?;
        self.store.put_chain(&chain)
    }

    /// Journal a trust attestation another participant issued about this
    /// user.
    pub fn record_attestation_received(
        &self,
        issuer: OwnerId,
        attestation_key: &str,
    ) -> Result<(), JuiceError> {
        let mut chain = self.chain.lock().expect("chain lock");
        chain.append(
            ChainPayload::AttestationReceived {
                issuer,
                attestation_key: attestation_key.to_string(),
            },
            self.time.now_ms(),
            self.keypair.as_ref(),
        )?;
        self.store.put_chain(&chain)
    }

    pub fn vector_clock(&self) -> Result<DenominationVectorClock, JuiceError> {
        let now = self.time.now_ms();
        let holdings = self.store.tokens_owned_by(&self.owner())?;
        // Reserved tokens still count: an in-flight transaction must not
        // flap the advertised portfolio.
        let counted: Vec<&Token> = holdings
            .iter()
            .filter(|t| {
                !t.is_expired(now)
                    && !matches!(t.status, TokenStatus::Consumed | TokenStatus::Revoked)
            })
            .collect();
        Ok(DenominationVectorClock::from_tokens(
            counted.into_iter(),
            &self.config.ideal_counts,
        ))
    }

    /// Signed (and TEE-countersigned when available) proof of current
    /// ownership for one of this user's tokens.
    pub async fn prove_ownership(
        &self,
        token_id: &TokenId,
    ) -> Result<juice_core::telomeer::OwnershipProof, JuiceError> {
        let telomeer = self.store.require_telomeer(token_id)?;
        if telomeer.current_owner != self.owner() {
            return Err(JuiceError::TokenNotOwned {
                token: token_id.to_string(),
                owner: self.owner().to_string(),
            });
        }
        let body = telomeer.proof_body(self.time.now_ms());
        let signing = body.signing_bytes();
        let signature = juice_crypto::Signer::sign(self.keypair.as_ref(), &signing);
        let tee_countersignature = self
            .tee
            .attest(&signing)
            .await?
            .map(|a| a.attestation_data);
        Ok(juice_core::telomeer::OwnershipProof {
            body,
            owner: self.owner(),
            signature,
            tee_countersignature,
        })
    }
}
