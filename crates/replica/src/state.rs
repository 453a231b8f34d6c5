//! Replica state engine.
//!
//! Owns every map the protocol keeps — the message log, the checkpoint
//! slots, the view-change cache, the client records — together with the
//! water marks and the current view. Subordinate components mutate only
//! through it, and all mutation happens inside `handle`, so stage
//! transitions are atomic with respect to inbound dispatch.

use crate::checkpoint::CheckpointSlot;
use crate::client::ClientRecord;
use crate::config::ReplicaConfig;
use crate::error::ProtocolError;
use crate::log::{MessageLog, Stage};
use crate::view_change::{decide, same_assignments, validate_view_change, ViewChangeCache};
use pbft_core::{Action, Event, StateMachine, TimerId};
use pbft_types::{
    Checkpoint, ClientId, Commit, ConsensusMessage, Digest, MessagePayload, NewView, PTuple,
    PrePrepare, Prepare, ReplicaId, Reply, Request, SeqNum, SignatureOracle, ViewChange, ViewId,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether the replica is serving the normal case or recovering from a
/// suspected primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaStatus {
    Serving,
    ViewChanging,
}

/// The replica state engine.
///
/// # State Machine Flow
///
/// 1. **Client request** → record it, arm the backup timer
/// 2. **Pre-prepare / prepare / commit** → advance the log entry's stage
/// 3. **Request executed** → record the reply, emit a checkpoint on interval
/// 4. **Checkpoint quorum** → stabilize, advance water marks, garbage-collect
/// 5. **Timer expiry** → broadcast VIEW-CHANGE, flush the log
/// 6. **2f view-changes at the new primary** → decide, broadcast NEW-VIEW
/// 7. **NEW-VIEW at a backup** → recompute, verify, re-seed the log
pub struct ReplicaState {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    node_id: ReplicaId,
    config: ReplicaConfig,
    oracle: Arc<dyn SignatureOracle>,

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol counters
    // ═══════════════════════════════════════════════════════════════════════
    /// Current view. Monotonic for the lifetime of the replica.
    view: ViewId,
    /// Highest sequence this replica has seen assigned.
    cur_sequence: SeqNum,
    /// Highest sequence executed, in strict order.
    last_executed: SeqNum,
    /// Low water mark `h`: the last stable checkpoint. `H = h + K` is
    /// derived, so the pair cannot drift.
    low_mark: SeqNum,
    status: ReplicaStatus,

    // ═══════════════════════════════════════════════════════════════════════
    // Owned maps
    // ═══════════════════════════════════════════════════════════════════════
    log: MessageLog,
    checkpoints: BTreeMap<SeqNum, CheckpointSlot>,
    vc_cache: ViewChangeCache,
    clients: BTreeMap<ClientId, ClientRecord>,

    /// Digest of the application state after executing through
    /// `last_executed`, fed in by the execution replies.
    exec_digest: Digest,

    /// Whether the per-request backup timer is currently armed.
    timer_armed: bool,
}

impl std::fmt::Debug for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaState")
            .field("node_id", &self.node_id)
            .field("view", &self.view)
            .field("status", &self.status)
            .field("low_mark", &self.low_mark)
            .field("high_mark", &self.high_mark())
            .field("cur_sequence", &self.cur_sequence)
            .field("last_executed", &self.last_executed)
            .field("log_entries", &self.log.len())
            .field("checkpoint_slots", &self.checkpoints.len())
            .finish()
    }
}

impl ReplicaState {
    /// Create a replica at view 0 with a stable genesis checkpoint at
    /// sequence 0, so exactly one stable slot exists from the start.
    pub fn new(node_id: ReplicaId, config: ReplicaConfig, oracle: Arc<dyn SignatureOracle>) -> Self {
        let mut genesis = CheckpointSlot::new(0, ViewId(0));
        genesis.stable = true;

        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(0, genesis);

        Self {
            node_id,
            config,
            oracle,
            view: ViewId(0),
            cur_sequence: 0,
            last_executed: 0,
            low_mark: 0,
            status: ReplicaStatus::Serving,
            log: MessageLog::new(),
            checkpoints,
            vc_cache: ViewChangeCache::new(),
            clients: BTreeMap::new(),
            exec_digest: Digest::NULL,
            timer_armed: false,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn node_id(&self) -> ReplicaId {
        self.node_id
    }

    pub fn view(&self) -> ViewId {
        self.view
    }

    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    /// The low water mark `h`.
    pub fn low_mark(&self) -> SeqNum {
        self.low_mark
    }

    /// The high water mark `H = h + K`.
    pub fn high_mark(&self) -> SeqNum {
        self.low_mark + self.config.watermark_window
    }

    pub fn last_executed(&self) -> SeqNum {
        self.last_executed
    }

    pub fn current_sequence(&self) -> SeqNum {
        self.cur_sequence
    }

    /// The stable checkpoint slot pinning the low water mark.
    pub fn last_stable(&self) -> Option<&CheckpointSlot> {
        self.checkpoints.get(&self.low_mark)
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn checkpoint_slots(&self) -> &BTreeMap<SeqNum, CheckpointSlot> {
        &self.checkpoints
    }

    pub fn view_change_cache(&self) -> &ViewChangeCache {
        &self.vc_cache
    }

    pub fn client_record(&self, client: &ClientId) -> Option<&ClientRecord> {
        self.clients.get(client)
    }

    /// Whether the normal case may assign `seq` right now.
    pub fn admit_sequence(&self, seq: SeqNum) -> bool {
        self.status == ReplicaStatus::Serving && seq > self.low_mark && seq <= self.high_mark()
    }

    fn check_window(&self, seq: SeqNum) -> Result<(), ProtocolError> {
        if seq <= self.low_mark || seq > self.high_mark() {
            return Err(ProtocolError::OutOfWindow {
                seq,
                low: self.low_mark,
                high: self.high_mark(),
            });
        }
        Ok(())
    }

    fn has_outstanding(&self) -> bool {
        self.clients.values().any(ClientRecord::has_outstanding)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound dispatch
    // ═══════════════════════════════════════════════════════════════════════

    /// Ingest one consensus message. Validation errors leave state untouched.
    pub fn on_message(&mut self, msg: ConsensusMessage) -> Result<Vec<Action>, ProtocolError> {
        if !self.oracle.verify(&msg) {
            return Err(ProtocolError::SignatureRejected { from: msg.from });
        }

        // While changing views, only recovery traffic is accepted.
        if self.status == ReplicaStatus::ViewChanging
            && !msg.payload.accepted_while_view_changing()
        {
            debug!(
                node = %self.node_id,
                kind = msg.payload.type_name(),
                "dropping normal-case message while view changing"
            );
            return Ok(vec![]);
        }

        match msg.payload {
            MessagePayload::Request(request) => Ok(self.on_client_request(request)),
            MessagePayload::PrePrepare(pp) => self.on_pre_prepare(pp),
            MessagePayload::Prepare(prepare) => self.on_prepare(prepare),
            MessagePayload::Commit(commit) => self.on_commit(commit),
            MessagePayload::Checkpoint(checkpoint) => self.on_checkpoint(checkpoint),
            MessagePayload::ViewChange(vc) => self.on_view_change(*vc),
            MessagePayload::NewView(nv) => self.on_new_view(*nv),
            // Replies travel the client channel; replicas ignore them.
            MessagePayload::Reply(_) => Ok(vec![]),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Normal-case log advancement
    // ═══════════════════════════════════════════════════════════════════════

    /// Accept a pre-prepare for the current view, creating the log entry.
    pub fn on_pre_prepare(&mut self, pp: PrePrepare) -> Result<Vec<Action>, ProtocolError> {
        self.check_window(pp.seq)?;
        if pp.view < self.view {
            return Err(ProtocolError::StaleView {
                got: pp.view,
                current: self.view,
            });
        }
        if pp.view > self.view {
            return Err(ProtocolError::WrongView {
                got: pp.view,
                current: self.view,
            });
        }
        let seq = pp.seq;
        self.log.insert_pre_prepare(pp)?;
        self.cur_sequence = self.cur_sequence.max(seq);
        Ok(vec![])
    }

    /// Accept a prepare vote; the entry moves to `Prepared` once `2f`
    /// backups agree.
    pub fn on_prepare(&mut self, prepare: Prepare) -> Result<Vec<Action>, ProtocolError> {
        self.check_window(prepare.seq)?;
        let seq = prepare.seq;
        self.log.insert_prepare(prepare)?;
        if self.log.is_prepared(seq, &self.config) {
            if let Some(entry) = self.log.entry(seq) {
                if entry.stage < Stage::Prepared {
                    self.log.advance_stage(seq, Stage::Prepared)?;
                    debug!(node = %self.node_id, seq, "sequence prepared");
                }
            }
        }
        Ok(vec![])
    }

    /// Accept a commit vote; the entry moves to `Committed` once `2f + 1`
    /// replicas agree.
    pub fn on_commit(&mut self, commit: Commit) -> Result<Vec<Action>, ProtocolError> {
        self.check_window(commit.seq)?;
        let seq = commit.seq;
        self.log.insert_commit(commit)?;
        if self.log.is_committed(seq, &self.config) {
            if let Some(entry) = self.log.entry(seq) {
                if entry.stage < Stage::Committed {
                    self.log.advance_stage(seq, Stage::Committed)?;
                    debug!(node = %self.node_id, seq, "sequence committed");
                }
            }
        }
        Ok(vec![])
    }

    /// Drive a sequence from `Idle` to `PrePrepared` during NEW-VIEW
    /// install. This is the hook the new-view transition runs once per
    /// sequence in O ∪ N.
    pub fn idle_to_preprepare(&mut self, pp: PrePrepare) -> Result<(), ProtocolError> {
        self.check_window(pp.seq)?;
        let seq = pp.seq;
        self.log.insert_pre_prepare(pp)?;
        self.cur_sequence = self.cur_sequence.max(seq);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client requests and execution
    // ═══════════════════════════════════════════════════════════════════════

    /// Record an accepted client request and arm the backup timer. The
    /// timer only runs while some request is awaiting execution.
    pub fn on_client_request(&mut self, request: Request) -> Vec<Action> {
        debug!(
            node = %self.node_id,
            client = %request.client,
            timestamp = request.timestamp,
            "client request accepted"
        );
        self.clients
            .entry(request.client.clone())
            .or_default()
            .record_request(request);

        if self.status == ReplicaStatus::Serving && !self.timer_armed {
            self.timer_armed = true;
            return vec![Action::SetTimer {
                id: TimerId::Request,
                duration: self.config.request_timeout,
            }];
        }
        vec![]
    }

    /// Called by the normal-case collaborator after executing each request,
    /// in strict sequence order. Records the reply, advances the executed
    /// sequence, and emits a checkpoint when the interval is crossed.
    pub fn on_request_executed(&mut self, reply: Reply) -> Vec<Action> {
        let seq = reply.seq;
        self.last_executed = self.last_executed.max(seq);
        self.cur_sequence = self.cur_sequence.max(seq);
        self.exec_digest = reply.state_digest;

        if self.log.entry(seq).is_some() {
            // The entry may already be gone if a checkpoint subsumed it.
            if let Err(err) = self.log.advance_stage(seq, Stage::Executed) {
                warn!(node = %self.node_id, seq, %err, "could not mark executed");
            }
        }

        self.clients
            .entry(reply.client.clone())
            .or_default()
            .save_reply(reply);

        let mut actions = Vec::new();

        // Restart the timer while something is still waiting; stop it
        // otherwise.
        if self.has_outstanding() {
            self.timer_armed = true;
            actions.push(Action::SetTimer {
                id: TimerId::Request,
                duration: self.config.request_timeout,
            });
        } else if self.timer_armed {
            self.timer_armed = false;
            actions.push(Action::CancelTimer {
                id: TimerId::Request,
            });
        }

        if self.config.is_checkpoint_seq(seq) {
            info!(node = %self.node_id, seq, "checkpoint interval crossed");
            actions.extend(self.emit_checkpoint(seq, self.exec_digest));
        }

        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoint engine
    // ═══════════════════════════════════════════════════════════════════════

    /// Record our own checkpoint proof and broadcast it.
    fn emit_checkpoint(&mut self, seq: SeqNum, digest: Digest) -> Vec<Action> {
        let view = self.view;
        let proof = Checkpoint {
            seq,
            node: self.node_id,
            view,
            digest,
        };
        {
            let slot = self
                .checkpoints
                .entry(seq)
                .or_insert_with(|| CheckpointSlot::new(seq, view));
            slot.insert_proof(proof.clone());
        }
        self.try_stabilize(seq);

        debug!(node = %self.node_id, seq, "broadcasting checkpoint");
        vec![Action::Broadcast {
            message: ConsensusMessage::broadcast(
                self.node_id,
                MessagePayload::Checkpoint(proof),
            ),
        }]
    }

    /// Ingest a foreign checkpoint proof.
    pub fn on_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<Vec<Action>, ProtocolError> {
        if checkpoint.seq <= self.low_mark {
            // Already subsumed by the stable checkpoint.
            return Err(ProtocolError::OutOfWindow {
                seq: checkpoint.seq,
                low: self.low_mark,
                high: self.high_mark(),
            });
        }
        let seq = checkpoint.seq;
        let view = self.view;
        {
            let slot = self
                .checkpoints
                .entry(seq)
                .or_insert_with(|| CheckpointSlot::new(seq, view));
            slot.insert_proof(checkpoint);
        }
        self.try_stabilize(seq);
        Ok(vec![])
    }

    /// Declare a checkpoint stable once `2f + 1` proofs match, advance the
    /// water marks, and garbage-collect everything the checkpoint subsumes.
    /// Stability is monotone: a late quorum for a smaller sequence never
    /// rolls `h` back.
    fn try_stabilize(&mut self, seq: SeqNum) {
        if seq < self.low_mark {
            return;
        }
        let strong = self.config.strong_quorum();
        let Some(slot) = self.checkpoints.get_mut(&seq) else {
            return;
        };
        if slot.stable {
            return;
        }
        let Some(digest) = slot.quorum_digest(strong) else {
            return;
        };
        slot.stable = true;
        slot.digest = digest;

        self.low_mark = seq;
        self.last_executed = self.last_executed.max(seq);
        self.cur_sequence = self.cur_sequence.max(seq);

        // The prepared/committed history below the checkpoint is subsumed;
        // earlier checkpoint slots likewise.
        self.log.purge_through(seq);
        self.checkpoints.retain(|slot_seq, _| *slot_seq >= seq);

        info!(
            node = %self.node_id,
            seq,
            low = self.low_mark,
            high = self.high_mark(),
            "checkpoint stable, water marks advanced"
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View-change engine
    // ═══════════════════════════════════════════════════════════════════════

    /// The prepared certificates for every sequence in `(h, H]` — the P set
    /// of an outgoing VIEW-CHANGE.
    fn compute_prepared(&self) -> BTreeMap<SeqNum, PTuple> {
        let mut prepared = BTreeMap::new();
        for (seq, entry) in self.log.iter() {
            if *seq <= self.low_mark || *seq > self.high_mark() {
                continue;
            }
            if !self.log.is_prepared(*seq, &self.config) {
                continue;
            }
            if let Some(pp) = &entry.pre_prepare {
                prepared.insert(*seq, PTuple::new(pp.clone(), entry.prepares.clone()));
            }
        }
        prepared
    }

    /// Suspect the primary: broadcast VIEW-CHANGE for the next view, enter
    /// `ViewChanging`, and flush the log. Retransmission of anything lost
    /// must come from other replicas or from the NEW-VIEW's O/N sets.
    pub fn start_view_change(&mut self) -> Vec<Action> {
        let new_view = self.view.next();
        info!(
            node = %self.node_id,
            %new_view,
            stable_seq = self.low_mark,
            "starting view change"
        );

        self.status = ReplicaStatus::ViewChanging;
        let mut actions = Vec::new();
        if self.timer_armed {
            self.timer_armed = false;
            actions.push(Action::CancelTimer {
                id: TimerId::Request,
            });
        }

        let checkpoint_proofs = self
            .last_stable()
            .map(|slot| slot.proofs.clone())
            .unwrap_or_default();

        let vc = ViewChange {
            new_view,
            last_stable_seq: self.low_mark,
            node: self.node_id,
            checkpoint_proofs,
            prepared: self.compute_prepared(),
        };

        if self.config.primary_of(new_view) == self.node_id {
            self.vc_cache.push(vc.clone());
        }

        actions.push(Action::Broadcast {
            message: ConsensusMessage::broadcast(
                self.node_id,
                MessagePayload::ViewChange(Box::new(vc)),
            ),
        });

        self.view = new_view;
        self.log.flush();
        actions
    }

    /// Collect a VIEW-CHANGE at the prospective new primary. Once `2f`
    /// distinct senders are in hand and no NEW-VIEW has been emitted for
    /// this view, run the decision procedure.
    pub fn on_view_change(&mut self, vc: ViewChange) -> Result<Vec<Action>, ProtocolError> {
        let new_primary = self.config.primary_of(vc.new_view);
        if new_primary != self.node_id {
            debug!(
                node = %self.node_id,
                target = %vc.new_view,
                %new_primary,
                "not the prospective primary, ignoring view change"
            );
            return Ok(vec![]);
        }

        validate_view_change(&vc, self.view, &self.config)?;

        let new_view = vc.new_view;
        self.vc_cache.push(vc);

        if self.vc_cache.len() < self.config.new_view_quorum() {
            return Ok(vec![]);
        }
        if self.vc_cache.has_new_view(new_view) {
            debug!(node = %self.node_id, %new_view, "new view already emitted");
            return Ok(vec![]);
        }

        self.emit_new_view(new_view)
    }

    /// The primary's side of the transition: decide, broadcast NEW-VIEW,
    /// install the chosen checkpoint, resume serving.
    fn emit_new_view(&mut self, new_view: ViewId) -> Result<Vec<Action>, ProtocolError> {
        self.view = new_view;
        let decision = decide(self.vc_cache.view_changes(), new_view);

        info!(
            node = %self.node_id,
            %new_view,
            start_seq = decision.start_seq,
            next_seq = decision.next_seq,
            reissued = decision.reissued.len(),
            fillers = decision.fillers.len(),
            "emitting new view"
        );

        let nv = NewView {
            new_view,
            view_changes: self.vc_cache.view_changes().clone(),
            reissued: decision.reissued.clone(),
            fillers: decision.fillers.clone(),
        };
        self.vc_cache.record_new_view(nv.clone());
        self.cur_sequence = decision.next_seq;

        let mut actions = vec![Action::Broadcast {
            message: ConsensusMessage::broadcast(
                self.node_id,
                MessagePayload::NewView(Box::new(nv)),
            ),
        }];

        actions.extend(self.update_state_nv(decision.start_seq, decision.witness.as_ref()));
        self.clean_requests();
        self.status = ReplicaStatus::Serving;
        Ok(actions)
    }

    /// A backup processing the primary's NEW-VIEW: recompute the decision,
    /// verify O and N, then re-seed the log from them.
    pub fn on_new_view(&mut self, nv: NewView) -> Result<Vec<Action>, ProtocolError> {
        if nv.new_view < self.view {
            return Err(ProtocolError::StaleView {
                got: nv.new_view,
                current: self.view,
            });
        }
        if self.config.primary_of(nv.new_view) == self.node_id {
            // Our own broadcast echoed back.
            return Ok(vec![]);
        }

        let decision = decide(&nv.view_changes, nv.new_view);

        // The primary's O/N must match our own run of the decision
        // procedure before anything is installed.
        if !same_assignments(&decision.reissued, &nv.reissued) {
            return Err(ProtocolError::DivergentNewView { set: "O" });
        }
        if !same_assignments(&decision.fillers, &nv.fillers) {
            return Err(ProtocolError::DivergentNewView { set: "N" });
        }

        self.vc_cache.replace(nv.view_changes.clone());

        info!(
            node = %self.node_id,
            new_view = %nv.new_view,
            start_seq = decision.start_seq,
            next_seq = decision.next_seq,
            "installing new view"
        );

        // The view transition replaces the log; previous contents are
        // subsumed by the checkpoint and the O/N sets.
        self.log.flush();
        self.view = nv.new_view;
        self.status = ReplicaStatus::Serving;

        // Install the chosen checkpoint first so the re-seeded sequences
        // fall inside the new window.
        let mut actions = self.update_state_nv(decision.start_seq, decision.witness.as_ref());

        for pp in decision.reissued.values().chain(decision.fillers.values()) {
            self.idle_to_preprepare(pp.clone())?;
        }

        self.vc_cache.record_new_view(nv);
        self.cur_sequence = decision.next_seq;
        self.clean_requests();
        Ok(actions)
    }

    /// Install the new view's starting checkpoint: seed a slot from the
    /// witness C set, stabilize it, and broadcast a fresh local proof so
    /// lagging replicas catch up.
    fn update_state_nv(
        &mut self,
        start_seq: SeqNum,
        witness: Option<&ViewChange>,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        let view = self.view;
        if start_seq > self.low_mark {
            if let Some(vc) = witness {
                let digest = {
                    let slot = self
                        .checkpoints
                        .entry(start_seq)
                        .or_insert_with(|| CheckpointSlot::new(start_seq, view));
                    for proof in vc.checkpoint_proofs.values() {
                        slot.insert_proof(proof.clone());
                    }
                    slot.quorum_digest(self.config.weak_quorum())
                };
                self.try_stabilize(start_seq);

                if let Some(digest) = digest {
                    // We have not executed to start_seq ourselves; the
                    // weakly-certified digest stands in for local state.
                    self.exec_digest = digest;
                    actions.extend(self.emit_checkpoint(start_seq, digest));
                }
            }
        }

        if start_seq > self.last_executed {
            self.last_executed = start_seq;
        }
        actions
    }

    /// Drop every pending request that predates its client's last reply.
    fn clean_requests(&mut self) {
        for (client, record) in &mut self.clients {
            let dropped = record.prune_stale();
            if dropped > 0 {
                debug!(node = %self.node_id, %client, dropped, "pruned stale requests");
            }
        }
    }
}

impl StateMachine for ReplicaState {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::RequestTimer => self.start_view_change(),
            Event::ClientRequest { request } => self.on_client_request(request),
            Event::RequestExecuted { reply } => self.on_request_executed(reply),
            Event::MessageReceived { message } => {
                let kind = message.payload.type_name();
                let from = message.from;
                match self.on_message(message) {
                    Ok(actions) => actions,
                    Err(err) if err.is_benign() => {
                        debug!(node = %self.node_id, %from, kind, %err, "dropped message");
                        vec![]
                    }
                    Err(err) => {
                        warn!(node = %self.node_id, %from, kind, %err, "rejected message");
                        vec![]
                    }
                }
            }
        }
    }
}
