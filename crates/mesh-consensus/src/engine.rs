//! Proposal state machine.
//!
//! A node plays one of two roles per proposal:
//!
//! - **Proposer**: creates the proposal, votes yes for it, collects votes,
//!   decides, and announces the decision to the electorate.
//! - **Participant**: receives the proposal, casts one vote, and applies
//!   the proposer's commit. A participant that never hears a commit
//!   expires the proposal locally after `participant_expiry_factor` times
//!   the proposal timeout.
//!
//! Lifecycle (proposer):
//! 1. `propose()` - snapshot the electorate and open the round
//! 2. `record_vote()` - count votes until quorum is reached or unreachable
//! 3. `expire()` - reject proposals that outlive their deadline
//!
//! The engine is synchronous and does no I/O. Callers send the returned
//! params and act on returned [`Decision`]s.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use mesh_protocol::{
    CommitParams, NodeId, ProposalData, ProposalId, ProposalOutcome, ProposalParams,
    RejectionReason, VoteParams, DEFAULT_PROPOSAL_TIMEOUT_MS,
};

use crate::quorum::{quorum_size, Tally, TallyState};
use crate::ConsensusError;

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Time a proposal may stay pending at the proposer.
    pub proposal_timeout: Duration,
    /// Participants expire unanswered proposals after this many timeouts.
    pub participant_expiry_factor: i32,
    /// How long decided proposals are kept for duplicate detection.
    pub retention: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            proposal_timeout: Duration::milliseconds(DEFAULT_PROPOSAL_TIMEOUT_MS as i64),
            participant_expiry_factor: 2,
            retention: Duration::minutes(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalRole {
    Proposer,
    Participant,
}

/// Local view of one proposal.
#[derive(Debug, Clone)]
pub struct ProposalRecord {
    pub proposal_id: ProposalId,
    pub epoch: u64,
    pub proposer: NodeId,
    pub data: ProposalData,
    pub electorate: BTreeSet<NodeId>,
    pub quorum: usize,
    pub tally: Tally,
    pub outcome: ProposalOutcome,
    pub reason: Option<RejectionReason>,
    pub role: ProposalRole,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A proposal reached its terminal outcome on this node.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub proposal_id: ProposalId,
    pub proposer: NodeId,
    pub epoch: u64,
    pub outcome: ProposalOutcome,
    pub reason: Option<RejectionReason>,
    pub data: ProposalData,
    pub role: ProposalRole,
    pub electorate: Vec<NodeId>,
}

impl Decision {
    pub fn is_committed(&self) -> bool {
        self.outcome == ProposalOutcome::Committed
    }

    /// Commit message the proposer sends to the electorate.
    pub fn commit_params(&self) -> CommitParams {
        CommitParams {
            proposal_id: self.proposal_id.clone(),
            proposer: self.proposer.clone(),
            epoch: self.epoch,
            outcome: self.outcome,
            reason: self.reason,
            data: self.data.clone(),
        }
    }
}

pub struct ConsensusEngine {
    local: NodeId,
    config: ConsensusConfig,
    /// Last epoch used by this node.
    epoch: u64,
    proposals: HashMap<ProposalId, ProposalRecord>,
    /// Highest epoch accepted from each remote proposer.
    last_seen_epoch: HashMap<NodeId, u64>,
    last_commit_at: Option<DateTime<Utc>>,
    rejections_since_commit: usize,
    committed_total: u64,
    rejected_total: u64,
}

impl ConsensusEngine {
    /// `start_epoch` seeds the epoch counter. Seeding from the wall clock
    /// keeps a restarted node's epochs above those its peers remember.
    pub fn new(local: NodeId, config: ConsensusConfig, start_epoch: u64) -> Self {
        Self {
            local,
            config,
            epoch: start_epoch,
            proposals: HashMap::new(),
            last_seen_epoch: HashMap::new(),
            last_commit_at: None,
            rejections_since_commit: 0,
            committed_total: 0,
            rejected_total: 0,
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Open a round over `data`. The electorate is `peers` plus this node.
    ///
    /// Returns the proposal to send to every other elector, and a decision
    /// if this node alone already forms a quorum.
    pub fn propose(
        &mut self,
        data: ProposalData,
        peers: &[NodeId],
        now: DateTime<Utc>,
    ) -> Result<(ProposalParams, Option<Decision>), ConsensusError> {
        if let ProposalData::DeclareFaulty { peer } = &data {
            if peer == &self.local {
                return Err(ConsensusError::InvalidProposal(
                    "a node cannot declare itself faulty".into(),
                ));
            }
        }
        if data.host().is_some_and(|h| h.is_blank()) || data.agent_id().is_some_and(|a| a.is_blank()) {
            return Err(ConsensusError::InvalidProposal("empty node or agent id".into()));
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let mut electorate: BTreeSet<NodeId> = peers.iter().cloned().collect();
        electorate.insert(self.local.clone());
        let quorum = quorum_size(electorate.len());

        let mut tally = Tally::new();
        tally.record(&self.local, true);

        let proposal_id = ProposalId::generate();
        let deadline = now + self.config.proposal_timeout;
        let params = ProposalParams {
            proposal_id: proposal_id.clone(),
            epoch,
            proposer: self.local.clone(),
            data: data.clone(),
            electorate: electorate.iter().cloned().collect(),
            quorum,
            created_at: now,
            deadline,
        };

        tracing::info!(
            proposal_id = %proposal_id,
            epoch,
            kind = data.label(),
            electorate = electorate.len(),
            quorum,
            "Proposal opened"
        );

        let state = tally.evaluate(electorate.len(), quorum);
        self.proposals.insert(
            proposal_id.clone(),
            ProposalRecord {
                proposal_id: proposal_id.clone(),
                epoch,
                proposer: self.local.clone(),
                data,
                electorate,
                quorum,
                tally,
                outcome: ProposalOutcome::Pending,
                reason: None,
                role: ProposalRole::Proposer,
                created_at: now,
                deadline,
                decided_at: None,
            },
        );

        let decision = match state {
            TallyState::Reached => self.decide(&proposal_id, ProposalOutcome::Committed, None, now),
            _ => None,
        };
        Ok((params, decision))
    }

    /// Accept a proposal from a remote proposer as a participant.
    pub fn receive_proposal(&mut self, params: &ProposalParams, now: DateTime<Utc>) -> Result<(), ConsensusError> {
        if params.proposer == self.local {
            return Err(ConsensusError::InvalidProposal("own proposal echoed back".into()));
        }
        if let Some(&last_seen) = self.last_seen_epoch.get(&params.proposer) {
            if params.epoch <= last_seen {
                return Err(ConsensusError::StaleEpoch {
                    proposer: params.proposer.clone(),
                    got: params.epoch,
                    last_seen,
                });
            }
        }
        let electorate: BTreeSet<NodeId> = params.electorate.iter().cloned().collect();
        if !electorate.contains(&self.local) {
            return Err(ConsensusError::NotInElectorate {
                voter: self.local.clone(),
                proposal_id: params.proposal_id.clone(),
            });
        }
        if !electorate.contains(&params.proposer) || params.quorum != quorum_size(electorate.len()) {
            return Err(ConsensusError::InvalidProposal(format!(
                "inconsistent electorate or quorum in {}",
                params.proposal_id
            )));
        }

        self.last_seen_epoch.insert(params.proposer.clone(), params.epoch);
        let mut tally = Tally::new();
        tally.record(&params.proposer, true);
        let deadline = now + self.config.proposal_timeout * self.config.participant_expiry_factor;
        self.proposals.insert(
            params.proposal_id.clone(),
            ProposalRecord {
                proposal_id: params.proposal_id.clone(),
                epoch: params.epoch,
                proposer: params.proposer.clone(),
                data: params.data.clone(),
                electorate,
                quorum: params.quorum,
                tally,
                outcome: ProposalOutcome::Pending,
                reason: None,
                role: ProposalRole::Participant,
                created_at: now,
                deadline,
                decided_at: None,
            },
        );

        tracing::debug!(
            proposal_id = %params.proposal_id,
            proposer = %params.proposer,
            epoch = params.epoch,
            kind = params.data.label(),
            "Proposal received"
        );
        Ok(())
    }

    /// Cast this node's vote on a received proposal.
    pub fn cast_vote(
        &mut self,
        proposal_id: &ProposalId,
        approve: bool,
        reason: Option<String>,
    ) -> Result<VoteParams, ConsensusError> {
        let record = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| ConsensusError::UnknownProposal(proposal_id.clone()))?;
        if record.outcome.is_terminal() {
            return Err(ConsensusError::AlreadyDecided {
                proposal_id: proposal_id.clone(),
                outcome: record.outcome,
            });
        }
        record.tally.record(&self.local, approve);
        tracing::debug!(proposal_id = %proposal_id, approve, "Vote cast");
        Ok(VoteParams {
            proposal_id: proposal_id.clone(),
            proposer: record.proposer.clone(),
            epoch: record.epoch,
            voter: self.local.clone(),
            approve,
            reason,
        })
    }

    /// Count a vote on one of our own proposals.
    ///
    /// Votes arriving after the round closed are ignored, not errors.
    pub fn record_vote(&mut self, vote: &VoteParams, now: DateTime<Utc>) -> Result<Option<Decision>, ConsensusError> {
        let record = self
            .proposals
            .get_mut(&vote.proposal_id)
            .ok_or_else(|| ConsensusError::UnknownProposal(vote.proposal_id.clone()))?;
        if record.role != ProposalRole::Proposer || vote.epoch != record.epoch {
            return Err(ConsensusError::InvalidProposal(format!(
                "vote for {} does not match a local proposal",
                vote.proposal_id
            )));
        }
        if record.outcome.is_terminal() {
            tracing::debug!(
                proposal_id = %vote.proposal_id,
                voter = %vote.voter,
                "Ignoring vote after close"
            );
            return Ok(None);
        }
        if !record.electorate.contains(&vote.voter) {
            return Err(ConsensusError::NotInElectorate {
                voter: vote.voter.clone(),
                proposal_id: vote.proposal_id.clone(),
            });
        }
        if !record.tally.record(&vote.voter, vote.approve) {
            tracing::debug!(proposal_id = %vote.proposal_id, voter = %vote.voter, "Duplicate vote");
            return Ok(None);
        }

        tracing::debug!(
            proposal_id = %vote.proposal_id,
            voter = %vote.voter,
            approve = vote.approve,
            yes = record.tally.yes(),
            no = record.tally.no(),
            quorum = record.quorum,
            "Recorded vote"
        );

        match record.tally.evaluate(record.electorate.len(), record.quorum) {
            TallyState::Reached => Ok(self.decide(&vote.proposal_id, ProposalOutcome::Committed, None, now)),
            TallyState::Unreachable => Ok(self.decide(
                &vote.proposal_id,
                ProposalOutcome::Rejected,
                Some(RejectionReason::QuorumNo),
                now,
            )),
            TallyState::Undecided => Ok(None),
        }
    }

    /// Apply the proposer's decision as a participant.
    pub fn apply_commit(&mut self, commit: &CommitParams, now: DateTime<Utc>) -> Result<Option<Decision>, ConsensusError> {
        let record = self
            .proposals
            .get(&commit.proposal_id)
            .ok_or_else(|| ConsensusError::UnknownProposal(commit.proposal_id.clone()))?;
        if record.proposer != commit.proposer || commit.outcome == ProposalOutcome::Pending {
            return Err(ConsensusError::InvalidProposal(format!(
                "commit for {} is not from its proposer or not terminal",
                commit.proposal_id
            )));
        }
        if record.outcome.is_terminal() {
            if record.outcome == commit.outcome {
                return Ok(None);
            }
            return Err(ConsensusError::OutcomeConflict {
                proposal_id: commit.proposal_id.clone(),
                recorded: record.outcome,
                received: commit.outcome,
            });
        }
        Ok(self.decide(&commit.proposal_id, commit.outcome, commit.reason, now))
    }

    /// Reject every pending proposal whose deadline has passed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Decision> {
        let mut due: Vec<(u64, ProposalId)> = self
            .proposals
            .values()
            .filter(|p| p.outcome == ProposalOutcome::Pending && p.deadline <= now)
            .map(|p| (p.epoch, p.proposal_id.clone()))
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(_, id)| {
                self.decide(&id, ProposalOutcome::Rejected, Some(RejectionReason::Timeout), now)
            })
            .collect()
    }

    /// Reject every pending proposal. Used on shutdown.
    pub fn cancel_all(&mut self, now: DateTime<Utc>) -> Vec<Decision> {
        let mut pending: Vec<(u64, ProposalId)> = self
            .proposals
            .values()
            .filter(|p| p.outcome == ProposalOutcome::Pending)
            .map(|p| (p.epoch, p.proposal_id.clone()))
            .collect();
        pending.sort();
        pending
            .into_iter()
            .filter_map(|(_, id)| {
                self.decide(&id, ProposalOutcome::Rejected, Some(RejectionReason::Cancelled), now)
            })
            .collect()
    }

    /// Forget decided proposals older than the retention window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let retention = self.config.retention;
        self.proposals
            .retain(|_, p| p.decided_at.map_or(true, |at| now - at < retention));
    }

    /// Write-once transition out of `Pending`.
    fn decide(
        &mut self,
        id: &ProposalId,
        outcome: ProposalOutcome,
        reason: Option<RejectionReason>,
        now: DateTime<Utc>,
    ) -> Option<Decision> {
        let record = self.proposals.get_mut(id)?;
        if record.outcome.is_terminal() || !outcome.is_terminal() {
            return None;
        }
        record.outcome = outcome;
        record.reason = reason;
        record.decided_at = Some(now);

        match outcome {
            ProposalOutcome::Committed => {
                self.committed_total += 1;
                self.last_commit_at = Some(now);
                self.rejections_since_commit = 0;
                tracing::info!(proposal_id = %id, epoch = record.epoch, kind = record.data.label(), "Proposal committed");
            }
            _ => {
                self.rejected_total += 1;
                self.rejections_since_commit += 1;
                tracing::info!(proposal_id = %id, epoch = record.epoch, reason = ?reason, "Proposal rejected");
            }
        }

        Some(Decision {
            proposal_id: id.clone(),
            proposer: record.proposer.clone(),
            epoch: record.epoch,
            outcome,
            reason,
            data: record.data.clone(),
            role: record.role,
            electorate: record.electorate.iter().cloned().collect(),
        })
    }

    pub fn get(&self, id: &ProposalId) -> Option<&ProposalRecord> {
        self.proposals.get(id)
    }

    pub fn outcome(&self, id: &ProposalId) -> Option<ProposalOutcome> {
        self.proposals.get(id).map(|p| p.outcome)
    }

    pub fn pending_count(&self) -> usize {
        self.proposals
            .values()
            .filter(|p| p.outcome == ProposalOutcome::Pending)
            .count()
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_commit_at(&self) -> Option<DateTime<Utc>> {
        self.last_commit_at
    }

    pub fn rejections_since_commit(&self) -> usize {
        self.rejections_since_commit
    }

    pub fn committed_total(&self) -> u64 {
        self.committed_total
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected_total
    }
}
