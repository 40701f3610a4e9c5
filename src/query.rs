//! Iterative Kademlia lookups.
//!
//! A [`Query`] walks toward a target key in rounds of at most `alpha`
//! concurrent requests. Every response may carry closer peers, which are
//! merged into the best-`k` set; the lookup converges once every member of
//! that set has been queried or has failed. A per-response callback can end
//! the lookup early.

use std::collections::HashSet;
use std::future::Future;
use std::ops::ControlFlow;

use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::context::{Interrupted, OpContext};
use crate::error::{DhtError, DhtResult};
use crate::identity::{closer_to, Key, PeerId, PeerInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryState {
    Init,
    Querying,
    Converged,
    TimedOut,
    Cancelled,
}

/// What a finished lookup learned.
#[derive(Clone, Debug)]
pub struct QueryOutcome {
    pub state: QueryState,
    /// True when the response callback ended the lookup.
    pub stopped_early: bool,
    /// Best-`k` peers that answered, closest first.
    pub closest: Vec<PeerInfo>,
    /// Every peer that answered, in response order.
    pub responded: Vec<PeerInfo>,
    pub failed: usize,
}

impl QueryOutcome {
    /// Map a lookup that did not converge to the matching error.
    pub fn converged(self) -> DhtResult<Self> {
        match self.state {
            QueryState::Converged => Ok(self),
            QueryState::Cancelled => Err(DhtError::Cancelled),
            QueryState::TimedOut => Err(DhtError::TimedOut),
            QueryState::Init | QueryState::Querying => Err(DhtError::LookupFailure),
        }
    }
}

pub struct Query {
    target: Key,
    local: PeerId,
    k: usize,
    alpha: usize,
    rpc_timeout: Duration,
    best: Vec<PeerInfo>,
    seen: HashSet<PeerId>,
    queried: HashSet<PeerId>,
    failed: HashSet<PeerId>,
    responded: Vec<PeerInfo>,
    state: QueryState,
}

impl Query {
    pub fn new(local: PeerId, target: Key, k: usize, alpha: usize, rpc_timeout: Duration) -> Self {
        Self {
            target,
            local,
            k: k.max(1),
            alpha: alpha.max(1),
            rpc_timeout,
            best: Vec::new(),
            seen: HashSet::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
            responded: Vec::new(),
            state: QueryState::Init,
        }
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Seed the lookup with peers from the routing table.
    pub fn seed(&mut self, peers: Vec<PeerInfo>) {
        self.merge(peers);
    }

    fn merge(&mut self, peers: Vec<PeerInfo>) {
        for peer in peers {
            if peer.id == self.local || self.failed.contains(&peer.id) {
                continue;
            }
            if self.seen.insert(peer.id) {
                self.best.push(peer);
            }
        }
        let target = self.target;
        self.best.sort_by(|a, b| closer_to(&target, &a.id, &b.id));
        self.best.truncate(self.k);
    }

    fn next_round(&self) -> Vec<PeerInfo> {
        self.best
            .iter()
            .filter(|peer| !self.queried.contains(&peer.id))
            .take(self.alpha)
            .cloned()
            .collect()
    }

    fn fail(&mut self, peer: &PeerId) {
        self.failed.insert(*peer);
        self.best.retain(|p| p.id != *peer);
    }

    fn finish(self, state: QueryState, stopped_early: bool) -> QueryOutcome {
        let responded: HashSet<PeerId> = self.responded.iter().map(|p| p.id).collect();
        let closest = self
            .best
            .iter()
            .filter(|p| responded.contains(&p.id))
            .cloned()
            .collect();
        debug!(
            target = %hex::encode(&self.target[..8]),
            state = ?state,
            responded = self.responded.len(),
            failed = self.failed.len(),
            "lookup finished"
        );
        QueryOutcome {
            state,
            stopped_early,
            closest,
            responded: self.responded,
            failed: self.failed.len(),
        }
    }

    /// Drive the lookup to completion.
    ///
    /// `request` performs one RPC and yields a payload plus the closer peers
    /// the responder reported. `on_response` sees every successful payload
    /// and may break to end the lookup early, which still counts as
    /// converged. Returns [`DhtError::LookupFailure`] when there was nothing
    /// to seed the lookup with.
    pub async fn run<T, F, Fut, C>(
        mut self,
        ctx: &OpContext,
        mut request: F,
        mut on_response: C,
    ) -> DhtResult<QueryOutcome>
    where
        T: Send + 'static,
        F: FnMut(PeerInfo) -> Fut,
        Fut: Future<Output = anyhow::Result<(T, Vec<PeerInfo>)>> + Send + 'static,
        C: FnMut(&PeerInfo, T) -> ControlFlow<()>,
    {
        if self.best.is_empty() {
            return Err(DhtError::LookupFailure);
        }
        self.state = QueryState::Querying;

        loop {
            if let Err(reason) = ctx.check() {
                return Ok(self.finish(interrupted_state(reason), false));
            }
            let round = self.next_round();
            if round.is_empty() {
                return Ok(self.finish(QueryState::Converged, false));
            }

            let mut in_flight = JoinSet::new();
            for peer in round {
                self.queried.insert(peer.id);
                trace!(
                    target = %hex::encode(&self.target[..8]),
                    peer = %peer.id.short(),
                    "querying peer"
                );
                let fut = request(peer.clone());
                let rpc_timeout = self.rpc_timeout;
                in_flight.spawn(async move {
                    let result = match tokio::time::timeout(rpc_timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("request timed out")),
                    };
                    (peer, result)
                });
            }

            loop {
                let joined = tokio::select! {
                    biased;
                    reason = ctx.done() => {
                        in_flight.abort_all();
                        return Ok(self.finish(interrupted_state(reason), false));
                    }
                    joined = in_flight.join_next() => joined,
                };
                let Some(joined) = joined else { break };
                let Ok((peer, result)) = joined else { continue };
                match result {
                    Ok((payload, closer)) => {
                        self.responded.push(peer.clone());
                        self.merge(closer);
                        if on_response(&peer, payload).is_break() {
                            in_flight.abort_all();
                            return Ok(self.finish(QueryState::Converged, true));
                        }
                    }
                    Err(e) => {
                        debug!(peer = %peer.id.short(), error = %e, "lookup request failed");
                        self.fail(&peer.id);
                    }
                }
            }
        }
    }
}

fn interrupted_state(reason: Interrupted) -> QueryState {
    match reason {
        Interrupted::Cancelled => QueryState::Cancelled,
        Interrupted::TimedOut => QueryState::TimedOut,
    }
}
