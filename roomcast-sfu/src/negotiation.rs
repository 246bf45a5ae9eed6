//! Renegotiation engine
//!
//! A sync pass reconciles every participant's outbound senders with the
//! room's track registry and sends a fresh offer where anything changed.
//! Passes are repeated while any participant fails transiently; after the
//! configured number of attempts one deferred retry is handed to the retry
//! scheduler instead of spinning.

use crate::error::{Result, SfuError};
use crate::message::{SdpPayload, SignalMessage};
use crate::peer::{InboundTrack, SessionDescription};
use crate::room::Room;
use crate::session::ParticipantSession;
use crate::track::ForwardTrack;
use crate::types::PeerId;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sender changes needed to bring one participant in line with the registry
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Track ids attached to senders but no longer in the registry
    pub stale: Vec<String>,
    /// Registry tracks the participant should receive but does not
    pub missing: Vec<Arc<ForwardTrack>>,
}

impl SyncPlan {
    #[must_use]
    pub fn compute(
        participant: &PeerId,
        senders: &[String],
        inbound: &[InboundTrack],
        registry: &[Arc<ForwardTrack>],
    ) -> Self {
        let registered: HashSet<&str> = registry.iter().map(|t| t.id.as_str()).collect();
        let inbound_ids: Vec<String> = inbound.iter().map(|i| i.track_id.clone()).collect();

        let stale: Vec<String> = senders
            .iter()
            .filter(|id| !registered.contains(id.as_str()))
            .cloned()
            .collect();

        let attached: HashSet<&str> = senders.iter().map(String::as_str).collect();
        let missing = registry
            .iter()
            .filter(|track| !attached.contains(track.id.as_str()))
            .filter(|track| !track.is_loopback_for(participant, &inbound_ids))
            .cloned()
            .collect();

        Self { stale, missing }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.missing.is_empty()
    }
}

/// How a sync call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A pass completed with no transient failure
    Converged,
    /// Attempts exhausted; a deferred retry was scheduled
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParticipantSync {
    Offered,
    Unchanged,
    /// An offer is outstanding; the change is picked up after its answer
    Queued,
}

impl Room {
    /// Reconcile every participant with the track registry.
    pub async fn sync(self: &Arc<Self>) -> SyncOutcome {
        let attempts = self.config.sync_attempts();
        for attempt in 1..=attempts {
            if self.sync_pass().await {
                debug!(room_id = %self.id, attempt, "Room converged");
                self.dispatch_keyframe().await;
                self.request_reclaim();
                return SyncOutcome::Converged;
            }
        }

        warn!(
            room_id = %self.id,
            attempts,
            retry_delay_ms = self.config.retry_delay_ms,
            "Sync did not converge, deferring retry"
        );
        self.retry.schedule(self.id.clone());
        self.request_reclaim();
        SyncOutcome::Deferred
    }

    /// One pass over a snapshot of the room. Returns `true` when no
    /// participant failed transiently; see [`SfuError::is_transient`].
    async fn sync_pass(self: &Arc<Self>) -> bool {
        let participants = self.participants();
        let registry = self.tracks();
        let mut clean = true;

        for session in participants {
            match self.sync_participant(&session, &registry).await {
                Ok(ParticipantSync::Offered) => {
                    debug!(room_id = %self.id, peer_id = %session.peer_id, "Offer sent");
                }
                Ok(ParticipantSync::Unchanged | ParticipantSync::Queued) => {}
                Err(SfuError::ConnectionClosed) => {
                    info!(
                        room_id = %self.id,
                        peer_id = %session.peer_id,
                        "Removing closed participant"
                    );
                    if self.detach(&session) {
                        self.broadcast_access().await;
                    }
                    session.close().await;
                    // the registry snapshot is stale now
                    clean = false;
                }
                Err(e) if e.is_transient() => {
                    debug!(
                        room_id = %self.id,
                        peer_id = %session.peer_id,
                        error = %e,
                        "Participant sync failed"
                    );
                    clean = false;
                }
                Err(e) => {
                    // another pass would fail the same way
                    warn!(
                        room_id = %self.id,
                        peer_id = %session.peer_id,
                        error = %e,
                        "Participant sync failed permanently"
                    );
                }
            }
        }
        clean
    }

    async fn sync_participant(
        &self,
        session: &Arc<ParticipantSession>,
        registry: &[Arc<ForwardTrack>],
    ) -> Result<ParticipantSync> {
        if session.is_terminal() {
            return Err(SfuError::ConnectionClosed);
        }
        if !session.begin_negotiation() {
            return Ok(ParticipantSync::Queued);
        }

        match self.offer_changes(session, registry).await {
            Ok(ParticipantSync::Unchanged) => {
                if session.finish_negotiation() {
                    // someone asked for a sync while we were diffing
                    return Err(SfuError::Negotiation(
                        "sync requested during diff".to_string(),
                    ));
                }
                Ok(ParticipantSync::Unchanged)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                session.abort_negotiation();
                Err(e)
            }
        }
    }

    async fn offer_changes(
        &self,
        session: &Arc<ParticipantSession>,
        registry: &[Arc<ForwardTrack>],
    ) -> Result<ParticipantSync> {
        let peer = session.peer();
        let senders = peer.senders().await;
        let inbound = peer.receivers().await;
        let plan = SyncPlan::compute(&session.peer_id, &senders, &inbound, registry);

        if plan.is_empty() && !session.needs_offer() {
            return Ok(ParticipantSync::Unchanged);
        }

        for track_id in &plan.stale {
            peer.remove_track(track_id).await?;
        }
        for track in &plan.missing {
            peer.add_track(Arc::clone(&track.local)).await?;
        }

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        session.send(&SignalMessage::Offer(SdpPayload::from(offer))).await?;
        session.record_offer_sent();

        debug!(
            room_id = %self.id,
            peer_id = %session.peer_id,
            removed = plan.stale.len(),
            added = plan.missing.len(),
            "Renegotiating participant"
        );
        Ok(ParticipantSync::Offered)
    }

    /// Apply a client's answer to our outstanding offer. A sync requested
    /// while the offer was outstanding runs afterwards, and so does one
    /// after a rejected answer. An answer with no sent offer to match is
    /// dropped without touching the peer or the negotiation flags.
    pub async fn apply_answer(
        self: &Arc<Self>,
        session: &Arc<ParticipantSession>,
        answer: SessionDescription,
    ) -> Result<()> {
        if !session.awaiting_answer() {
            return Err(SfuError::InvalidMessage(
                "answer without an outstanding offer".to_string(),
            ));
        }
        let applied = session.peer().set_remote_description(answer).await;
        let requested = match &applied {
            Ok(()) => session.finish_negotiation(),
            Err(e) => {
                warn!(peer_id = %session.peer_id, error = %e, "Rejected answer");
                session.abort_negotiation();
                true
            }
        };
        if requested {
            self.sync().await;
        }
        applied
    }

    /// Answer a client-initiated offer, then renegotiate the rest of the
    /// room so they pick up whatever the client publishes.
    pub async fn accept_offer(
        self: &Arc<Self>,
        session: &Arc<ParticipantSession>,
        offer: SessionDescription,
    ) -> Result<()> {
        if !session.begin_remote_negotiation() {
            return Err(SfuError::Negotiation(
                "offer collided with an outstanding server offer".to_string(),
            ));
        }

        let answered = async {
            let peer = session.peer();
            peer.set_remote_description(offer).await?;
            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            session.send(&SignalMessage::Answer(SdpPayload::from(answer))).await
        }
        .await;

        match answered {
            Ok(()) => {
                session.finish_negotiation();
                self.sync().await;
                Ok(())
            }
            Err(e) => {
                session.abort_negotiation();
                Err(e)
            }
        }
    }
}
