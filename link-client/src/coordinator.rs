// link-client/src/coordinator.rs
use common::messages::{ClientFrame, ServerFrame};
use common::models::challenge::Challenge;
use common::models::proof::{TonAccount, TonProof};
use common::LinkConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::channel::{ChannelError, ChannelEvent, SessionChannel, SessionState};
use crate::signer::{SignerError, WalletSigner};

// How many stale or expired challenges to replace before giving up
const MAX_CHALLENGE_REFRESHES: u32 = 3;

/// Terminal outcome of one linking handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkResult {
    Linked { address: String },
    Rejected { reason: String },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("a linking attempt is already in flight")]
    AlreadyInFlight,
    #[error("session channel is not authenticated")]
    NotAuthenticated,
    #[error("connection lost during the handshake")]
    ChannelClosed,
    #[error("link server fault: {0}")]
    ServerFault(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Drives one wallet-ownership handshake: obtain a challenge, hand it to the
/// wallet signer, submit the resulting proof, await the verdict. Owns the
/// in-flight challenge/proof pair and never keeps either past one handshake.
pub struct ProofCoordinator {
    channel: Arc<SessionChannel>,
    signer: Arc<dyn WalletSigner>,
    challenge_ttl: Duration,
    response_timeout: Duration,
    in_flight: Mutex<()>,
}

impl ProofCoordinator {
    pub fn new(channel: Arc<SessionChannel>, signer: Arc<dyn WalletSigner>) -> Self {
        Self {
            channel,
            signer,
            challenge_ttl: Duration::from_secs(1200),
            response_timeout: Duration::from_secs(30),
            in_flight: Mutex::new(()),
        }
    }

    pub fn from_config(
        channel: Arc<SessionChannel>,
        signer: Arc<dyn WalletSigner>,
        link: &LinkConfig,
    ) -> Self {
        Self::new(channel, signer)
            .with_challenge_ttl(Duration::from_secs(link.challenge_ttl_secs))
            .with_response_timeout(Duration::from_secs(link.response_timeout_secs))
    }

    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Run one linking handshake to its terminal outcome.
    ///
    /// At most one challenge is outstanding per coordinator: a second call
    /// while one handshake is in flight is rejected, not run concurrently.
    pub async fn request_link(&self) -> Result<LinkResult, LinkError> {
        let _guard = self.in_flight.try_lock().map_err(|_| LinkError::AlreadyInFlight)?;

        if self.channel.current_state() != SessionState::Authenticated {
            return Err(LinkError::NotAuthenticated);
        }

        let mut refreshes: u32 = 0;
        loop {
            let challenge = match self.fetch_challenge().await? {
                Fetch::Delivered(challenge) => challenge,
                Fetch::Stale => {
                    refreshes += 1;
                    if refreshes > MAX_CHALLENGE_REFRESHES {
                        return Ok(LinkResult::TimedOut);
                    }
                    tracing::info!("Discarded stale challenge; requesting a fresh one");
                    continue;
                }
                Fetch::Unavailable(reason) => return Ok(LinkResult::Rejected { reason }),
                Fetch::TimedOut => return Ok(LinkResult::TimedOut),
            };

            // The signer may take minutes; a dead connection aborts the wait
            // instead of leaving the handshake parked forever
            let mut events = self.channel.events();
            let proof = tokio::select! {
                result = self.signer.request_proof(&challenge) => match result {
                    Ok(proof) => proof,
                    Err(SignerError::Cancelled) => {
                        tracing::info!("Wallet signer cancelled the request");
                        return Ok(LinkResult::Cancelled);
                    }
                    Err(SignerError::Failed(reason)) => {
                        tracing::warn!("Wallet signer failed: {}", reason);
                        return Ok(LinkResult::Rejected { reason });
                    }
                },
                _ = watch_for_drop(&mut events) => return Err(LinkError::ChannelClosed),
            };

            // TTL check at the moment of submission: a proof bound to an
            // expired challenge is discarded together with the challenge
            if challenge.is_expired() {
                refreshes += 1;
                if refreshes > MAX_CHALLENGE_REFRESHES {
                    return Ok(LinkResult::TimedOut);
                }
                tracing::info!("Challenge expired while awaiting the signer; discarding its proof");
                continue;
            }

            return self.submit_proof(&challenge, proof).await;
        }
    }

    async fn fetch_challenge(&self) -> Result<Fetch, LinkError> {
        // Subscribe before sending so a fast reply cannot be missed
        let mut events = self.channel.events();
        let requested_at = Instant::now();
        self.channel.send(ClientFrame::GetTonProof)?;

        let deadline = tokio::time::sleep(self.response_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(Fetch::TimedOut),

                event = events.recv() => match event {
                    Ok(ChannelEvent::Frame(ServerFrame::TonProof { payload })) => {
                        // Age is measured from the request send instant
                        let challenge = Challenge::issued(payload, requested_at, self.challenge_ttl);
                        if challenge.is_expired() {
                            return Ok(Fetch::Stale);
                        }
                        return Ok(Fetch::Delivered(challenge));
                    }
                    Ok(ChannelEvent::Frame(ServerFrame::ErrorProof { message })) => {
                        return Ok(Fetch::Unavailable(message));
                    }
                    Ok(ChannelEvent::ServerError(envelope)) => {
                        return Err(LinkError::ServerFault(envelope.error));
                    }
                    Ok(ChannelEvent::Disconnected) => return Err(LinkError::ChannelClosed),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} channel events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(LinkError::ChannelClosed),
                }
            }
        }
    }

    async fn submit_proof(
        &self,
        challenge: &Challenge,
        proof: TonProof,
    ) -> Result<LinkResult, LinkError> {
        let account = TonAccount::from_proof(&proof);
        let address = account.address.clone();
        let frame = ClientFrame::Verify { account, proof };

        let mut events = self.channel.events();
        self.channel.send(frame.clone())?;
        tracing::info!("Submitted wallet proof for address: {}", address);

        let mut resubmitted = false;
        loop {
            match self.await_verdict(&mut events).await? {
                Verdict::Accepted => {
                    tracing::info!("Wallet linked: {}", address);
                    return Ok(LinkResult::Linked { address });
                }
                Verdict::Rejected(reason) => {
                    // Terminal for this challenge; any retry starts with a
                    // fresh one and the same proof is never resubmitted
                    tracing::warn!("Wallet proof rejected: {}", reason);
                    return Ok(LinkResult::Rejected { reason });
                }
                Verdict::TimedOut => return Ok(LinkResult::TimedOut),
                Verdict::ConnectionLost => {
                    // One resubmission with the same proof, and only while
                    // the challenge is still fresh
                    if resubmitted || challenge.is_expired() {
                        return Err(LinkError::ChannelClosed);
                    }
                    resubmitted = true;
                    self.await_reauthentication().await?;
                    tracing::info!("Resubmitting wallet proof after reconnect");
                    self.channel.send(frame.clone())?;
                }
            }
        }
    }

    async fn await_verdict(
        &self,
        events: &mut broadcast::Receiver<ChannelEvent>,
    ) -> Result<Verdict, LinkError> {
        let deadline = tokio::time::sleep(self.response_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(Verdict::TimedOut),

                event = events.recv() => match event {
                    Ok(ChannelEvent::Frame(ServerFrame::Verify { ok: true, .. })) => {
                        return Ok(Verdict::Accepted);
                    }
                    Ok(ChannelEvent::Frame(ServerFrame::Verify { ok: false, error })) => {
                        let reason = error.unwrap_or_else(|| "verification rejected".to_string());
                        return Ok(Verdict::Rejected(reason));
                    }
                    Ok(ChannelEvent::ServerError(envelope)) => {
                        return Err(LinkError::ServerFault(envelope.error));
                    }
                    Ok(ChannelEvent::Disconnected) => return Ok(Verdict::ConnectionLost),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} channel events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(LinkError::ChannelClosed),
                }
            }
        }
    }

    async fn await_reauthentication(&self) -> Result<(), LinkError> {
        let mut state = self.channel.state();
        let wait = async {
            loop {
                match *state.borrow_and_update() {
                    SessionState::Authenticated => return Ok(()),
                    SessionState::Failed => return Err(LinkError::ChannelClosed),
                    _ => {}
                }
                if state.changed().await.is_err() {
                    return Err(LinkError::ChannelClosed);
                }
            }
        };

        match tokio::time::timeout(self.response_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::ChannelClosed),
        }
    }
}

enum Fetch {
    Delivered(Challenge),
    /// Delivered after its freshness window already closed
    Stale,
    Unavailable(String),
    TimedOut,
}

enum Verdict {
    Accepted,
    Rejected(String),
    TimedOut,
    ConnectionLost,
}

// Resolves once the connection backing the current handshake is gone
async fn watch_for_drop(events: &mut broadcast::Receiver<ChannelEvent>) {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Disconnected) | Ok(ChannelEvent::ServerError(_)) => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Closed) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use async_trait::async_trait;

    struct NeverSigner;

    #[async_trait]
    impl WalletSigner for NeverSigner {
        async fn request_proof(&self, _challenge: &Challenge) -> Result<TonProof, SignerError> {
            Err(SignerError::Cancelled)
        }
    }

    #[tokio::test]
    async fn refuses_to_run_without_authentication() {
        let channel = Arc::new(
            SessionChannel::new(ChannelConfig::new(
                "ws://127.0.0.1:9".to_string(),
                "user_id=42&hash=aa".to_string(),
            ))
            .unwrap(),
        );
        let coordinator = ProofCoordinator::new(channel, Arc::new(NeverSigner));

        let result = coordinator.request_link().await;
        assert!(matches!(result, Err(LinkError::NotAuthenticated)));
    }
}
