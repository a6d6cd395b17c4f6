// link-client/src/signer.rs
use async_trait::async_trait;
use common::models::challenge::Challenge;
use common::models::proof::TonProof;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SignerError {
    /// The user declined in the wallet; a normal terminal outcome
    #[error("signing was cancelled")]
    Cancelled,
    #[error("signer failed: {0}")]
    Failed(String),
}

/// External wallet-signing capability supplied by the host environment.
///
/// The handshake hands over the exact challenge payload and expects back a
/// proof bound to it; nothing else is assumed about the wallet. The call may
/// take minutes while a human interacts with the wallet app, so callers must
/// keep the wait cancellable.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    async fn request_proof(&self, challenge: &Challenge) -> Result<TonProof, SignerError>;
}
