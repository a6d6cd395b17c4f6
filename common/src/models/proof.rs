// common/src/models/proof.rs
use serde::{Deserialize, Serialize};

/// Wallet proof produced by the external signer in answer to a challenge.
/// Bound 1:1 to the challenge payload it signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TonProof {
    pub address: String,
    pub public_key: String,
    pub wallet_state_init: String,
    pub signature: String,
    pub timestamp: u64,
    pub domain: String,
}

/// Account descriptor submitted alongside a proof
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TonAccount {
    pub address: String,
    pub public_key: String,
    pub wallet_state_init: String,
}

impl TonAccount {
    pub fn from_proof(proof: &TonProof) -> Self {
        Self {
            address: proof.address.clone(),
            public_key: proof.public_key.clone(),
            wallet_state_init: proof.wallet_state_init.clone(),
        }
    }
}
