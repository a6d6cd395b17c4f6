// common/src/messages.rs
use serde::{Deserialize, Serialize};

use crate::models::proof::{TonAccount, TonProof};

/// Messages the client sends over the persistent connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        #[serde(rename = "initData")]
        init_data: String,
    },
    GetTonProof,
    Verify {
        account: TonAccount,
        proof: TonProof,
    },
}

/// Messages the server sends back
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Authentication verdict for a previously sent `auth`
    Auth { ok: bool },
    /// Challenge payload delivery
    TonProof { payload: String },
    /// The backend could not issue a challenge
    ErrorProof { message: String },
    /// Verification verdict for a submitted proof
    Verify {
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Generic server error envelope, sent without a `type` discriminator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    pub code: i64,
    pub error: String,
}

impl ErrorEnvelope {
    /// Code 1 with an unauthorized message means the session must re-send
    /// its identity assertion
    pub fn is_unauthorized(&self) -> bool {
        self.code == 1 && self.error.to_ascii_lowercase().contains("unauthorized")
    }
}

/// Any message the server can deliver
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Incoming {
    Frame(ServerFrame),
    Error(ErrorEnvelope),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_frame_uses_wire_field_names() {
        let frame = ClientFrame::Auth { init_data: "user_id=42".to_string() };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"auth""#));
        assert!(json.contains(r#""initData":"user_id=42""#));
    }

    #[test]
    fn challenge_request_is_bare() {
        let json = serde_json::to_string(&ClientFrame::GetTonProof).unwrap();
        assert_eq!(json, r#"{"type":"get_ton_proof"}"#);
    }

    #[test]
    fn parses_challenge_delivery() {
        let incoming: Incoming =
            serde_json::from_str(r#"{"type":"ton_proof","payload":"abc"}"#).unwrap();
        assert_eq!(
            incoming,
            Incoming::Frame(ServerFrame::TonProof { payload: "abc".to_string() })
        );
    }

    #[test]
    fn parses_bare_error_envelope() {
        let incoming: Incoming =
            serde_json::from_str(r#"{"code":1,"error":"Unauthorized access"}"#).unwrap();
        match incoming {
            Incoming::Error(envelope) => assert!(envelope.is_unauthorized()),
            other => panic!("expected error envelope, got {:?}", other),
        }
    }

    #[test]
    fn non_auth_errors_are_not_unauthorized() {
        let envelope = ErrorEnvelope { code: 2, error: "Malformed request".to_string() };
        assert!(!envelope.is_unauthorized());

        let wrong_code = ErrorEnvelope { code: 7, error: "Unauthorized".to_string() };
        assert!(!wrong_code.is_unauthorized());
    }

    #[test]
    fn verify_verdict_error_is_optional() {
        let ok: Incoming = serde_json::from_str(r#"{"type":"verify","ok":true}"#).unwrap();
        assert_eq!(ok, Incoming::Frame(ServerFrame::Verify { ok: true, error: None }));

        let rejected: Incoming =
            serde_json::from_str(r#"{"type":"verify","ok":false,"error":"proof expired"}"#)
                .unwrap();
        assert_eq!(
            rejected,
            Incoming::Frame(ServerFrame::Verify {
                ok: false,
                error: Some("proof expired".to_string()),
            })
        );
    }
}
