// common/src/models/user.rs
use serde::{Deserialize, Serialize};

/// User profile embedded in the identity assertion's `user` field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthUser {
    /// Numeric platform user identifier
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub language_code: Option<String>,
    pub photo_url: Option<String>,
}
