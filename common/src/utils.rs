// common/src/utils.rs
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use jsonwebtoken::{encode, decode, Header, Algorithm, Validation, EncodingKey, DecodingKey};
use serde::{Serialize, Deserialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Setup tracing for consistent logging across services
pub fn setup_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,                  // platform user id
    pub username: Option<String>,
    pub exp: usize,                   // expiration time
    pub iat: usize,                   // issued at time
}

// Generate JWT token for an authenticated platform user
pub fn generate_jwt_token(
    user_id: i64,
    username: Option<&str>,
    ttl_secs: usize,
    secret: &[u8],
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs() as usize;

    let claims = JwtClaims {
        sub: user_id.to_string(),
        username: username.map(|name| name.to_string()),
        iat: now,
        exp: now + ttl_secs,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret)
    )
}

// Validate JWT token and extract the platform user id and username
pub fn validate_jwt_token(
    token: &str,
    secret: &[u8],
) -> Result<(i64, Option<String>), jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);

    let token_data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(secret),
        &validation
    )?;

    let user_id = token_data.claims.sub.parse::<i64>()
        .map_err(|_| jsonwebtoken::errors::ErrorKind::InvalidSubject)?;

    Ok((user_id, token_data.claims.username))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_round_trip() {
        let token = generate_jwt_token(42, Some("ada"), 3600, b"secret").unwrap();
        let (user_id, username) = validate_jwt_token(&token, b"secret").unwrap();
        assert_eq!(user_id, 42);
        assert_eq!(username.as_deref(), Some("ada"));
    }

    #[test]
    fn jwt_rejects_wrong_secret() {
        let token = generate_jwt_token(42, None, 3600, b"secret").unwrap();
        assert!(validate_jwt_token(&token, b"other").is_err());
    }
}
