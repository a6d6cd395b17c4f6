// verify-server/src/api/validate.rs
use actix_web::{get, post, web, HttpResponse, Responder};
use common::initdata::{self, VerifyFailure};
use common::{generate_jwt_token, Config};
use serde_json::json;

#[get("/")]
pub async fn api_index() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "name": "Wallet Link Platform API",
        "version": "0.1.0"
    }))
}

// Stateless identity-assertion verification
#[post("/validate-initdata")]
pub async fn validate_initdata(
    body: web::Json<serde_json::Value>,
    config: web::Data<Config>,
) -> impl Responder {
    let init_data = match extract_init_data(&body) {
        Some(init_data) => init_data,
        None => return invalid_init_data(),
    };

    verification_response(init_data, &config)
        .unwrap_or_else(|| HttpResponse::Ok().json(json!({ "ok": true })))
}

// Verify the assertion, then issue a session token for the embedded user
#[post("/auth")]
pub async fn auth(
    body: web::Json<serde_json::Value>,
    config: web::Data<Config>,
) -> impl Responder {
    let init_data = match extract_init_data(&body) {
        Some(init_data) => init_data,
        None => return invalid_init_data(),
    };

    if let Some(rejection) = verification_response(init_data, &config) {
        return rejection;
    }

    // Signed but stale assertions are rejected once the age window is on
    if config.link.auth_max_age_secs > 0 {
        let fresh = initdata::parse_field(init_data, "auth_date")
            .and_then(|value| value.parse::<i64>().ok())
            .map(|auth_date| {
                chrono::Utc::now().timestamp() - auth_date <= config.link.auth_max_age_secs
            })
            .unwrap_or(false);

        if !fresh {
            tracing::warn!("Rejected auth with stale or missing auth_date");
            return HttpResponse::Forbidden().json(json!({
                "ok": false,
                "error": "initData expired"
            }));
        }
    }

    let user = match initdata::parse_auth_user(init_data) {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!("Verified assertion carries no usable user field: {}", e);
            return invalid_init_data();
        }
    };

    match generate_jwt_token(
        user.id,
        user.username.as_deref(),
        config.link.jwt_ttl_secs,
        config.jwt_secret.as_bytes(),
    ) {
        Ok(token) => {
            tracing::info!("Issued session token for user: {}", user.id);
            HttpResponse::Ok().json(json!({
                "ok": true,
                "token": token,
                "user": user
            }))
        },
        Err(e) => {
            tracing::error!("Failed to issue session token: {}", e);
            HttpResponse::InternalServerError().json(json!({
                "ok": false,
                "error": "Internal server error"
            }))
        }
    }
}

// The body must carry a non-empty string under "initData"
fn extract_init_data(body: &serde_json::Value) -> Option<&str> {
    body.get("initData")
        .and_then(|value| value.as_str())
        .filter(|init_data| !init_data.is_empty())
}

fn invalid_init_data() -> HttpResponse {
    HttpResponse::BadRequest().json(json!({
        "ok": false,
        "error": "Invalid initData"
    }))
}

// None means the assertion verified; Some carries the error response
fn verification_response(init_data: &str, config: &Config) -> Option<HttpResponse> {
    let result = initdata::verify(init_data, &config.bot_token);
    if result.valid {
        return None;
    }

    let response = match result.reason {
        Some(VerifyFailure::InvalidHash) => {
            tracing::warn!("initData signature mismatch");
            HttpResponse::Forbidden().json(json!({
                "ok": false,
                "error": "Invalid data hash"
            }))
        },
        Some(VerifyFailure::ServerMisconfigured) => {
            tracing::error!("Bot credential is not set");
            HttpResponse::InternalServerError().json(json!({
                "ok": false,
                "error": "Server configuration error"
            }))
        },
        _ => invalid_init_data(),
    };

    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use hmac::{Hmac, Mac};
    use sha2::{Digest, Sha256};

    const BOT_TOKEN: &str = "botsecret";

    fn signed_assertion(fields: &[(&str, &str)], secret: &str) -> String {
        let mut sorted: Vec<(&str, &str)> = fields.to_vec();
        sorted.sort();
        let canonical = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("\n");

        let secret_key = Sha256::digest(secret.as_bytes());
        let mut mac = Hmac::<Sha256>::new_from_slice(&secret_key).unwrap();
        mac.update(canonical.as_bytes());
        let hash = hex::encode(mac.finalize().into_bytes());

        let mut pairs: Vec<String> = fields.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        pairs.push(format!("hash={}", hash));
        pairs.join("&")
    }

    fn test_config(bot_token: &str) -> Config {
        Config {
            bot_token: bot_token.to_string(),
            ..Config::default()
        }
    }

    async fn call(
        config: Config,
        path: &str,
        body: serde_json::Value,
    ) -> (u16, serde_json::Value) {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(config))
                .configure(crate::api::configure),
        )
        .await;

        let req = test::TestRequest::post().uri(path).set_json(body).to_request();
        let resp = test::call_service(&app, req).await;
        let status = resp.status().as_u16();
        let json: serde_json::Value = test::read_body_json(resp).await;
        (status, json)
    }

    #[actix_web::test]
    async fn accepts_valid_assertion() {
        let assertion = signed_assertion(&[("auth_date", "1700000000"), ("user_id", "42")], BOT_TOKEN);
        let (status, body) =
            call(test_config(BOT_TOKEN), "/api/validate-initdata", json!({ "initData": assertion })).await;
        assert_eq!(status, 200);
        assert_eq!(body["ok"], json!(true));
    }

    #[actix_web::test]
    async fn tampered_assertion_is_forbidden() {
        let assertion = signed_assertion(&[("auth_date", "1700000000"), ("user_id", "42")], BOT_TOKEN);
        let tampered = assertion.replacen("42", "43", 1);
        let (status, body) =
            call(test_config(BOT_TOKEN), "/api/validate-initdata", json!({ "initData": tampered })).await;
        assert_eq!(status, 403);
        assert_eq!(body["error"], json!("Invalid data hash"));
    }

    #[actix_web::test]
    async fn missing_init_data_is_bad_request() {
        let (status, body) =
            call(test_config(BOT_TOKEN), "/api/validate-initdata", json!({})).await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], json!("Invalid initData"));

        let (status, _) =
            call(test_config(BOT_TOKEN), "/api/validate-initdata", json!({ "initData": "" })).await;
        assert_eq!(status, 400);
    }

    #[actix_web::test]
    async fn assertion_without_hash_is_bad_request() {
        let (status, body) = call(
            test_config(BOT_TOKEN),
            "/api/validate-initdata",
            json!({ "initData": "auth_date=1700000000" }),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["error"], json!("Invalid initData"));
    }

    #[actix_web::test]
    async fn unset_credential_is_a_server_error() {
        let assertion = signed_assertion(&[("auth_date", "1700000000")], BOT_TOKEN);
        let (status, body) =
            call(test_config(""), "/api/validate-initdata", json!({ "initData": assertion })).await;
        assert_eq!(status, 500);
        assert_eq!(body["error"], json!("Server configuration error"));
    }

    #[actix_web::test]
    async fn non_post_method_is_rejected() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_config(BOT_TOKEN)))
                .configure(crate::api::configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/validate-initdata").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 405);
    }

    #[actix_web::test]
    async fn auth_issues_a_token_for_the_embedded_user() {
        let now = chrono::Utc::now().timestamp().to_string();
        let assertion = signed_assertion(
            &[
                ("auth_date", now.as_str()),
                ("user", r#"{"id":42,"first_name":"Ada","username":"ada"}"#),
            ],
            BOT_TOKEN,
        );
        let config = test_config(BOT_TOKEN);
        let jwt_secret = config.jwt_secret.clone();

        let (status, body) = call(config, "/api/auth", json!({ "initData": assertion })).await;
        assert_eq!(status, 200);
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["user"]["id"], json!(42));

        let token = body["token"].as_str().unwrap();
        let (user_id, username) =
            common::validate_jwt_token(token, jwt_secret.as_bytes()).unwrap();
        assert_eq!(user_id, 42);
        assert_eq!(username.as_deref(), Some("ada"));
    }

    #[actix_web::test]
    async fn auth_rejects_stale_assertions() {
        let assertion = signed_assertion(
            &[
                ("auth_date", "1500000000"),
                ("user", r#"{"id":42}"#),
            ],
            BOT_TOKEN,
        );
        let (status, body) =
            call(test_config(BOT_TOKEN), "/api/auth", json!({ "initData": assertion })).await;
        assert_eq!(status, 403);
        assert_eq!(body["error"], json!("initData expired"));
    }
}
