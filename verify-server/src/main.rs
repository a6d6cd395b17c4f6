// verify-server/src/main.rs
mod api;

use actix_web::{web, App, HttpServer, Responder, HttpResponse, get};
use common::{setup_tracing, Config};

#[get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("Wallet Link Platform Verify Server")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Setup tracing
    setup_tracing();

    // Load configuration
    let config = Config::from_env();

    if config.bot_token.is_empty() {
        tracing::warn!("Bot credential is not configured; verification requests will fail");
    }

    // Save address before moving config into web::Data
    let server_addr = config.verify_server_addr.clone();

    tracing::info!("Starting Verify Server on {}", server_addr);

    // Create data reference
    let config_data = web::Data::new(config);

    // Start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(config_data.clone())
            .service(index)
            .configure(api::configure)
    })
    .bind(&server_addr)?
    .run()
    .await
}
