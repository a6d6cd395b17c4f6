// verify-server/src/api/mod.rs
pub mod validate;

pub fn configure(cfg: &mut actix_web::web::ServiceConfig) {
    cfg.service(
        actix_web::web::scope("/api")
            .service(validate::api_index)
            .service(validate::validate_initdata)
            .service(validate::auth)
    );
}
