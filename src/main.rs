mod limits;
mod model;
mod prompt;
mod sanitize;
mod web;

use actix_cors::Cors;
use actix_web::{middleware, web::Data, App, HttpServer};
use dotenv::dotenv;
use log::{error, info};
use std::env;

use model::ModelManager;
use web::routes;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    info!("Starting adapter chat service");

    let adapter_dir = env::var("ADAPTER_DIR").unwrap_or_else(|_| "./adapters".to_string());

    // Load the model once; it lives for the whole process.
    let manager = match ModelManager::from_adapter_dir(&adapter_dir) {
        Ok(manager) => {
            info!("Model initialized: {} on {}", manager.base(), manager.device());
            Data::new(manager)
        }
        Err(e) => {
            error!("Failed to initialize model backend: {:#}", e);
            std::process::exit(1);
        }
    };

    // Best-effort warmup; a failure here never blocks serving.
    manager.warmup();

    let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);

    info!("Listening on {}:{}", host, port);

    HttpServer::new(move || {
        App::new()
            .app_data(manager.clone())
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind((host.as_str(), port))?
    .run()
    .await
}
