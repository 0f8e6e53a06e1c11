// src/main.rs

mod ai;
mod app_state;
mod auth;
mod config;
mod db;
mod errors;
mod execution;
mod invitations;
mod middleware;
mod models;
mod project;
mod project_hub;
mod routes;
mod user_management;
mod web_socket_server;

use std::io;
use std::sync::Arc;

use actix::Actor;
use actix_cors::Cors;
use actix_web::{http, middleware::Logger, web, App, HttpServer};
use env_logger::Env;
use log::{error, info};

use crate::ai::AiService;
use crate::app_state::AppState;
use crate::auth::TokenBlacklist;
use crate::config::Config;
use crate::db::MongoDB;
use crate::execution::CodeRunner;
use crate::middleware::Authentication;
use crate::project_hub::ProjectHub;

fn startup_error(context: &str, err: impl std::fmt::Display) -> io::Error {
    error!("{}: {}", context, err);
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, err))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::from_env().map_err(|e| startup_error("Invalid configuration", e))?;

    let mongodb = MongoDB::init(&config.mongo_uri, &config.database_name)
        .await
        .map_err(|e| startup_error("Could not set up MongoDB client", e))?;
    mongodb
        .ensure_indexes()
        .await
        .map_err(|e| startup_error("Could not create MongoDB indexes", e))?;

    let ai = AiService::from_config(&config.ai)
        .map_err(|e| startup_error("Could not build AI client", e))?;

    let state = web::Data::new(AppState {
        hub: ProjectHub::new().start(),
        mongodb: Arc::new(mongodb),
        runner: CodeRunner::new(config.exec_timeout, config.exec_max_output_bytes),
        revoked_tokens: TokenBlacklist::default(),
        ai: Arc::new(ai),
        config: config.clone(),
    });

    info!("Server running at http://{}", config.bind_addr);
    info!("Allowed CORS Origin: {}", config.frontend_origin);

    let frontend_origin = config.frontend_origin.clone();
    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend_origin)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(Authentication)
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(routes::configure)
    })
    .bind(&config.bind_addr)?
    .run()
    .await
}
