use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use config::Config;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};
use transform::MessageTransform;

pub mod api;
pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod message;
pub mod migration;
pub mod processor;
pub mod service;
pub mod timestamp;
pub mod transform;

const MAX_REQUEST_SIZE: usize = 16 * 1024 * 1024;

/// Returns a builder for the main application.
#[bon::builder(finish_fn = start)]
pub async fn run(transform: Option<Arc<dyn MessageTransform>>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("HL7_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("HL7_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;
    let bind = (config.host().to_owned(), config.port());
    let drain_interval = config.drain_interval();

    let service = service::Service::connect_with()
        .config(config)
        .maybe_transform(transform)
        .call()
        .await?;

    let data = Data::new(service);
    let server_data = data.clone();

    if let Some(period) = drain_interval {
        let service = data.clone().into_inner();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                if let Err(e) = service.drain_queue().await {
                    tracing::error!(error = %e, "scheduled queue drain failed");
                }
            }
        });
    }

    tracing::info!(host = %bind.0, port = bind.1, "starting server");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_header()
            .allow_any_method();

        let json_cfg = JsonConfig::default()
            .content_type_required(false)
            .limit(MAX_REQUEST_SIZE);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(cors)
            .service(api::queue::service())
            .service(api::archive::service())
            .service(api::errors::service())
            .service(api::items::service())
            .service(api::sources::service())
            .service(api::migration::service())
            .app_data(server_data.clone())
            .app_data(json_cfg)
    })
    .bind(bind)?
    .run()
    .await?;

    let status = data.shutdown_migration().await?;
    tracing::debug!(%status, "archive migration shut down");

    Ok(())
}
