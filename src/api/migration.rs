use actix_web::{
    get, post,
    web::{self, Json},
    Scope,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    migration::{Progress, Status},
    service::Service,
};

#[derive(Debug, Serialize)]
pub struct MigrationResponse {
    pub status: Status,
    pub active: bool,
    #[serde(flatten)]
    pub progress: Progress,
}

impl MigrationResponse {
    fn from_service(service: &Service) -> Self {
        Self {
            status: service.migration_status(),
            active: service.migration_active(),
            progress: service.migration_progress(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StartMigrationRequest {
    pub retention_days: Option<u32>,
    pub batch_size: Option<u32>,
}

#[get("")]
async fn status(service: web::Data<Service>) -> Json<MigrationResponse> {
    Json(MigrationResponse::from_service(&service))
}

#[post("/start")]
async fn start(
    service: web::Data<Service>,
    data: Option<web::Json<StartMigrationRequest>>,
) -> Result<Json<MigrationResponse>, Error> {
    let StartMigrationRequest {
        retention_days,
        batch_size,
    } = data.map(|d| d.into_inner()).unwrap_or_default();

    service.start_migration(retention_days, batch_size)?;

    Ok(Json(MigrationResponse::from_service(&service)))
}

#[post("/stop")]
async fn stop(service: web::Data<Service>) -> Json<MigrationResponse> {
    service.stop_migration();

    Json(MigrationResponse::from_service(&service))
}

pub fn service() -> Scope {
    web::scope("/migration")
        .service(status)
        .service(start)
        .service(stop)
}
