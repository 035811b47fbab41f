use actix_web::{
    delete, get, post,
    web::{self, Json},
    HttpResponse, Responder, Scope,
};
use serde::{Deserialize, Serialize};

use crate::{error::Error, message::Source, service::Service};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSourceRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RetireSourceRequest {
    pub reason: Option<String>,
}

#[get("")]
async fn list_sources(service: web::Data<Service>) -> Result<Json<Vec<Source>>, Error> {
    service.list_sources().await.map(Json)
}

#[post("")]
async fn create_source(
    service: web::Data<Service>,
    data: web::Json<CreateSourceRequest>,
) -> Result<Json<Source>, Error> {
    service
        .create_source(&data.name, data.description.as_deref())
        .await
        .map(Json)
}

#[post("/{id}/retire")]
async fn retire_source(
    service: web::Data<Service>,
    path: web::Path<i64>,
    data: Option<web::Json<RetireSourceRequest>>,
) -> Result<Json<Source>, Error> {
    let reason = data.and_then(|d| d.into_inner().reason);

    service
        .retire_source(path.into_inner(), reason.as_deref())
        .await
        .map(Json)
}

#[delete("/{id}")]
async fn purge_source(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    service.purge_source(path.into_inner()).await?;

    Ok(HttpResponse::Ok())
}

pub fn service() -> Scope {
    web::scope("/sources")
        .service(list_sources)
        .service(create_source)
        .service(retire_source)
        .service(purge_source)
}
