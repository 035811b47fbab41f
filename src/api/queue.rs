use actix_web::{
    get, post,
    web::{self, Json},
    Scope,
};
use serde::{Deserialize, Serialize};

use crate::{
    db::{ListQuery, Page},
    error::Error,
    message::PendingEntry,
    service::Service,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Name of the source system
    pub source: String,
    pub source_key: Option<String>,
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DrainResponse {
    pub processed: usize,
}

#[get("")]
async fn list_pending(
    service: web::Data<Service>,
    query: web::Query<ListQuery>,
) -> Result<Json<Page<PendingEntry>>, Error> {
    service.list_pending(&query).await.map(Json)
}

#[post("")]
async fn enqueue(
    service: web::Data<Service>,
    data: web::Json<EnqueueRequest>,
) -> Result<Json<PendingEntry>, Error> {
    let EnqueueRequest {
        source,
        source_key,
        payload,
    } = data.into_inner();

    service.enqueue(source, source_key, payload).await.map(Json)
}

#[post("/drain")]
async fn drain(service: web::Data<Service>) -> Result<Json<DrainResponse>, Error> {
    let service = service.into_inner();

    // Finishes the drain even if the client disconnects.
    let processed = tokio::spawn(async move { service.drain_queue().await })
        .await
        .map_err(Error::internal)??;

    Ok(Json(DrainResponse { processed }))
}

pub fn service() -> Scope {
    web::scope("/queue")
        .service(list_pending)
        .service(enqueue)
        .service(drain)
}
