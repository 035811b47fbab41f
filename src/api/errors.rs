use actix_web::{
    delete, get, post,
    web::{self, Json},
    HttpResponse, Responder, Scope,
};
use uuid::Uuid;

use crate::{
    db::{ListQuery, Page},
    error::Error,
    message::{ErrorRecord, PendingEntry},
    service::Service,
};

#[get("")]
async fn list_errors(
    service: web::Data<Service>,
    query: web::Query<ListQuery>,
) -> Result<Json<Page<ErrorRecord>>, Error> {
    service.list_errors(&query).await.map(Json)
}

#[delete("/{uuid}")]
async fn purge_error(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
) -> Result<impl Responder, Error> {
    service.purge_error(path.into_inner()).await?;

    Ok(HttpResponse::Ok())
}

#[post("/{uuid}/requeue")]
async fn requeue_error(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
) -> Result<Json<PendingEntry>, Error> {
    service.requeue_error(path.into_inner()).await.map(Json)
}

pub fn service() -> Scope {
    web::scope("/errors")
        .service(list_errors)
        .service(purge_error)
        .service(requeue_error)
}
