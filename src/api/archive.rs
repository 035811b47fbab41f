use actix_web::{
    get,
    web::{self, Json},
    Scope,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    db::{ListQuery, Page},
    error::Error,
    message::ArchivedMessage,
    service::Service,
};

#[derive(Debug, Default, Deserialize)]
pub struct ArchiveQuery {
    /// Load the payload back from the filesystem if it was migrated
    #[serde(default)]
    pub hydrate: bool,
}

#[get("")]
async fn list_archives(
    service: web::Data<Service>,
    query: web::Query<ListQuery>,
) -> Result<Json<Page<ArchivedMessage>>, Error> {
    service.list_archives(&query).await.map(Json)
}

#[get("/{uuid}")]
async fn get_archive(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
    query: web::Query<ArchiveQuery>,
) -> Result<Json<ArchivedMessage>, Error> {
    service
        .get_archive(path.into_inner(), query.hydrate)
        .await
        .map(Json)
}

pub fn service() -> Scope {
    web::scope("/archive")
        .service(list_archives)
        .service(get_archive)
}
