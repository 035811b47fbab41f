use actix_web::{
    get,
    web::{self, Json},
    Scope,
};
use uuid::Uuid;

use crate::{error::Error, message::QueueItem, service::Service};

#[get("/{uuid}")]
async fn get_item(
    service: web::Data<Service>,
    path: web::Path<Uuid>,
) -> Result<Json<QueueItem>, Error> {
    let uuid = path.into_inner();

    service
        .get_item(uuid)
        .await?
        .map(Json)
        .ok_or_else(|| Error::item_not_found(uuid))
}

pub fn service() -> Scope {
    web::scope("/items").service(get_item)
}
