use utoipa::OpenApi;

use crate::routes;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Causeway API",
        description = "Donation checkout and payment webhook reconciliation"
    ),
    paths(
        routes::health::health,
        routes::health::db_health,
        routes::checkout::create_checkout_session,
    ),
    tags(
        (name = "health", description = "Service health"),
        (name = "donations", description = "Donation checkout"),
    )
)]
pub struct ApiDoc;
