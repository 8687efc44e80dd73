//! `GET /countries`.

use orbit_core::{BoxError, HttpMethod, InboundRequest, Json, SyncRoute};

pub const ID: &str = "GET_COUNTRIES";
pub const PATH: &str = "/countries";

async fn extract(_request: InboundRequest) -> Result<Vec<&'static str>, BoxError> {
    Ok(vec!["india", "usa", "uk"])
}

async fn respond(countries: Vec<&'static str>) -> Result<Json<Vec<&'static str>>, BoxError> {
    Ok(Json(countries))
}

/// Lists the supported countries.
pub fn route() -> SyncRoute<Vec<&'static str>, Vec<&'static str>, Json<Vec<&'static str>>> {
    SyncRoute::builder(ID, HttpMethod::Get, PATH)
        .description("List supported countries")
        .extract(extract)
        .respond(respond)
}
