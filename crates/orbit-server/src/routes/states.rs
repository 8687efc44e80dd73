//! `GET /states`.

use orbit_core::{BoxError, HttpMethod, InboundRequest, Json, SyncRoute};

pub const ID: &str = "GET_STATES";
pub const PATH: &str = "/states";

async fn extract(_request: InboundRequest) -> Result<Vec<&'static str>, BoxError> {
    Ok(vec!["Tamil Nadu", "Kerala", "Andra Pradesh"])
}

async fn respond(states: Vec<&'static str>) -> Result<Json<Vec<&'static str>>, BoxError> {
    Ok(Json(states))
}

pub fn route() -> SyncRoute<Vec<&'static str>, Vec<&'static str>, Json<Vec<&'static str>>> {
    SyncRoute::builder(ID, HttpMethod::Get, PATH)
        .description("List supported states")
        .extract(extract)
        .respond(respond)
}
