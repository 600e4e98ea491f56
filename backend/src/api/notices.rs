use log::error;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{post, State};

use crate::models::{SongTaskBody, TopicTaskBody};
use crate::services::announce;
use crate::AppState;

/// Fire target for scheduled song tasks.
#[post("/song", data = "<body>")]
pub async fn song_notice(
    state: &State<AppState>,
    body: Json<SongTaskBody>,
) -> Result<Status, (Status, String)> {
    match announce::announce_song(
        &state.youtube,
        &state.store,
        &state.http,
        &state.config,
        &body.id,
    )
    .await
    {
        Ok(()) => Ok(Status::Ok),
        Err(e) => {
            error!("song announcement for {} failed: {e}", body.id);
            Err((Status::InternalServerError, e.to_string()))
        }
    }
}

/// Fire target for scheduled topic tasks.
#[post("/topic", data = "<body>")]
pub async fn topic_notice(
    state: &State<AppState>,
    body: Json<TopicTaskBody>,
) -> Result<Status, (Status, String)> {
    match announce::announce_topic(
        &state.youtube,
        &state.store,
        &state.http,
        &state.config,
        &body.id,
        &body.name,
    )
    .await
    {
        Ok(()) => Ok(Status::Ok),
        Err(e) => {
            error!("topic announcement for {} failed: {e}", body.id);
            Err((Status::InternalServerError, e.to_string()))
        }
    }
}
