use log::error;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{post, State};

use crate::models::RunSummary;
use crate::services::pipeline::Pipeline;
use crate::AppState;

/// Trigger one upload-check run. The cron scheduler hits the same code
/// path; this endpoint exists for external schedulers and manual runs.
#[post("/check")]
pub async fn check(state: &State<AppState>) -> Result<Json<RunSummary>, (Status, String)> {
    let pipeline = Pipeline::new(
        &state.store,
        &state.youtube,
        &state.queue,
        &state.http,
        &state.config,
    );
    match pipeline.check_new_videos().await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            error!("check run failed: {e}");
            Err((Status::InternalServerError, e.to_string()))
        }
    }
}
