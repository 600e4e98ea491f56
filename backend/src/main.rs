#[macro_use]
extern crate rocket;

mod api;
mod config;
mod error;
mod models;
mod retry;
mod services;

use tokio_cron_scheduler::JobScheduler;

use services::scheduler::CloudTasksClient;
use services::store::Store;
use services::youtube::YoutubeClient;

pub struct AppState {
    pub store: Store,
    pub youtube: YoutubeClient,
    pub queue: CloudTasksClient,
    pub http: reqwest::Client,
    pub config: config::AppConfig,
    pub scheduler: tokio::sync::Mutex<JobScheduler>,
}

#[get("/")]
fn index() -> &'static str {
    "upload notifier"
}

#[launch]
async fn rocket() -> _ {
    config::load_environment();
    config::init_logger();

    let state = config::create_app_state()
        .await
        .expect("Application state setup failed.");

    rocket::build()
        .manage(state)
        .mount("/", routes![index])
        .mount("/jobs", routes![api::check])
        .mount("/notices", routes![api::song_notice, api::topic_notice])
}
