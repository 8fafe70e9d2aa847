/*!
# Campaigns Module

Helpers for building search tasks and the preset campaign set covering the
major UK markets.
*/

use serde_json::json;

use crate::task::SearchTask;

/// Build the conventional location/category/limit parameter payload
pub fn search_params(location: &str, category: Option<&str>, limit: u32) -> serde_json::Value {
    json!({
        "location": location,
        "category": category,
        "limit": limit,
    })
}

/// Build a campaign task for a location and optional category
pub fn campaign_task(location: &str, category: Option<&str>, limit: u32, priority: u8) -> SearchTask {
    SearchTask::new(search_params(location, category, limit)).with_priority(priority)
}

/// Preset campaigns for common scenarios: major cities first, business
/// services next, then regional coverage.
pub fn preset_campaigns() -> Vec<SearchTask> {
    vec![
        // Major UK cities
        campaign_task("London", Some("Technology"), 100, 1),
        campaign_task("Manchester", Some("Technology"), 50, 1),
        campaign_task("Birmingham", Some("Technology"), 50, 1),
        campaign_task("Leeds", Some("Technology"), 30, 2),
        campaign_task("Glasgow", Some("Technology"), 30, 2),
        // Business services
        campaign_task("London", Some("Consulting"), 50, 1),
        campaign_task("London", Some("Marketing"), 50, 1),
        campaign_task("London", Some("Finance"), 50, 2),
        // Regional coverage
        campaign_task("Bristol", None, 30, 2),
        campaign_task("Edinburgh", None, 30, 2),
        campaign_task("Cardiff", None, 30, 3),
        campaign_task("Belfast", None, 30, 3),
    ]
}
