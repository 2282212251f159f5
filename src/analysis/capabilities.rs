use super::models::{CapabilitiesPayload, Capability, FilesPayload, GraphPayload, Swimlane};
use chrono::Utc;
use std::collections::BTreeMap;

/// Classify a path into the web/api/workers/other swimlanes
pub fn lane_for_path(path: &str) -> Swimlane {
    let lower = format!("/{}", path.to_lowercase());
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["/api/", "/routes/", "/routers/", "route.ts", "route.js"]) {
        Swimlane::Api
    } else if has(&["/pages/", "/app/", "/components/", "/src/", ".tsx", ".jsx"]) {
        Swimlane::Web
    } else if has(&["/workers/", "/tasks/", "/jobs/", "/cron/"]) {
        Swimlane::Workers
    } else {
        Swimlane::Other
    }
}

/// One capability per route/API entrypoint, covering its direct internal dependencies
pub fn build_capabilities(files: &FilesPayload, graph: &GraphPayload) -> CapabilitiesPayload {
    let hubs = &graph.metrics.top_hubs;
    let mut capabilities = Vec::new();

    for file in files.files.iter().filter(|f| f.hints.is_route || f.hints.is_api) {
        let mut flow = vec![file.path.clone()];
        for dep in graph.internal_deps(&file.path) {
            if !flow.contains(&dep) {
                flow.push(dep);
            }
        }
        let hubs_touched = flow.iter().filter(|p| hubs.contains(p)).cloned().collect();
        let lane = if file.hints.is_api {
            Swimlane::Api
        } else {
            lane_for_path(&file.path)
        };

        capabilities.push(Capability {
            id: format!("cap-{}", capabilities.len() + 1),
            title: format!("Capability starting at {}", file.path),
            entrypoint: file.path.clone(),
            lane,
            files: flow,
            hubs_touched,
        });
    }

    let mut swimlanes: BTreeMap<Swimlane, Vec<String>> = BTreeMap::new();
    for lane in [Swimlane::Web, Swimlane::Api, Swimlane::Workers, Swimlane::Other] {
        swimlanes.insert(lane, Vec::new());
    }
    for file in &files.files {
        swimlanes
            .entry(lane_for_path(&file.path))
            .or_default()
            .push(file.path.clone());
    }

    CapabilitiesPayload {
        repo_id: files.repo_id.clone(),
        generated_at: Utc::now(),
        capabilities,
        swimlanes,
    }
}
