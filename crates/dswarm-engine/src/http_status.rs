//! HTTP status responder sharing the worker listening port (spec §6, §8 S5).

use serde_json::json;

use crate::manager::Manager;

const HTML_INDEX: &str = "<html><body><h1>dswarm manager</h1></body></html>";

/// Builds the full HTTP/1.1 response text (status line, headers, body) for
/// a `GET <path>` request. The caller disconnects immediately afterward.
pub fn build_http_response(path: &str, mgr: &Manager, port: u16) -> String {
    let header = "HTTP/1.1 200 OK\nConnection: close\nContent-type: text/plain\n\n";

    if path == "/" {
        return format!("{header}{HTML_INDEX}");
    }

    let stats = mgr.capacity.stats();
    let record = json!([{
        "type": "ds_master",
        "port": port,
        "tasks_waiting": mgr.tasks_waiting(),
        "tasks_running": mgr.tasks_running(),
        "workers_connected": mgr.workers_connected(),
        "capacity_tasks": stats.capacity_tasks,
        "capacity_weighted": stats.capacity_weighted,
    }]);

    format!("{header}{record}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;

    #[test]
    fn status_response_contains_ds_master_and_counts() {
        let mgr = Manager::new(ManagerConfig::default());
        let resp = build_http_response("/queue_status", &mgr, 9123);
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(resp.contains("\"type\":\"ds_master\""));
        assert!(resp.contains("\"port\":9123"));
    }

    #[test]
    fn root_path_returns_html() {
        let mgr = Manager::new(ManagerConfig::default());
        let resp = build_http_response("/", &mgr, 9123);
        assert!(resp.contains("<html>"));
    }
}
