//! Periodic catalog self-description POST (spec §6).

use serde_json::json;

use dswarm_core::ManagerIdentity;

use crate::manager::Manager;

/// Builds the JSON record the manager POSTs to each catalog host. On a
/// "too large" rejection the caller retries with `lean=true`, which drops
/// everything but the fields a catalog listing needs to display an entry.
pub fn build_catalog_record(mgr: &Manager, identity: &ManagerIdentity, port: u16, lean: bool) -> serde_json::Value {
    if lean {
        return json!({
            "type": "ds_master",
            "project": identity.project,
            "port": port,
            "owner": identity.owner,
            "version": identity.version,
        });
    }

    let stats = mgr.capacity.stats();
    json!({
        "type": "ds_master",
        "project": identity.project,
        "port": port,
        "owner": identity.owner,
        "version": identity.version,
        "workers": mgr.workers_connected(),
        "tasks_waiting": mgr.tasks_waiting(),
        "tasks_running": mgr.tasks_running(),
        "capacity_tasks": stats.capacity_tasks,
        "capacity_weighted": stats.capacity_weighted,
    })
}

/// POSTs the record to one catalog host, retrying with the lean record if
/// the host rejects the buffer for size (spec §6).
pub async fn post_to_catalog(
    http: &reqwest::Client,
    mgr: &Manager,
    identity: &ManagerIdentity,
    port: u16,
    host: &str,
    catalog_port: u16,
) -> anyhow::Result<()> {
    let url = format!("http://{host}:{catalog_port}/");
    let record = build_catalog_record(mgr, identity, port, false);
    let resp = http.post(&url).json(&record).send().await?;
    if resp.status().as_u16() == 413 {
        let lean = build_catalog_record(mgr, identity, port, true);
        http.post(&url).json(&lean).send().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;

    #[test]
    fn lean_record_drops_capacity_fields() {
        let mgr = Manager::new(ManagerConfig::default());
        let identity = ManagerIdentity {
            project: "p".to_string(),
            owner: "o".to_string(),
            version: "1.0.0".to_string(),
        };
        let record = build_catalog_record(&mgr, &identity, 9123, true);
        assert!(record.get("capacity_tasks").is_none());
        assert_eq!(record["type"], "ds_master");
    }
}
