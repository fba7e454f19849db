use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use cluster_core::{EntityPatch, Operation, Phase, TemplateRef};
use db::{EntityStore, MemoryStore};
use orchestrator::{GuestPropertyBudget, OrchestratorConfig, ScriptBudget, StaticTemplates};
use serde_json::{json, Value};
use server::config::ServerConfig;
use server::{create_router, state::AppState};

const TEMPLATE: &str = "ubuntu-16.04_k8-1.21_weave-2.8.1";

fn orchestrator_config(entity_type: &str) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_entity_type(entity_type)
        .with_default_template(TemplateRef::new(TEMPLATE, 1))
        .with_script_budget(ScriptBudget {
            readiness_attempts: 3,
            readiness_interval_secs: 0,
            retry_attempts: 1,
        })
        .with_guest_property_budget(GuestPropertyBudget {
            attempts: 3,
            interval_secs: 0,
        })
}

struct TestApp {
    server: TestServer,
    state: AppState,
    store: Arc<MemoryStore>,
}

fn setup_with(entity_type: &str, server_config: ServerConfig) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::simulated(
        store.clone(),
        store.clone(),
        &server_config,
        orchestrator_config(entity_type),
    )
    .expect("Failed to build state");

    let server = TestServer::new(create_router(state.clone())).expect("Failed to create test server");
    TestApp {
        server,
        state,
        store,
    }
}

fn setup_test_server() -> TestServer {
    setup_with("native:2.0.0", ServerConfig::default()).server
}

fn cluster_body(name: &str) -> Value {
    json!({
        "name": name,
        "org_name": "org1",
        "vdc_name": "vdc1",
        "network": "net1",
        "workers": 2
    })
}

/// Poll a task until it leaves `running`.
async fn wait_for_task(server: &TestServer, task_href: &str) -> Value {
    for _ in 0..500 {
        let task: Value = server.get(task_href).await.json();
        if task["status"] != "running" {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never finished", task_href);
}

/// Create a cluster and wait for it; returns the cluster id.
async fn create_ready(server: &TestServer, body: Value) -> String {
    let response = server.post("/api/clusters").json(&body).await;
    response.assert_status(StatusCode::ACCEPTED);
    let accepted: Value = response.json();

    let task = wait_for_task(server, accepted["task_href"].as_str().unwrap()).await;
    assert_eq!(task["status"], "success", "create failed: {}", task);
    accepted["cluster"]["id"].as_str().unwrap().to_string()
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_health_endpoint() {
        let server = setup_test_server();

        let response = server.get("/health").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["default_entity_type"], "native:2.0.0");
    }

    #[tokio::test]
    async fn test_openapi_document_lists_cluster_routes() {
        let server = setup_test_server();

        let response = server.get("/api/openapi.json").await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert!(body["paths"]["/api/clusters"].is_object());
        assert!(body["paths"]["/api/tasks/{id}"].is_object());
    }
}

mod clusters_create {
    use super::*;

    #[tokio::test]
    async fn test_create_cluster_returns_202_with_task() {
        let server = setup_test_server();

        let response = server.post("/api/clusters").json(&cluster_body("alpha")).await;

        response.assert_status(StatusCode::ACCEPTED);
        let body: Value = response.json();
        assert_eq!(body["cluster"]["name"], "alpha");
        assert_eq!(body["cluster"]["status"]["phase"], "CREATE:IN_PROGRESS");
        assert!(body["task_href"]
            .as_str()
            .unwrap()
            .starts_with("/api/tasks/"));
    }

    #[tokio::test]
    async fn test_created_cluster_reaches_succeeded() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;

        let response = server.get(&format!("/api/clusters/{}", id)).await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"]["phase"], "CREATE:SUCCEEDED");
        assert_eq!(body["status"]["nodes"].as_array().unwrap().len(), 3);
        assert!(body["status"].get("kubeconfig").is_none());
    }

    #[tokio::test]
    async fn test_scripted_generation_create() {
        let server = setup_with("native:1.0.0", ServerConfig::default()).server;
        let id = create_ready(&server, cluster_body("legacy")).await;

        let body: Value = server.get(&format!("/api/clusters/{}", id)).await.json();
        assert_eq!(body["entity_type"], "native:1.0.0");
        assert_eq!(body["status"]["phase"], "CREATE:SUCCEEDED");
    }

    #[tokio::test]
    async fn test_create_exposed_cluster() {
        let server = setup_test_server();
        let mut body = cluster_body("edge");
        body["expose"] = json!(true);
        let id = create_ready(&server, body).await;

        let cluster: Value = server.get(&format!("/api/clusters/{}", id)).await.json();
        assert_eq!(cluster["status"]["exposed"], true);
        assert_eq!(cluster["status"]["external_ip"], "192.0.2.10");
    }

    #[tokio::test]
    async fn test_invalid_name_returns_400() {
        let server = setup_test_server();

        let response = server
            .post("/api/clusters")
            .json(&cluster_body("1-bad-name"))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_worker_count_above_limit_returns_400() {
        let server = setup_test_server();
        let mut body = cluster_body("alpha");
        body["workers"] = json!(1_700_000);

        let response = server.post("/api/clusters").json(&body).await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "invalid_request");

        let list: Value = server.get("/api/clusters").await.json();
        assert_eq!(list["total"], 0);
    }

    #[tokio::test]
    async fn test_unknown_template_returns_400() {
        let server = setup_test_server();
        let mut body = cluster_body("alpha");
        body["template_name"] = json!("nope");
        body["template_revision"] = json!(1);

        let response = server.post("/api/clusters").json(&body).await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_name_returns_409() {
        let server = setup_test_server();
        create_ready(&server, cluster_body("alpha")).await;

        let response = server.post("/api/clusters").json(&cluster_body("alpha")).await;

        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "cluster_exists");
    }
}

mod clusters_query {
    use super::*;

    #[tokio::test]
    async fn test_list_clusters_with_filter_and_paging() {
        let server = setup_test_server();
        create_ready(&server, cluster_body("alpha")).await;
        create_ready(&server, cluster_body("beta")).await;

        let all: Value = server.get("/api/clusters").await.json();
        assert_eq!(all["total"], 2);
        assert_eq!(all["items"].as_array().unwrap().len(), 2);

        let filtered: Value = server.get("/api/clusters?name=beta").await.json();
        assert_eq!(filtered["total"], 1);
        assert_eq!(filtered["items"][0]["name"], "beta");

        let paged: Value = server
            .get("/api/clusters?page=2&page_size=1")
            .await
            .json();
        assert_eq!(paged["total"], 2);
        assert_eq!(paged["page"], 2);
        assert_eq!(paged["items"][0]["name"], "beta");
    }

    #[tokio::test]
    async fn test_get_unknown_cluster_returns_404() {
        let server = setup_test_server();

        let response = server.get("/api/clusters/urn:cluster:missing").await;

        response.assert_status_not_found();
    }

    #[tokio::test]
    async fn test_get_cluster_config() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;

        let response = server.get(&format!("/api/clusters/{}/config", id)).await;

        response.assert_status_ok();
        let body: Value = response.json();
        assert!(body["kubeconfig"]
            .as_str()
            .unwrap()
            .contains(":6443"));
    }

    #[tokio::test]
    async fn test_upgrade_plan() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;

        let response = server
            .get(&format!("/api/clusters/{}/upgrade-plan", id))
            .await;

        response.assert_status_ok();
        let plan: Value = response.json();
        assert_eq!(plan.as_array().unwrap().len(), 1);
        assert_eq!(plan[0]["revision"], 2);
    }
}

mod clusters_mutate {
    use super::*;

    #[tokio::test]
    async fn test_resize_adds_workers() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;

        let response = server
            .post(&format!("/api/clusters/{}/resize", id))
            .json(&json!({ "workers": 3 }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        let accepted: Value = response.json();
        let task = wait_for_task(&server, accepted["task_href"].as_str().unwrap()).await;
        assert_eq!(task["status"], "success");

        let cluster: Value = server.get(&format!("/api/clusters/{}", id)).await.json();
        assert_eq!(cluster["status"]["phase"], "UPDATE:SUCCEEDED");
        let workers = cluster["status"]["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|n| n["name"].as_str().unwrap().starts_with("node"))
            .count();
        assert_eq!(workers, 3);
    }

    #[tokio::test]
    async fn test_resize_rejects_nfs_scale_down() {
        let server = setup_test_server();
        let mut body = cluster_body("alpha");
        body["nfs"] = json!(1);
        let id = create_ready(&server, body).await;

        let response = server
            .post(&format!("/api/clusters/{}/resize", id))
            .json(&json!({ "nfs": 0 }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("Scaling down nfs nodes is not supported"));
    }

    #[tokio::test]
    async fn test_resize_rejects_negative_workers() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;

        let response = server
            .post(&format!("/api/clusters/{}/resize", id))
            .json(&json!({ "workers": -1 }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_busy_cluster_returns_409() {
        let TestApp { server, store, .. } = setup_with("native:2.0.0", ServerConfig::default());
        let id = create_ready(&server, cluster_body("alpha")).await;
        store
            .update(&id, EntityPatch::new().with_phase(Phase::in_progress(Operation::Update)))
            .await
            .unwrap();

        let response = server.delete(&format!("/api/clusters/{}", id)).await;

        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "cluster_busy");
    }

    #[tokio::test]
    async fn test_upgrade_to_plan_target() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;

        let response = server
            .post(&format!("/api/clusters/{}/upgrade", id))
            .json(&json!({ "name": TEMPLATE, "revision": 2 }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        let accepted: Value = response.json();
        let task = wait_for_task(&server, accepted["task_href"].as_str().unwrap()).await;
        assert_eq!(task["status"], "success", "upgrade failed: {}", task);

        let cluster: Value = server.get(&format!("/api/clusters/{}", id)).await.json();
        assert_eq!(cluster["status"]["phase"], "UPGRADE:SUCCEEDED");
        assert_eq!(cluster["spec"]["template"]["revision"], 2);
    }

    #[tokio::test]
    async fn test_upgrade_outside_plan_returns_400() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;

        let response = server
            .post(&format!("/api/clusters/{}/upgrade", id))
            .json(&json!({ "name": "ubuntu-x", "revision": 9 }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_patch_without_changes_returns_400() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;

        let response = server
            .patch(&format!("/api/clusters/{}", id))
            .json(&json!({ "workers": 2 }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_nodes() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;
        let cluster: Value = server.get(&format!("/api/clusters/{}", id)).await.json();
        let worker = cluster["status"]["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["name"].as_str().unwrap().to_string())
            .find(|n| n.starts_with("node"))
            .unwrap();

        let response = server
            .post(&format!("/api/clusters/{}/delete-nodes", id))
            .json(&json!({ "nodes": [worker] }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        let accepted: Value = response.json();
        let task = wait_for_task(&server, accepted["task_href"].as_str().unwrap()).await;
        assert_eq!(task["status"], "success");

        let cluster: Value = server.get(&format!("/api/clusters/{}", id)).await.json();
        assert_eq!(cluster["status"]["nodes"].as_array().unwrap().len(), 2);
        assert_eq!(cluster["spec"]["workers"]["count"], 1);
    }

    #[tokio::test]
    async fn test_delete_nodes_rejects_control_plane() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;
        let cluster: Value = server.get(&format!("/api/clusters/{}", id)).await.json();
        let control_plane = cluster["status"]["nodes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["name"].as_str().unwrap().to_string())
            .find(|n| n.starts_with("mstr"))
            .unwrap();

        let response = server
            .post(&format!("/api/clusters/{}/delete-nodes", id))
            .json(&json!({ "nodes": [control_plane] }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_cluster_removes_it() {
        let server = setup_test_server();
        let id = create_ready(&server, cluster_body("alpha")).await;

        let response = server.delete(&format!("/api/clusters/{}", id)).await;
        response.assert_status(StatusCode::ACCEPTED);
        let accepted: Value = response.json();
        let task = wait_for_task(&server, accepted["task_href"].as_str().unwrap()).await;
        assert_eq!(task["status"], "success");
        assert_eq!(task["operation"], "DELETE");

        server
            .get(&format!("/api/clusters/{}", id))
            .await
            .assert_status_not_found();
    }
}

mod tasks {
    use super::*;

    #[tokio::test]
    async fn test_unknown_task_returns_404() {
        let server = setup_test_server();

        let response = server
            .get("/api/tasks/00000000-0000-0000-0000-000000000000")
            .await;

        response.assert_status_not_found();
    }

    #[tokio::test]
    async fn test_task_shape() {
        let server = setup_test_server();
        let accepted: Value = server
            .post("/api/clusters")
            .json(&cluster_body("alpha"))
            .await
            .json();

        let task = wait_for_task(&server, accepted["task_href"].as_str().unwrap()).await;

        assert_eq!(task["id"], accepted["task_id"]);
        assert_eq!(task["cluster_id"], accepted["cluster"]["id"]);
        assert!(task["message"]
            .as_str()
            .unwrap()
            .starts_with("Created cluster 'alpha'"));
        assert!(task["error_message"].is_null());
    }

    #[tokio::test]
    async fn test_pruned_task_still_pollable_from_store() {
        let TestApp { server, state, .. } = setup_with("native:2.0.0", ServerConfig::default());
        let accepted: Value = server
            .post("/api/clusters")
            .json(&cluster_body("alpha"))
            .await
            .json();
        let href = accepted["task_href"].as_str().unwrap().to_string();
        wait_for_task(&server, &href).await;

        assert!(state.tasks.prune_terminal().await >= 1);

        let task: Value = server.get(&href).await.json();
        assert_eq!(task["status"], "success");
    }
}

mod config {
    use super::*;

    #[tokio::test]
    async fn test_custom_template_catalog_and_addresses() {
        let mut templates = StaticTemplates::sample().templates().to_vec();
        templates.truncate(1);
        let config = ServerConfig {
            external_ips: vec!["198.51.100.99".to_string()],
            templates,
            task_prune_interval_secs: 0,
        };
        let server = setup_with("native:2.0.0", config).server;
        let mut body = cluster_body("edge");
        body["expose"] = json!(true);
        let id = create_ready(&server, body).await;

        let cluster: Value = server.get(&format!("/api/clusters/{}", id)).await.json();
        assert_eq!(cluster["status"]["external_ip"], "198.51.100.99");

        let plan: Value = server
            .get(&format!("/api/clusters/{}/upgrade-plan", id))
            .await
            .json();
        assert!(plan.as_array().unwrap().is_empty());
    }
}
