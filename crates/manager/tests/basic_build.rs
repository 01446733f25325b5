//! End-to-end scenarios against a real in-process manager + agent pair
//! (spec §8 scenarios 1 and 2), matching the shape of the teacher's
//! functional-test suites: bind both to ephemeral ports, drive them
//! purely over HTTP, assert on externally observable state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clusterrunner_agent::state::AgentState;
use clusterrunner_core::SystemClock;
use clusterrunner_manager::routes::build_router;
use clusterrunner_manager::AppState;
use clusterrunner_manager::{Client, ManagerConfig};
use clusterrunner_store::BuildStore;

async fn spawn_manager(results_dir: std::path::PathBuf) -> (SocketAddr, Arc<AppState<SystemClock, clusterrunner_worker::HttpWorkerTransport>>) {
    let mut config = ManagerConfig::load(None).unwrap();
    config.results_dir = results_dir;
    config.database_url = "sqlite::memory:".to_string();

    let store = BuildStore::<SystemClock>::connect(&config.database_url).await.unwrap();
    let state = Arc::new(AppState::new(config, SystemClock::default(), store).unwrap());
    tokio::spawn(Arc::clone(&state.allocator).run());

    let router = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    (addr, state)
}

async fn spawn_agent(manager_addr: SocketAddr, results_dir: std::path::PathBuf) -> SocketAddr {
    let state = AgentState::new("test-session".to_string(), results_dir, Some(format!("http://{manager_addr}")));
    let router = clusterrunner_agent::build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

#[tokio::test]
async fn basic_job_finishes_with_no_failures() {
    let dir = tempfile::tempdir().unwrap();
    let (manager_addr, _state) = spawn_manager(dir.path().to_path_buf()).await;
    let agent_addr = spawn_agent(manager_addr, dir.path().to_path_buf()).await;

    let client = Client::new(format!("http://{manager_addr}"), "");
    client.connect_worker(&format!("http://{agent_addr}"), 1).await.unwrap();

    let job_description = r#"
        [job]
        name = "basic"
        max_executors = 1
        max_executors_per_worker = 1

        [[subjobs]]
        atoms = ["echo \"This is atom 0\" > $ARTIFACT_DIR/result.txt"]
        [[subjobs]]
        atoms = ["echo \"This is atom 1\" > $ARTIFACT_DIR/result.txt"]
        [[subjobs]]
        atoms = ["echo \"This is atom 2\" > $ARTIFACT_DIR/result.txt"]
        [[subjobs]]
        atoms = ["echo \"This is atom 3\" > $ARTIFACT_DIR/result.txt"]
        [[subjobs]]
        atoms = ["echo \"This is atom 4\" > $ARTIFACT_DIR/result.txt"]
    "#;
    let build_id = client.post_new_build(job_description).await.unwrap();

    let finished = client
        .block_until_build_has_status(build_id, &["FINISHED", "ERROR"], Some(Duration::from_secs(30)), |_| {})
        .await;
    assert!(finished, "build did not reach a terminal state in time");

    let status = client.get_build_status(build_id).await.unwrap();
    assert_eq!(status["build"]["status"], "FINISHED");
    assert_eq!(status["build"]["result"], "NO_FAILURES");
    assert_eq!(status["build"]["num_atoms"], 5);
    assert_eq!(status["build"]["num_subjobs"], 5);

    let (ready, _bytes) = client.get_build_artifacts(build_id).await.unwrap();
    assert!(ready);
}

#[tokio::test]
async fn basic_failing_job_reports_failure_and_lists_the_failed_atom() {
    let dir = tempfile::tempdir().unwrap();
    let (manager_addr, _state) = spawn_manager(dir.path().to_path_buf()).await;
    let agent_addr = spawn_agent(manager_addr, dir.path().to_path_buf()).await;

    let client = Client::new(format!("http://{manager_addr}"), "");
    client.connect_worker(&format!("http://{agent_addr}"), 1).await.unwrap();

    let job_description = r#"
        [job]
        name = "basic-failing"
        max_executors = 1
        max_executors_per_worker = 1

        [[subjobs]]
        atoms = ["echo \"This is atom 0\" > $ARTIFACT_DIR/result.txt"]
        [[subjobs]]
        atoms = ["echo \"This is atom 1\" > $ARTIFACT_DIR/result.txt"]
        [[subjobs]]
        atoms = ["echo \"This is atom 2\" > $ARTIFACT_DIR/result.txt"]
        [[subjobs]]
        atoms = ["exit 1"]
        [[subjobs]]
        atoms = ["echo \"This is atom 4\" > $ARTIFACT_DIR/result.txt"]
    "#;
    let build_id = client.post_new_build(job_description).await.unwrap();

    let finished = client
        .block_until_build_has_status(build_id, &["FINISHED", "ERROR"], Some(Duration::from_secs(30)), |_| {})
        .await;
    assert!(finished, "build did not reach a terminal state in time");

    let status = client.get_build_status(build_id).await.unwrap();
    assert_eq!(status["build"]["status"], "FINISHED");
    assert_eq!(status["build"]["result"], "FAILURE");
    let failed_atoms = status["build"]["failed_atoms"].as_array().unwrap();
    assert_eq!(failed_atoms.len(), 1);
    assert_eq!(failed_atoms[0], "artifact_3_0");
}
