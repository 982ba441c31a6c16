use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

use asset_vault::config::Config;
use asset_vault::core::metadata::encode_upload_metadata;
use asset_vault::core::naming::repo_hash;
use asset_vault::git;
use asset_vault::provision::repository_path;
use asset_vault::server;
use asset_vault::Vault;

const USER: &str = "user-1";

struct TestServer {
    base: String,
    client: Client,
    config: Config,
    _tmp: TempDir,
}

async fn start_server() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::rooted_at(tmp.path());
    config.queue.workers = 2;
    let vault = Vault::build(config.clone()).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, vault));

    TestServer {
        base: format!("http://{}", addr),
        client: Client::new(),
        config,
        _tmp: tmp,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Poll a task until it leaves `pending`/`running`.
    async fn wait_task(&self, id: &str) -> Value {
        for _ in 0..600 {
            let task: Value = self
                .client
                .get(self.url(&format!("/api/tasks/{}", id)))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if task["status"] == "success" || task["status"] == "failed" {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task {} did not finish", id);
    }

    async fn create_project(&self, name: &str) -> Value {
        let resp = self
            .client
            .post(self.url("/api/projects"))
            .header("x-user-id", USER)
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body: Value = resp.json().await.unwrap();
        let task = self.wait_task(body["taskId"].as_str().unwrap()).await;
        assert_eq!(task["status"], "success", "{}", task);
        body
    }

    /// Open a tus session and return its absolute URL.
    async fn open_upload(&self, length: u64, metadata: &str) -> String {
        let resp = self
            .client
            .post(self.url("/files"))
            .header("Tus-Resumable", "1.0.0")
            .header("x-user-id", USER)
            .header("Upload-Length", length.to_string())
            .header("Upload-Metadata", metadata)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["tus-resumable"], "1.0.0");
        let location = resp.headers()["location"].to_str().unwrap().to_string();
        assert!(location.starts_with("/files/"));
        self.url(&location)
    }

    async fn patch(&self, url: &str, offset: u64, chunk: Vec<u8>) -> reqwest::Response {
        self.client
            .patch(url)
            .header("Tus-Resumable", "1.0.0")
            .header("x-user-id", USER)
            .header("Content-Type", "application/offset+octet-stream")
            .header("Upload-Offset", offset.to_string())
            .body(chunk)
            .send()
            .await
            .unwrap()
    }

    async fn head_offset(&self, url: &str) -> u64 {
        let resp = self
            .client
            .head(url)
            .header("Tus-Resumable", "1.0.0")
            .header("x-user-id", USER)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["cache-control"], "no-store");
        resp.headers()["upload-offset"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap()
    }

    async fn tasks(&self) -> Vec<Value> {
        let body: Value = self
            .client
            .get(self.url("/api/tasks"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["tasks"].as_array().unwrap().clone()
    }
}

fn metadata(project_id: &str, filename: &str, filetype: &str) -> String {
    encode_upload_metadata([
        ("filename", filename),
        ("filetype", filetype),
        ("projectId", project_id),
        ("targetFolderPath", "docs"),
    ])
}

#[tokio::test]
async fn test_health() {
    let srv = start_server().await;
    let body: Value = srv
        .client
        .get(srv.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_create_project_returns_ticket() {
    let srv = start_server().await;
    let body = srv.create_project("My Thesis").await;

    assert_eq!(body["status"], "queued");
    assert_eq!(body["projectName"], "My Thesis");
    let project_id = body["projectId"].as_str().unwrap();
    assert_eq!(body["repoHash"], repo_hash(USER, project_id));

    let bare = repository_path(&srv.config.storage.repos_root, &repo_hash(USER, project_id));
    assert!(git::is_bare_repo(&bare).await);
}

#[tokio::test]
async fn test_create_project_requires_identity_and_valid_name() {
    let srv = start_server().await;

    let resp = srv
        .client
        .post(srv.url("/api/projects"))
        .json(&serde_json::json!({ "name": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = srv
        .client
        .post(srv.url("/api/projects"))
        .header("x-user-id", USER)
        .json(&serde_json::json!({ "name": "../etc" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test]
async fn test_chunked_upload_enqueues_one_ingestion() {
    let srv = start_server().await;
    let project = srv.create_project("Big Files").await;
    let project_id = project["projectId"].as_str().unwrap();

    let total: usize = 10 * 1024 * 1024;
    let bytes: Vec<u8> = (0..total).map(|i| (i % 253) as u8).collect();
    let url = srv
        .open_upload(total as u64, &metadata(project_id, "big.txt", "text/plain"))
        .await;

    let offsets = [0usize, 4_194_304, 8_388_608];
    let mut task_id = None;
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(total);
        let resp = srv.patch(&url, start as u64, bytes[start..end].to_vec()).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let offset: usize = resp.headers()["upload-offset"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(offset, end);
        if end < total {
            assert!(resp.headers().get("x-task-id").is_none());
        } else {
            task_id = Some(resp.headers()["x-task-id"].to_str().unwrap().to_string());
        }
    }

    let ingestions: Vec<Value> = srv
        .tasks()
        .await
        .into_iter()
        .filter(|t| t["type"] == "PROCESS_ASSET")
        .collect();
    assert_eq!(ingestions.len(), 1);

    let task = srv.wait_task(&task_id.unwrap()).await;
    assert_eq!(task["status"], "success", "{}", task);
    assert_eq!(task["result"]["relativePath"], "docs/big.txt");

    let bare = repository_path(&srv.config.storage.repos_root, &repo_hash(USER, project_id));
    let clone = srv.config.storage.staging_dir.join("verify");
    git::clone_repo(&bare, &clone).await.unwrap();
    assert_eq!(std::fs::read(clone.join("docs/big.txt")).unwrap(), bytes);

    // The session is gone once handed over.
    let resp = srv
        .client
        .head(&url)
        .header("Tus-Resumable", "1.0.0")
        .header("x-user-id", USER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stale_offset_is_rejected() {
    let srv = start_server().await;
    let url = srv
        .open_upload(200, &metadata("p", "a.txt", "text/plain"))
        .await;

    let resp = srv.patch(&url, 0, vec![1u8; 50]).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = srv.patch(&url, 100, vec![2u8; 20]).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "conflict");

    assert_eq!(srv.head_offset(&url).await, 50);
}

#[tokio::test]
async fn test_tus_protocol_guards() {
    let srv = start_server().await;

    let resp = srv
        .client
        .request(Method::OPTIONS, srv.url("/files"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(resp.headers()["tus-version"], "1.0.0");
    assert!(resp.headers()["tus-extension"]
        .to_str()
        .unwrap()
        .contains("creation"));

    // Missing protocol version.
    let resp = srv
        .client
        .post(srv.url("/files"))
        .header("x-user-id", USER)
        .header("Upload-Length", "10")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);

    // Declared size above the maximum.
    let resp = srv
        .client
        .post(srv.url("/files"))
        .header("Tus-Resumable", "1.0.0")
        .header("x-user-id", USER)
        .header("Upload-Length", (srv.config.uploads.max_size + 1).to_string())
        .header("Upload-Metadata", metadata("p", "a.txt", "text/plain"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // Metadata without a project.
    let resp = srv
        .client
        .post(srv.url("/files"))
        .header("Tus-Resumable", "1.0.0")
        .header("x-user-id", USER)
        .header("Upload-Length", "10")
        .header(
            "Upload-Metadata",
            encode_upload_metadata([("filename", "a.txt"), ("filetype", "text/plain")]),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Wrong chunk content type.
    let url = srv.open_upload(10, &metadata("p", "a.txt", "text/plain")).await;
    let resp = srv
        .client
        .patch(&url)
        .header("Tus-Resumable", "1.0.0")
        .header("x-user-id", USER)
        .header("Content-Type", "text/plain")
        .header("Upload-Offset", "0")
        .body("0123456789")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(srv.head_offset(&url).await, 0);
}

#[tokio::test]
async fn test_termination_discards_session() {
    let srv = start_server().await;
    let url = srv.open_upload(10, &metadata("p", "a.txt", "text/plain")).await;
    srv.patch(&url, 0, b"abc".to_vec()).await;

    let resp = srv
        .client
        .delete(&url)
        .header("Tus-Resumable", "1.0.0")
        .header("x-user-id", USER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = srv.patch(&url, 3, b"defghij".to_vec()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(srv.tasks().await.is_empty());
}

#[tokio::test]
async fn test_direct_upload_commits_file() {
    let srv = start_server().await;
    let project = srv.create_project("Notes").await;
    let project_id = project["projectId"].as_str().unwrap().to_string();

    let part = reqwest::multipart::Part::bytes(b"# Title\n\nBody.\n".to_vec())
        .file_name("readme.md")
        .mime_str("text/markdown")
        .unwrap();
    let form = reqwest::multipart::Form::new()
        .part("file", part)
        .text("projectId", project_id.clone())
        .text("targetFolderPath", "notes/week 1");

    let resp = srv
        .client
        .post(srv.url("/api/upload"))
        .header("x-user-id", USER)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = resp.json().await.unwrap();
    assert!(body["message"].is_string());

    let task = srv.wait_task(body["taskId"].as_str().unwrap()).await;
    assert_eq!(task["status"], "success", "{}", task);
    assert_eq!(task["result"]["relativePath"], "notes/week 1/readme.md");
    assert_eq!(task["result"]["commitHash"].as_str().unwrap().len(), 40);
}

#[tokio::test]
async fn test_direct_upload_requires_project_and_identity() {
    let srv = start_server().await;

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"abc".to_vec()).file_name("a.txt"),
    );
    let resp = srv
        .client
        .post(srv.url("/api/upload"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"abc".to_vec()).file_name("a.txt"),
    );
    let resp = srv
        .client
        .post(srv.url("/api/upload"))
        .header("x-user-id", USER)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(srv.tasks().await.is_empty());
}

#[tokio::test]
async fn test_direct_upload_without_part_type_is_octet_stream() {
    let srv = start_server().await;
    let project = srv.create_project("Blobs").await;
    let project_id = project["projectId"].as_str().unwrap().to_string();

    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(vec![0u8, 1, 2, 3]).file_name("blob.bin"),
        )
        .text("projectId", project_id);
    let resp = srv
        .client
        .post(srv.url("/api/upload"))
        .header("x-user-id", USER)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = resp.json().await.unwrap();

    let task = srv.wait_task(body["taskId"].as_str().unwrap()).await;
    assert_eq!(task["status"], "failed", "{}", task);
    assert_eq!(task["payload"]["mimeType"], "application/octet-stream");
    assert_eq!(task["error"]["kind"], "validation");
    assert!(task["error"]["message"]
        .as_str()
        .unwrap()
        .contains("application/octet-stream"));
}

#[tokio::test]
async fn test_failed_handover_is_a_server_error() {
    let srv = start_server().await;
    let url = srv.open_upload(6, &metadata("p1", "a.txt", "text/plain")).await;
    assert_eq!(srv.patch(&url, 0, b"abc".to_vec()).await.status(), StatusCode::NO_CONTENT);

    // Completed uploads can no longer be staged.
    let completed = srv.config.completed_dir();
    std::fs::remove_dir_all(&completed).unwrap();
    std::fs::write(&completed, b"not a directory").unwrap();

    let resp = srv.patch(&url, 3, b"def".to_vec()).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers()["tus-resumable"], "1.0.0");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "io");

    let resp = srv
        .client
        .head(&url)
        .header("Tus-Resumable", "1.0.0")
        .header("x-user-id", USER)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(srv.tasks().await.is_empty());
}

#[tokio::test]
async fn test_unknown_task_is_404() {
    let srv = start_server().await;
    let resp = srv
        .client
        .get(srv.url("/api/tasks/task_does_not_exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}
