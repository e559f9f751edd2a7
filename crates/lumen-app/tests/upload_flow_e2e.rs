use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use lumen_app::paths::AppPaths;
use lumen_app::services::{FsCommitStore, HttpInferenceProvider};
use lumen_server::messages::ServerMessage;
use lumen_server::session::{ChannelClosed, Inbound, SessionChannel};
use lumen_server::{
    ApiState, ArtifactGateway, GatewayConfig, Readiness, ServerConfig, SessionConfig,
    SessionCoordinator, SessionState, build_app_router,
};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PRIMARY: &[u8] = b"\x89PNG primary scan bytes";
const MASK: &[u8] = b"\x89PNG derived mask";

struct ScriptedChannel {
    inbound: VecDeque<Inbound>,
    sent: Vec<ServerMessage>,
}

#[async_trait]
impl SessionChannel for ScriptedChannel {
    async fn recv(&mut self) -> Result<Inbound, ChannelClosed> {
        self.inbound.pop_front().ok_or(ChannelClosed)
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<(), ChannelClosed> {
        self.sent.push(message.clone());
        Ok(())
    }
}

async fn model_service() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "healthy", "model_loaded": true})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/predict"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "mask_base64": STANDARD.encode(MASK),
            "statistics": {"coverage_percent": 3.5}
        })))
        .mount(&server)
        .await;
    server
}

/// Serves the full router on an ephemeral port; the gateway reads from the same
/// process through the raw file routes.
async fn spawn_server(store: Arc<FsCommitStore>, inference: Arc<HttpInferenceProvider>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let gateway = ArtifactGateway::new(&GatewayConfig::default(), &format!("http://{addr}"))
        .expect("valid upstream");
    let state = ApiState::new(store, inference, gateway, SessionConfig::default());
    let router = build_app_router(&ServerConfig::with_listen_addr(addr.to_string()), state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server runs");
    });
    addr
}

#[tokio::test]
async fn upload_commits_pair_and_gateway_streams_it_back() {
    let temp = TempDir::new().expect("temp dir");
    let store = Arc::new(
        FsCommitStore::builder()
            .paths(AppPaths::new(temp.path()).expect("paths"))
            .build()
            .expect("store"),
    );
    let model = model_service().await;
    let inference = Arc::new(
        HttpInferenceProvider::new(&model.uri(), std::time::Duration::from_secs(5))
            .expect("provider"),
    );
    assert_eq!(inference.load().await, Readiness::Ready);
    let addr = spawn_server(Arc::clone(&store), Arc::clone(&inference)).await;

    let coordinator = SessionCoordinator::new(
        store.clone(),
        inference.clone(),
        SessionConfig::default(),
    );
    let mut channel = ScriptedChannel {
        inbound: VecDeque::from([
            Inbound::Text(format!(
                r#"{{"type":"metadata","filename":"scan.png","size":{},"contentType":"image/png"}}"#,
                PRIMARY.len()
            )),
            Inbound::Binary(Bytes::from_static(PRIMARY)),
        ]),
        sent: Vec::new(),
    };

    let outcome = coordinator.run(&mut channel).await;
    assert_eq!(outcome.state, SessionState::Finalized);
    let set_id = outcome.set_id.expect("set id assigned");

    let Some(ServerMessage::Success { data, .. }) = channel.sent.last() else {
        panic!("expected success, got {:?}", channel.sent.last());
    };
    assert_eq!(data.id, set_id);
    let mask = data
        .vision_result
        .as_ref()
        .and_then(|vision| vision.mask.as_ref())
        .expect("mask report");
    assert!(mask.committed);

    let committed = store
        .committed_set(&set_id)
        .expect("catalog readable")
        .expect("set committed");
    assert_eq!(std::fs::read(&committed.secondary_path).expect("mask on disk"), MASK);
    assert!(!temp.path().join("staging").join(&set_id).exists());

    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let mask_response = http
        .get(format!("{base}/files/{set_id}/mask"))
        .send()
        .await
        .expect("mask request");
    assert_eq!(mask_response.status(), StatusCode::OK);
    assert_eq!(mask_response.bytes().await.expect("mask body"), MASK);

    let ranged = http
        .get(format!("{base}/files/{set_id}/report/scan.png"))
        .header(RANGE, "bytes=0-3")
        .send()
        .await
        .expect("ranged request");
    assert_eq!(ranged.status(), StatusCode::PARTIAL_CONTENT);
    assert!(ranged.headers().get(CONTENT_RANGE).is_some());
    assert_eq!(ranged.bytes().await.expect("ranged body"), &PRIMARY[..4]);

    let listed: serde_json::Value = http
        .get(format!("{base}/sets/{set_id}"))
        .send()
        .await
        .expect("set lookup")
        .json()
        .await
        .expect("json body");
    assert_eq!(listed["item"]["set_id"], set_id.as_str());
}

#[tokio::test]
async fn pending_set_is_invisible_to_readers() {
    let temp = TempDir::new().expect("temp dir");
    let store = Arc::new(
        FsCommitStore::builder()
            .paths(AppPaths::new(temp.path()).expect("paths"))
            .build()
            .expect("store"),
    );
    let model = model_service().await;
    let inference = Arc::new(
        HttpInferenceProvider::new(&model.uri(), std::time::Duration::from_secs(5))
            .expect("provider"),
    );
    let addr = spawn_server(Arc::clone(&store), inference).await;

    let set_id = store.create().await.expect("create set");
    store
        .stage(
            &set_id,
            lumen_server::ArtifactSlot::Primary,
            lumen_server::ArtifactUpload {
                filename: "scan.png".to_string(),
                content_type: "image/png".to_string(),
                bytes: Bytes::from_static(PRIMARY),
            },
        )
        .await
        .expect("stage primary");

    let http = reqwest::Client::new();
    for route in [
        format!("/files/{set_id}/mask"),
        format!("/files/{set_id}/report/scan.png"),
        format!("/api/files/{set_id}/mask"),
        format!("/sets/{set_id}"),
    ] {
        let response = http
            .get(format!("http://{addr}{route}"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{route}");
    }
}
