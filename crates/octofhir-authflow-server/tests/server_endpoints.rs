use octofhir_authflow::config::SslRequired;
use octofhir_authflow_server::{AppConfig, build_app};
use serde_json::Value;
use tokio::task::JoinHandle;

async fn start_server(cfg: AppConfig) -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let app = build_app(&cfg).await.expect("build app");

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("http://{addr}"), tx, server)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test]
async fn server_endpoints_work() {
    let mut cfg = AppConfig::default();
    cfg.authflow.realm.ssl_required = SslRequired::None;
    let (base, shutdown_tx, handle) = start_server(cfg).await;
    let client = client();

    // GET /
    let resp = client.get(format!("{base}/")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["service"], "OctoFHIR Auth Flows");
    assert_eq!(body["realm"], "main");
    assert_eq!(body["status"], "ok");

    // GET /healthz
    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // Undecodable action token
    let resp = client
        .get(format!("{base}/login-actions/action-token"))
        .query(&[("key", "not-a-token")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_code");
    assert!(body["error_description"].is_string());

    // Restart without an auth session cookie
    let resp = client
        .get(format!("{base}/login-actions/restart"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");

    // Stale session code
    let resp = client
        .get(format!("{base}/broker/after-first-broker-login"))
        .query(&[("code", "missing.secret"), ("client_id", "portal")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "invalid_code");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn external_requests_require_tls() {
    let (base, shutdown_tx, handle) = start_server(AppConfig::default()).await;
    let client = client();

    let resp = client
        .get(format!("{base}/login-actions/restart"))
        .header("x-forwarded-for", "203.0.113.7")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "ssl_required");

    // Terminated TLS at the proxy, or a local caller, passes the check.
    let resp = client
        .get(format!("{base}/login-actions/restart"))
        .header("x-forwarded-for", "203.0.113.7")
        .header("x-forwarded-proto", "https")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .get(format!("{base}/login-actions/restart"))
        .header("x-forwarded-for", "10.0.0.4")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // The health check is never gated.
    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert!(resp.status().is_success());

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn untrusted_proxy_headers_do_not_satisfy_tls() {
    let mut cfg = AppConfig::default();
    cfg.authflow.realm.ssl_required = SslRequired::All;
    cfg.authflow.sessions.trust_proxy_headers = false;
    let app = build_app(&cfg).await.expect("build app");

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rx.await;
        })
        .await;
    });
    let client = client();

    let resp = client
        .get(format!("http://{addr}/login-actions/restart"))
        .header("x-forwarded-proto", "https")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "ssl_required");

    let _ = tx.send(());
    let _ = server.await;
}
