use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::json;
use tether::{
    backend::{AuthBackend, BackendError, HttpAuthBackend},
    AccessToken, AuthCallback, AuthConfig, CallbackParams, ClientId, OrgId, ResolvedConfig,
    SessionController,
};
use wiremock::{
    matchers::{body_json, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn token(exp: u64) -> AccessToken {
    let payload = json!({
        "sub": "user_1",
        "email": "ada@example.com",
        "name": "Ada",
        "org": { "id": "org_1", "name": "Acme", "slug": "acme", "role": "owner" },
        "exp": exp,
    });

    AccessToken::new(format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    ))
}

fn far_future() -> u64 {
    4_000_000_000
}

fn resolved(server: &MockServer) -> ResolvedConfig {
    ResolvedConfig::new("client", server.uri(), server.uri(), server.uri())
}

#[tokio::test]
async fn discovers_app_configuration() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/client-apps/client/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "appUrl": "https://app.test",
            "apiUrl": "https://api.test",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpAuthBackend::new()?;
    let discovery = backend
        .discover(&server.uri(), &ClientId::from_static("client"))
        .await?;

    assert_eq!(discovery.app_url.as_deref(), Some("https://app.test"));
    assert_eq!(discovery.api_url.as_deref(), Some("https://api.test"));
    Ok(())
}

#[tokio::test]
async fn refresh_posts_and_reads_access_token() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    let issued = token(far_future());
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(header("content-type", "application/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": issued.as_str() })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpAuthBackend::new()?;
    let response = backend.refresh(&resolved(&server)).await?;

    assert_eq!(response.access_token, issued);
    Ok(())
}

#[tokio::test]
async fn refresh_rejection_keeps_status_and_body() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_string("no session"))
        .mount(&server)
        .await;

    let backend = HttpAuthBackend::new()?;
    let error = backend.refresh(&resolved(&server)).await.unwrap_err();

    assert_eq!(error.status(), Some(reqwest::StatusCode::UNAUTHORIZED));
    assert_eq!(error.body(), Some("no session"));
    Ok(())
}

#[tokio::test]
async fn organizations_use_bearer_auth() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    let bearer = token(far_future());
    Mock::given(method("GET"))
        .and(path("/api/organizations"))
        .and(header("authorization", format!("Bearer {}", bearer.as_str()).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "organizations": [
                { "id": "org_1", "name": "Acme", "slug": "acme" },
                { "id": "org_2", "name": "Beta", "slug": "beta", "imageUrl": "https://img.test/b.png" },
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpAuthBackend::new()?;
    let organizations = backend.organizations(&resolved(&server), &bearer).await?;

    assert_eq!(organizations.len(), 2);
    assert_eq!(organizations[1].image_url.as_deref(), Some("https://img.test/b.png"));
    Ok(())
}

#[tokio::test]
async fn switch_organization_sends_org_id() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    let issued = token(far_future());
    Mock::given(method("POST"))
        .and(path("/auth/switch-org"))
        .and(body_json(json!({ "org_id": "org_2" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": issued.as_str() })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpAuthBackend::new()?;
    let response = backend
        .switch_organization(&resolved(&server), &OrgId::from_static("org_2"))
        .await?;

    assert_eq!(response.access_token, issued);
    Ok(())
}

#[tokio::test]
async fn exchange_error_body_is_preserved() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/callback"))
        .and(query_param("code", "a b&c"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "code expired" })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpAuthBackend::new()?;
    let error = backend
        .exchange_code(&resolved(&server), "a b&c")
        .await
        .unwrap_err();

    assert!(matches!(error, BackendError::ErrorWithBody { .. }));
    assert_eq!(error.body(), Some(r#"{"error":"code expired"}"#));
    Ok(())
}

#[tokio::test]
async fn providers_are_listed_for_the_client() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/providers"))
        .and(query_param("client_id", "client"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "providers": [{ "id": "github", "name": "GitHub", "enabled": true }],
            "emailEnabled": true,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpAuthBackend::new()?;
    let list = backend
        .providers(&server.uri(), &ClientId::from_static("client"))
        .await?;

    assert_eq!(list.providers[0].id.as_str(), "github");
    assert!(list.email_enabled);
    Ok(())
}

#[tokio::test]
async fn logout_tolerates_empty_body() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let backend = HttpAuthBackend::new()?;
    backend.logout(&resolved(&server)).await?;
    Ok(())
}

#[tokio::test]
async fn session_carries_the_cookie_from_exchange_to_refresh() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    let issued = token(far_future());

    Mock::given(method("GET"))
        .and(path("/auth/callback"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=abc123; Path=/; HttpOnly")
                .set_body_json(json!({ "access_token": issued.as_str() })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(header("cookie", "sid=abc123"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": issued.as_str() })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(HttpAuthBackend::new()?);
    backend.exchange_code(&resolved(&server), "c").await?;
    let session = SessionController::builder(AuthConfig::new("client"), backend)
        .resolved(resolved(&server))
        .build()
        .await?;

    assert_eq!(session.refresh_session().await, Some(issued));
    assert!(session.state().is_authenticated());
    assert_eq!(session.state().user().map(|u| u.name.as_str()), Some("Ada"));
    Ok(())
}

#[tokio::test]
async fn session_discovers_endpoints_when_unconfigured() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/client-apps/client/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "appUrl": "https://app.test",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let session = SessionController::builder(
        AuthConfig::new("client").with_auth_url(server.uri()),
        Arc::new(HttpAuthBackend::new()?),
    )
    .build()
    .await?;

    assert_eq!(session.config().app_url(), "https://app.test");
    assert_eq!(session.config().api_url(), "https://app.test");
    Ok(())
}

#[tokio::test]
async fn sign_in_completes_when_the_exchange_body_carries_no_token() -> color_eyre::Result<()> {
    let server = MockServer::start().await;
    let issued = token(far_future());

    Mock::given(method("GET"))
        .and(path("/auth/callback"))
        .and(query_param("code", "c"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=fresh; Path=/; HttpOnly")
                .set_body_json(json!({})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(header("cookie", "sid=fresh"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": issued.as_str() })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let session = SessionController::builder(
        AuthConfig::new("client"),
        Arc::new(HttpAuthBackend::new()?),
    )
    .resolved(resolved(&server))
    .build()
    .await?;

    let return_to = AuthCallback::new(session.clone())
        .handle(&CallbackParams::from_query("code=c"))
        .await?;

    assert_eq!(return_to, "/");
    assert!(session.state().is_authenticated());
    assert_eq!(session.state().access_token(), Some(&*issued));
    Ok(())
}
