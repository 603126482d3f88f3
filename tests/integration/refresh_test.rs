//! Credential injection and single-flight refresh against a live HTTP server
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use mockito::Matcher;
use serde_json::json;

use crate::test_harness::{config_for, grant_body, token_for, SlowRefreshApi, TestEnvironment};
use session_core::{SessionCore, SessionError};

/// Calls carry a credential only while the session is valid
#[tokio::test]
async fn test_authorization_attached_only_while_valid() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let stale = token_for("ana", 1);

    let with_token = server
        .mock("GET", "/profile")
        .match_header("authorization", format!("Bearer {}", stale).as_str())
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;
    let without_token = server
        .mock("GET", "/public")
        .match_header("authorization", Matcher::Missing)
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let env = TestEnvironment::new(config_for(&server))?;
    env.seed_session(&stale, 0, 60)?;
    assert_eq!(env.core.client().get("/profile").await?.status(), 200);

    // Expiry is reached exactly at issued_at + expires_in
    env.clock.advance(chrono::Duration::seconds(60));
    assert_eq!(env.core.client().get("/public").await?.status(), 200);

    with_token.assert_async().await;
    without_token.assert_async().await;
    Ok(())
}

/// Many calls rejected together trigger exactly one refresh and all replay with the new credential
#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let stale = token_for("ana", 1);
    let fresh = token_for("ana", 2);

    let rejected = server
        .mock("GET", Matcher::Regex(r"^/items/\d+$".to_string()))
        .match_header("authorization", format!("Bearer {}", stale).as_str())
        .with_status(401)
        .expect(5)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", Matcher::Regex(r"^/items/\d+$".to_string()))
        .match_header("authorization", format!("Bearer {}", fresh).as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ok":true}"#)
        .expect(5)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(json!({"refreshToken": "refresh-1"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(grant_body(&fresh, "refresh-2", 3600))
        .expect(1)
        .create_async()
        .await;

    let env = TestEnvironment::new(config_for(&server))?;
    env.seed_session(&stale, 0, 3600)?;

    let client = env.core.client();
    let results = join_all((0..5).map(|i| async move { client.get(&format!("/items/{}", i)).await })).await;

    for result in results {
        assert_eq!(result?.status(), 200);
    }
    refresh.assert_async().await;
    rejected.assert_async().await;
    accepted.assert_async().await;

    let stored = env.core.store().read().expect("session is kept");
    assert_eq!(stored.access_token, fresh);
    assert_eq!(stored.refresh_token, "refresh-2");
    assert_eq!(env.core.client().coordinator().refresh_count(), 1);
    assert!(env.core.session().is_authenticated());
    Ok(())
}

/// A replayed call that is rejected again fails without a second refresh
#[tokio::test]
async fn test_second_401_fails_without_second_refresh() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let fresh = token_for("ana", 2);

    let forbidden = server
        .mock("GET", "/admin")
        .with_status(401)
        .expect(2)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(grant_body(&fresh, "refresh-2", 3600))
        .expect(1)
        .create_async()
        .await;

    let env = TestEnvironment::new(config_for(&server))?;
    env.seed_session(&token_for("ana", 1), 0, 3600)?;

    let err = env.core.client().get("/admin").await.unwrap_err();
    assert!(matches!(err, SessionError::AuthorizationExpired { .. }));

    forbidden.assert_async().await;
    refresh.assert_async().await;
    // The refreshed session itself is still usable
    assert!(env.core.store().is_present());
    Ok(())
}

/// A refresh that cannot reach the server ends the session for every waiting call
#[tokio::test]
async fn test_refresh_network_failure_expires_session_once() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let stale = token_for("ana", 1);

    let rejected = server
        .mock("GET", Matcher::Regex(r"^/orders/\d+$".to_string()))
        .with_status(401)
        .expect(3)
        .create_async()
        .await;

    let mut config = config_for(&server);
    // Nothing listens on the discard port
    config.refresh_path = "http://127.0.0.1:9/auth/refresh".to_string();
    let mut env = TestEnvironment::new(config)?;
    env.seed_session(&stale, 0, 3600)?;
    env.core.initialize().await;
    env.drain_events();

    let client = env.core.client();
    let (a, b, c) = tokio::join!(
        client.get("/orders/1"),
        client.get("/orders/2"),
        client.get("/orders/3"),
    );

    for result in [a, b, c] {
        assert!(matches!(
            result,
            Err(SessionError::AuthenticationRequired { .. })
        ));
    }
    rejected.assert_async().await;

    assert!(env.core.store().read().is_none());
    assert!(!env.core.session().is_authenticated());
    let events = env.drain_events();
    assert_eq!(TestEnvironment::count_expired(&events), 1);
    Ok(())
}

/// A rejected refresh behaves like an unreachable one
#[tokio::test]
async fn test_rejected_refresh_requires_login() -> Result<()> {
    let mut server = mockito::Server::new_async().await;

    let _me = server
        .mock("GET", "/me")
        .with_status(401)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(403)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"refresh token revoked"}"#)
        .expect(1)
        .create_async()
        .await;

    let mut env = TestEnvironment::new(config_for(&server))?;
    env.seed_session(&token_for("ana", 1), 0, 3600)?;

    let err = env.core.client().get("/me").await.unwrap_err();
    assert!(matches!(err, SessionError::AuthenticationRequired { .. }));
    refresh.assert_async().await;

    // Without a session there is nothing left to refresh
    let err = env.core.client().get("/me").await.unwrap_err();
    assert!(matches!(err, SessionError::AuthenticationRequired { .. }));
    refresh.assert_async().await;

    assert_eq!(TestEnvironment::count_expired(&env.drain_events()), 1);
    Ok(())
}

async fn wait_for_refresh(core: &SessionCore) {
    while !core.client().coordinator().is_refreshing() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Logging out while a refresh is outstanding keeps the session ended
#[tokio::test]
async fn test_logout_during_refresh_stays_logged_out() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let _orders = server
        .mock("GET", "/orders")
        .with_status(401)
        .create_async()
        .await;

    let api = Arc::new(SlowRefreshApi {
        delay: Duration::from_millis(150),
        refreshed: Ok(token_for("ana", 2)),
        login_token: token_for("bob", 1),
    });
    let mut env = TestEnvironment::with_auth_api(config_for(&server), api)?;
    env.seed_session(&token_for("ana", 1), 0, 3600)?;
    env.core.initialize().await;
    env.drain_events();

    let request = tokio::spawn({
        let client = env.core.client().clone();
        async move { client.get("/orders").await }
    });
    wait_for_refresh(&env.core).await;
    env.core.session().logout().await;
    assert!(env.core.store().read().is_none());

    let err = request.await?.unwrap_err();
    assert!(matches!(err, SessionError::AuthenticationRequired { .. }));

    assert!(env.core.store().read().is_none());
    assert!(!env.core.session().is_authenticated());
    assert_eq!(env.core.session().user_name(), None);
    let events = env.drain_events();
    assert!(!events.iter().any(|e| matches!(
        e,
        session_core::SessionEvent::SessionChanged {
            authenticated: true,
            ..
        }
    )));
    assert_eq!(TestEnvironment::count_expired(&events), 0);
    Ok(())
}

/// A refresh that fails after another user signed in leaves that session alone
#[tokio::test]
async fn test_failed_refresh_after_login_keeps_new_session() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let stale = token_for("ana", 1);
    let bob = token_for("bob", 1);

    let _rejected = server
        .mock("GET", "/orders")
        .match_header("authorization", format!("Bearer {}", stale).as_str())
        .with_status(401)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", "/orders")
        .match_header("authorization", format!("Bearer {}", bob).as_str())
        .with_status(200)
        .with_body("[]")
        .expect(1)
        .create_async()
        .await;

    let api = Arc::new(SlowRefreshApi {
        delay: Duration::from_millis(150),
        refreshed: Err(SessionError::RefreshFailure {
            reason: "refresh token revoked".to_string(),
        }),
        login_token: bob.clone(),
    });
    let mut env = TestEnvironment::with_auth_api(config_for(&server), api)?;
    env.seed_session(&stale, 0, 3600)?;
    env.core.initialize().await;
    env.drain_events();

    let request = tokio::spawn({
        let client = env.core.client().clone();
        async move { client.get("/orders").await }
    });
    wait_for_refresh(&env.core).await;
    env.core.session().login("bob", "x").await?;

    // The waiting call replays with the credential that replaced the old one
    assert_eq!(request.await??.status(), 200);
    accepted.assert_async().await;

    assert_eq!(env.core.store().read().map(|r| r.access_token), Some(bob));
    assert!(env.core.session().is_authenticated());
    assert_eq!(env.core.session().user_name().as_deref(), Some("bob"));
    assert_eq!(TestEnvironment::count_expired(&env.drain_events()), 0);
    Ok(())
}
