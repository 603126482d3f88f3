//! Login, logout and persistence through the wired session core
use anyhow::Result;
use mockito::Matcher;
use serde_json::json;

use crate::test_harness::{config_for, grant_body, token_for, TestEnvironment};
use session_core::{FileStorage, NavigationDecision, SessionEvent, SessionError};

#[tokio::test]
async fn test_login_populates_store_and_state() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let token = token_for("ana", 1);

    let login = server
        .mock("POST", "/auth/login")
        .match_body(Matcher::Json(json!({"usuario": "ana", "password": "x"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(grant_body(&token, "refresh-1", 3600))
        .expect(1)
        .create_async()
        .await;

    let mut env = TestEnvironment::new(config_for(&server))?;
    let identity = env.core.session().login("ana", "x").await?;
    login.assert_async().await;

    assert_eq!(identity.user_name(), "ana");
    assert_eq!(identity.user_id, json!(42));
    assert!(env.core.session().is_authenticated());
    assert_eq!(env.core.session().user_name().as_deref(), Some("ana"));
    assert!(env.core.session().has_role("USER"));

    let stored = env.core.store().read().expect("session stored");
    assert_eq!(stored.access_token, token);
    assert_eq!(stored.refresh_token, "refresh-1");
    assert_eq!(stored.token_type, "Bearer");
    assert_eq!(stored.expires_in_seconds, 3600);

    let events = env.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::LoginSucceeded { user } if user.subject == "ana")));
    assert!(!env.core.tracker().any_blocking());
    Ok(())
}

#[tokio::test]
async fn test_invalid_login_changes_nothing() -> Result<()> {
    let mut server = mockito::Server::new_async().await;

    let _login = server
        .mock("POST", "/auth/login")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"Usuario o contraseña incorrectos"}"#)
        .create_async()
        .await;

    let mut env = TestEnvironment::new(config_for(&server))?;
    let before = env.core.session().state();

    let err = env.core.session().login("ana", "wrong").await.unwrap_err();
    assert_eq!(
        err,
        SessionError::AuthenticationFailure {
            message: "Usuario o contraseña incorrectos".to_string()
        }
    );
    assert!(env.core.store().read().is_none());
    assert_eq!(env.core.session().state(), before);
    assert!(env.drain_events().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stale_record_is_cleared_on_navigation() -> Result<()> {
    let server = mockito::Server::new_async().await;
    let env = TestEnvironment::new(config_for(&server))?;
    env.seed_session(&token_for("ana", 1), 4000, 3600)?;

    assert!(!env.core.initialize().await);
    assert!(env.core.store().is_present());

    assert_eq!(
        env.core.session().guard_navigation(true),
        NavigationDecision::RedirectToLogin
    );
    assert!(env.core.store().read().is_none());
    Ok(())
}

#[tokio::test]
async fn test_logout_notifies_server_and_clears() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let token = token_for("ana", 1);

    let logout = server
        .mock("POST", "/auth/logout")
        .match_header("authorization", format!("Bearer {}", token).as_str())
        .match_body(Matcher::Json(json!({"refreshToken": "refresh-1"})))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let mut env = TestEnvironment::new(config_for(&server))?;
    env.seed_session(&token, 0, 3600)?;
    env.core.initialize().await;
    env.drain_events();

    env.core.session().logout().await;
    logout.assert_async().await;

    assert!(env.core.store().read().is_none());
    assert!(!env.core.session().is_authenticated());
    assert!(env
        .drain_events()
        .contains(&SessionEvent::LoggedOut { forced: false }));
    Ok(())
}

#[tokio::test]
async fn test_logout_survives_server_error() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let _logout = server
        .mock("POST", "/auth/logout")
        .with_status(500)
        .create_async()
        .await;

    let env = TestEnvironment::new(config_for(&server))?;
    env.seed_session(&token_for("ana", 1), 0, 3600)?;

    env.core.session().logout().await;
    assert!(env.core.store().read().is_none());
    Ok(())
}

#[tokio::test]
async fn test_session_persists_across_restarts() -> Result<()> {
    let mut server = mockito::Server::new_async().await;
    let token = token_for("ana", 1);
    let _login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(grant_body(&token, "refresh-1", 3600))
        .create_async()
        .await;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.json");

    {
        let env = TestEnvironment::with_storage(
            config_for(&server),
            Box::new(FileStorage::new(path.clone())),
        )?;
        env.core.session().login("ana", "x").await?;
    }

    let env = TestEnvironment::with_storage(config_for(&server), Box::new(FileStorage::new(path)))?;
    assert!(env.core.initialize().await);
    assert_eq!(env.core.session().user_name().as_deref(), Some("ana"));
    assert_eq!(
        env.core.store().read().map(|r| r.access_token),
        Some(token)
    );
    Ok(())
}
