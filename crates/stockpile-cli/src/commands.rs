use std::io::{self, Write};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use stockpile_core::auth::InactivityWatcher;
use stockpile_core::{ApiError, Config, RequestGate, Role, SessionEvent, SessionStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const PASSWORD_ENV: &str = "STOCKPILE_PASSWORD";

fn prompt_username(default: Option<&str>) -> Result<String> {
    match default {
        Some(name) => print!("Username [{}]: ", name),
        None => print!("Username: "),
    }
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    let username = username.trim();
    match (username.is_empty(), default) {
        (true, Some(name)) => Ok(name.to_string()),
        _ => Ok(username.to_string()),
    }
}

fn prompt_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

fn parse_role(role: &str) -> Result<Role> {
    serde_json::from_value(Value::String(role.to_ascii_lowercase()))
        .with_context(|| format!("Unknown role '{}' (expected admin or user)", role))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Map request failures to something a terminal user can act on
fn explain(error: ApiError) -> anyhow::Error {
    match error {
        ApiError::TokenExpired => {
            anyhow::anyhow!("Session expired. Run `stockpile login` to sign in again.")
        }
        ApiError::PermissionDenied { message, .. } => {
            anyhow::anyhow!("Permission denied: {}", message)
        }
        other => other.into(),
    }
}

pub async fn login(store: &SessionStore, config: &Config, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(name) => name,
        None => prompt_username(config.last_username.as_deref())?,
    };
    if username.is_empty() {
        anyhow::bail!("Username required");
    }
    let password = prompt_password()?;

    let identity = store
        .login(&username, &password)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    if let Err(e) = Config::remember_username(&username) {
        warn!(error = %e, "Failed to save config");
    }

    println!("Signed in as {} ({})", identity.username, identity.role);
    Ok(())
}

pub async fn logout(store: &SessionStore) -> Result<()> {
    store.logout().await;
    println!("Signed out");
    Ok(())
}

pub fn whoami(store: &SessionStore) -> Result<()> {
    match store.identity() {
        Some(identity) => println!("{} ({}, id {})", identity.username, identity.role, identity.id),
        None => println!("Not signed in"),
    }
    Ok(())
}

pub fn status(store: &SessionStore) -> Result<()> {
    let Some(credential) = store.credential() else {
        println!("No session");
        return Ok(());
    };

    match credential.expires_at() {
        Some(expires_at) if credential.is_valid() => {
            let minutes = (expires_at - Utc::now()).num_minutes().max(0);
            println!("Session valid, access token expires at {} ({}m left)", expires_at, minutes);
        }
        Some(expires_at) => {
            println!("Access token expired at {}; it will be refreshed on the next request", expires_at);
        }
        None => println!("Access token has no readable expiry"),
    }
    Ok(())
}

/// Keep the session alive in the foreground until Ctrl-C, idle timeout or
/// the server ending it. The pre-emptive timer keeps the token fresh.
pub async fn watch(store: &SessionStore, config: &Config) -> Result<()> {
    let Some(identity) = store.identity() else {
        anyhow::bail!("Not signed in. Run `stockpile login` first.");
    };
    let mut events = store.subscribe_events();
    let watcher = config
        .inactivity_timeout()
        .map(|timeout| InactivityWatcher::start(store, timeout));

    println!("Watching session for {} (Ctrl-C to stop)", identity.username);
    if !store.is_valid() {
        // Bring an expired restored token back before waiting on the timer
        if let Err(e) = store.refresh().await {
            warn!(error = %e, "Initial refresh failed");
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Refreshed) => println!("Access token refreshed"),
                Ok(SessionEvent::LoggedOut { reason }) => {
                    println!("Signed out ({:?})", reason);
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    Ok(())
}

pub async fn register(store: &SessionStore, username: &str, role: Option<&str>) -> Result<()> {
    let role = role.map(parse_role).transpose()?;
    let password = prompt_password()?;

    store
        .register(username, &password, role)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    println!("Registered {}. Run `stockpile login` to sign in.", username);
    Ok(())
}

pub async fn get(store: &SessionStore, path: &str) -> Result<()> {
    let gate = RequestGate::new(store.clone());
    let value: Value = gate.get_json(path).await.map_err(explain)?;
    print_json(&value)
}

pub async fn post(store: &SessionStore, path: &str, body: &str) -> Result<()> {
    let body: Value = serde_json::from_str(body).context("Request body is not valid JSON")?;
    let gate = RequestGate::new(store.clone());
    let value: Value = gate.post_json(path, &body).await.map_err(explain)?;
    print_json(&value)
}

pub async fn delete(store: &SessionStore, path: &str) -> Result<()> {
    let gate = RequestGate::new(store.clone());
    gate.delete(path).await.map_err(explain)?;
    println!("Deleted {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role("admin").expect("admin"), Role::Admin);
        assert_eq!(parse_role("User").expect("user"), Role::User);
        assert!(parse_role("root").is_err());
    }
}
