//! REST API for operating the proxy: backends and online players.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use crate::directory::{BackendDirectory, BackendTarget};
use crate::session::SessionRegistry;

/// Kick message used when the operator gives none.
const DEFAULT_KICK_REASON: &str = "Kicked by an operator";

/// Shared state of the API handlers.
#[derive(Debug, Clone)]
pub struct ApiState {
    pub directory: Arc<BackendDirectory>,
    pub registry: Arc<SessionRegistry>,
}

/// Backend representation in the REST API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerDto {
    pub name: String,
    pub address: String,
    pub enabled: bool,
    pub available: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub players: usize,
}

/// Online player representation in the REST API.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlayerDto {
    pub name: String,
    pub uuid: String,
    pub server: String,
    pub address: String,
}

/// Request to register a new backend.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub address: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

const fn enabled_by_default() -> bool {
    true
}

/// Request to move a player.
#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub server: String,
}

/// Request to disconnect a player.
#[derive(Debug, Default, Deserialize)]
pub struct KickRequest {
    pub reason: Option<String>,
}

/// Generic API response.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    const fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

fn not_found(what: &str, name: &str) -> Reply {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(format!("{what} '{name}' not found"))),
    )
}

/// Create the REST API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/servers", get(list_servers).post(register_server))
        .route("/servers/{name}", delete(deregister_server))
        .route("/servers/{name}/enable", post(enable_server))
        .route("/servers/{name}/disable", post(disable_server))
        .route("/players", get(list_players))
        .route("/players/{name}/switch", post(switch_player))
        .route("/players/{name}/kick", post(kick_player))
        .with_state(state)
}

/// GET /servers - List all registered backends.
async fn list_servers(State(state): State<ApiState>) -> Json<Vec<ServerDto>> {
    let sessions = state.registry.list();
    let servers = state
        .directory
        .list()
        .into_iter()
        .map(|s| ServerDto {
            players: sessions
                .iter()
                .filter(|p| p.current_server() == s.name)
                .count(),
            name: s.name,
            address: s.addr,
            enabled: s.enabled,
            available: s.health.available,
            consecutive_failures: s.health.consecutive_failures,
            last_error: s.health.last_error,
        })
        .collect();

    Json(servers)
}

/// POST /servers - Register a new backend.
async fn register_server(State(state): State<ApiState>, Json(req): Json<RegisterRequest>) -> Reply {
    let mut target = BackendTarget::new(req.name.clone(), req.address.clone());
    target.enabled = req.enabled;

    if state.directory.register(target) {
        tracing::info!(name = %req.name, addr = %req.address, enabled = req.enabled, "Server registered");
        (StatusCode::CREATED, Json(ApiResponse::success()))
    } else {
        (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(format!(
                "Server '{}' already exists",
                req.name
            ))),
        )
    }
}

/// DELETE /servers/:name - Deregister a backend.
///
/// Players already on it stay until they leave or are moved.
async fn deregister_server(State(state): State<ApiState>, Path(name): Path<String>) -> Reply {
    if state.directory.deregister(&name).is_some() {
        tracing::info!(name = %name, "Server deregistered");
        (StatusCode::OK, Json(ApiResponse::success()))
    } else {
        not_found("Server", &name)
    }
}

/// POST /servers/:name/enable - Enable a backend.
async fn enable_server(State(state): State<ApiState>, Path(name): Path<String>) -> Reply {
    set_enabled(&state, &name, true)
}

/// POST /servers/:name/disable - Disable a backend.
async fn disable_server(State(state): State<ApiState>, Path(name): Path<String>) -> Reply {
    set_enabled(&state, &name, false)
}

fn set_enabled(state: &ApiState, name: &str, enabled: bool) -> Reply {
    if state.directory.set_enabled(name, enabled) {
        tracing::info!(name = %name, enabled, "Server availability changed");
        (StatusCode::OK, Json(ApiResponse::success()))
    } else {
        not_found("Server", name)
    }
}

/// GET /players - List online players.
async fn list_players(State(state): State<ApiState>) -> Json<Vec<PlayerDto>> {
    let mut players: Vec<_> = state
        .registry
        .list()
        .into_iter()
        .map(|handle| {
            let player = handle.player();
            PlayerDto {
                name: player.name.clone(),
                uuid: player.uuid.to_string(),
                server: handle.current_server(),
                address: player.addr.to_string(),
            }
        })
        .collect();
    players.sort_by(|a, b| a.name.cmp(&b.name));

    Json(players)
}

/// POST /players/:name/switch - Move a player to another backend.
///
/// Answers once the player has been handed to the new backend.
async fn switch_player(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<SwitchRequest>,
) -> Reply {
    let Some(handle) = state.registry.find_by_name(&name) else {
        return not_found("Player", &name);
    };

    match handle.switch_backend(&req.server).await {
        Ok(()) => {
            tracing::info!(player = %name, server = %req.server, "Player switched");
            (StatusCode::OK, Json(ApiResponse::success()))
        }
        Err(e) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// POST /players/:name/kick - Disconnect a player.
async fn kick_player(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Option<Json<KickRequest>>,
) -> Reply {
    let Some(handle) = state.registry.find_by_name(&name) else {
        return not_found("Player", &name);
    };

    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| DEFAULT_KICK_REASON.to_string());

    if handle.kick(reason) {
        tracing::info!(player = %name, "Player kicked");
        (StatusCode::OK, Json(ApiResponse::success()))
    } else {
        (
            StatusCode::CONFLICT,
            Json(ApiResponse::error(format!("Player '{name}' is leaving"))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    fn state() -> ApiState {
        ApiState {
            directory: Arc::new(BackendDirectory::new(NetworkConfig::default())),
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    fn register(name: &str, enabled: bool) -> Json<RegisterRequest> {
        Json(RegisterRequest {
            name: name.to_string(),
            address: "127.0.0.1:25566".to_string(),
            enabled,
        })
    }

    #[tokio::test]
    async fn test_server_lifecycle() {
        let state = state();

        let (status, _) = register_server(State(state.clone()), register("lobby", true)).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = register_server(State(state.clone()), register("lobby", true)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = disable_server(State(state.clone()), Path("lobby".to_string())).await;
        assert_eq!(status, StatusCode::OK);

        let Json(servers) = list_servers(State(state.clone())).await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "lobby");
        assert!(!servers[0].enabled);
        assert_eq!(servers[0].players, 0);

        let (status, _) = enable_server(State(state.clone()), Path("lobby".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.directory.resolve("lobby").is_ok());

        let (status, _) = deregister_server(State(state.clone()), Path("lobby".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = deregister_server(State(state.clone()), Path("lobby".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_defaults_to_enabled() {
        let req: RegisterRequest =
            serde_json::from_str(r#"{"name":"survival","address":"10.0.0.2:25565"}"#).unwrap();
        assert!(req.enabled);
    }

    #[tokio::test]
    async fn test_unknown_player() {
        let state = state();

        let Json(players) = list_players(State(state.clone())).await;
        assert!(players.is_empty());

        let (status, Json(body)) = switch_player(
            State(state.clone()),
            Path("Steve".to_string()),
            Json(SwitchRequest {
                server: "lobby".to_string(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!body.success);

        let (status, _) = kick_player(State(state), Path("Steve".to_string()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
