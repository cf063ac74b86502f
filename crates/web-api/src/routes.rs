use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use application::ChatListing;
use domain::{ChatRef, DisplayName, GroupId, Message, MessageId, UserId, UserProfile};

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ChatTypeParam {
    Private,
    Group,
}

/// 会话定位参数。私聊由请求方身份 + 对端身份定位，
/// 服务端负责构造确定性键；客户端从不提交排序后的键。
#[derive(Debug, Deserialize)]
struct HistoryQuery {
    chat_type: ChatTypeParam,
    peer_id: Option<Uuid>,
    group_id: Option<Uuid>,
    before: Option<i64>,
    limit: Option<u32>,
}

fn resolve_chat(me: UserId, query: &HistoryQuery) -> Result<ChatRef, ApiError> {
    match query.chat_type {
        ChatTypeParam::Private => {
            let peer_id = query
                .peer_id
                .ok_or_else(|| ApiError::bad_request("peer_id is required for private chats"))?;
            ChatRef::private(me, UserId::from(peer_id))
                .map_err(|err| ApiError::bad_request(err.to_string()))
        }
        ChatTypeParam::Group => {
            let group_id = query
                .group_id
                .ok_or_else(|| ApiError::bad_request("group_id is required for group chats"))?;
            Ok(ChatRef::group(GroupId::from(group_id)))
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/chats", get(list_chats))
        .route("/messages", get(get_history))
        .route("/messages/{message_id}/read", axum::routing::post(mark_read))
        .route(
            "/messages/{message_id}",
            axum::routing::delete(delete_message),
        )
        .route("/ws", get(websocket_upgrade))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ChatListing>, ApiError> {
    let user_id = state.jwt_service.extract_user_from_headers(&headers)?;
    let listing = state.chat_service.list_chats(UserId::from(user_id)).await?;
    Ok(Json(listing))
}

async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let user_id = UserId::from(state.jwt_service.extract_user_from_headers(&headers)?);
    let chat = resolve_chat(user_id, &query)?;
    let limit = query.limit.unwrap_or(50).min(100);

    let messages = state
        .chat_service
        .get_messages(user_id, chat, query.before.map(MessageId::from), limit)
        .await?;
    Ok(Json(messages))
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let user_id = UserId::from(state.jwt_service.extract_user_from_headers(&headers)?);
    state
        .chat_service
        .mark_read(user_id, MessageId::from(message_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let user_id = UserId::from(state.jwt_service.extract_user_from_headers(&headers)?);
    state
        .chat_service
        .delete_message(user_id, MessageId::from(message_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// WebSocket 握手经 query 参数携带 token：浏览器的 WebSocket
/// API 不支持自定义 header。
#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let claims = state.jwt_service.verify_token(&query.token)?;
    let display_name = claims
        .name
        .as_deref()
        .and_then(|name| DisplayName::parse(name).ok())
        .unwrap_or_else(DisplayName::anonymous);
    let profile = UserProfile::new(UserId::from(claims.sub), display_name);

    Ok(ws.on_upgrade(move |socket| async move {
        WebSocketConnection::new(socket, state, profile).run().await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(chat_type: ChatTypeParam, peer_id: Option<Uuid>, group_id: Option<Uuid>) -> HistoryQuery {
        HistoryQuery {
            chat_type,
            peer_id,
            group_id,
            before: None,
            limit: None,
        }
    }

    #[test]
    fn private_query_builds_pair_from_requester_and_peer() {
        let me = UserId::from(Uuid::new_v4());
        let peer = Uuid::new_v4();

        let chat = resolve_chat(me, &query(ChatTypeParam::Private, Some(peer), None)).unwrap();
        assert_eq!(chat, ChatRef::private(me, UserId::from(peer)).unwrap());
    }

    #[test]
    fn private_query_without_peer_is_bad_request() {
        let me = UserId::from(Uuid::new_v4());
        assert!(resolve_chat(me, &query(ChatTypeParam::Private, None, None)).is_err());
    }

    #[test]
    fn private_query_with_self_as_peer_is_bad_request() {
        let me = UserId::from(Uuid::new_v4());
        let result = resolve_chat(me, &query(ChatTypeParam::Private, Some(me.0), None));
        assert!(result.is_err());
    }

    #[test]
    fn group_query_requires_group_id() {
        let me = UserId::from(Uuid::new_v4());
        assert!(resolve_chat(me, &query(ChatTypeParam::Group, None, None)).is_err());

        let group = Uuid::new_v4();
        let chat = resolve_chat(me, &query(ChatTypeParam::Group, None, Some(group))).unwrap();
        assert_eq!(chat, ChatRef::group(GroupId::from(group)));
    }
}
