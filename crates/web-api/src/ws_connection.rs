use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use application::{ConnectionHandle, SendMessageRequest, ServerEvent};
use domain::{ChatRef, DomainError, GroupId, MessageKind, UserId, UserProfile};

use crate::state::AppState;

/// 入站事件（客户端 → 服务端）。
///
/// 私聊消息只携带对端身份；确定性键由服务端从已认证的
/// 请求方身份构造，客户端无法伪造发送者。
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ClientEvent {
    SendMessage {
        #[serde(flatten)]
        target: ChatTarget,
        content: String,
        #[serde(default = "default_kind")]
        kind: MessageKind,
    },
    TypingStart {
        #[serde(flatten)]
        target: ChatTarget,
    },
    TypingStop {
        #[serde(flatten)]
        target: ChatTarget,
    },
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

#[derive(Debug, Deserialize)]
#[serde(tag = "chat_type", rename_all = "snake_case")]
enum ChatTarget {
    Private { peer_id: Uuid },
    Group { group_id: Uuid },
}

impl ChatTarget {
    fn to_chat_ref(&self, me: UserId) -> Result<ChatRef, DomainError> {
        match self {
            Self::Private { peer_id } => ChatRef::private(me, UserId::from(*peer_id)),
            Self::Group { group_id } => Ok(ChatRef::group(GroupId::from(*group_id))),
        }
    }
}

/// WebSocket 连接管理器
///
/// 封装单个 WebSocket 连接的生命周期：在注册表登记连接、
/// 排空事件通道写入网络、解析入站事件并分发给扇出引擎、
/// 断开时注销清理。
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    profile: UserProfile,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, state: AppState, profile: UserProfile) -> Self {
        Self {
            socket,
            state,
            profile,
        }
    }

    /// 运行连接主循环，返回即连接结束且已清理。
    pub async fn run(self) {
        let user_id = self.profile.id;
        let (mut sender, mut incoming) = self.socket.split();

        // 注册表持有通道发送端，扇出引擎经由它推送事件；
        // 本任务独占排空接收端，写入速度慢的客户端不会阻塞引擎
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let handle = self.state.chat_service.connect(self.profile, event_tx).await;

        tracing::info!(
            user_id = %user_id,
            connection_id = %handle.id(),
            "WebSocket 连接已建立"
        );

        let send_task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let payload = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::warn!(error = %err, "序列化出站事件失败");
                        continue;
                    }
                };
                if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
        });

        let recv_state = self.state.clone();
        let recv_handle = handle.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(Ok(message)) = incoming.next().await {
                match message {
                    WsMessage::Close(_) => break,
                    WsMessage::Text(text) => {
                        Self::dispatch(&recv_state, &recv_handle, user_id, text.as_str()).await;
                    }
                    // Ping/Pong 由协议层应答，Binary 不在协议内
                    _ => {}
                }
            }
        });

        // 任意一个任务结束即视为连接断开
        tokio::select! {
            _ = send_task => {}
            _ = recv_task => {}
        }

        self.state
            .chat_service
            .disconnect(user_id, handle.id())
            .await;

        tracing::info!(
            user_id = %user_id,
            connection_id = %handle.id(),
            "WebSocket 连接已断开"
        );
    }

    /// 解析并分发一条入站事件。
    ///
    /// 解析失败或业务拒绝只回发错误事件给本连接，
    /// 从不中断连接本身。
    async fn dispatch(state: &AppState, handle: &ConnectionHandle, user_id: UserId, raw: &str) {
        let event: ClientEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(err) => {
                let _ = handle.push(ServerEvent::Error {
                    message: format!("invalid client event: {}", err),
                });
                return;
            }
        };

        match event {
            ClientEvent::SendMessage {
                target,
                content,
                kind,
            } => {
                let chat = match target.to_chat_ref(user_id) {
                    Ok(chat) => chat,
                    Err(err) => {
                        let _ = handle.push(ServerEvent::Error {
                            message: err.to_string(),
                        });
                        return;
                    }
                };
                if let Err(err) = state
                    .chat_service
                    .send_message(SendMessageRequest {
                        sender_id: user_id,
                        chat,
                        content,
                        kind,
                    })
                    .await
                {
                    let _ = handle.push(ServerEvent::Error {
                        message: err.to_string(),
                    });
                }
            }
            ClientEvent::TypingStart { target } => {
                if let Ok(chat) = target.to_chat_ref(user_id) {
                    state.chat_service.typing_start(user_id, chat).await;
                }
            }
            ClientEvent::TypingStop { target } => {
                if let Ok(chat) = target.to_chat_ref(user_id) {
                    state.chat_service.typing_stop(user_id, chat).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_message_event_parses_with_default_kind() {
        let peer = Uuid::new_v4();
        let raw = format!(
            r#"{{"event":"send_message","chat_type":"private","peer_id":"{peer}","content":"hi"}}"#
        );

        let event: ClientEvent = serde_json::from_str(&raw).unwrap();
        match event {
            ClientEvent::SendMessage {
                target: ChatTarget::Private { peer_id },
                content,
                kind,
            } => {
                assert_eq!(peer_id, peer);
                assert_eq!(content, "hi");
                assert_eq!(kind, MessageKind::Text);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn typing_event_parses_group_target() {
        let group = Uuid::new_v4();
        let raw = format!(r#"{{"event":"typing_start","chat_type":"group","group_id":"{group}"}}"#);

        let event: ClientEvent = serde_json::from_str(&raw).unwrap();
        match event {
            ClientEvent::TypingStart {
                target: ChatTarget::Group { group_id },
            } => assert_eq!(group_id, group),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        let raw = r#"{"event":"join_room","room_id":"x"}"#;
        assert!(serde_json::from_str::<ClientEvent>(raw).is_err());
    }

    #[test]
    fn private_target_with_own_id_is_rejected() {
        let me = UserId::from(Uuid::new_v4());
        let target = ChatTarget::Private { peer_id: me.0 };
        assert!(target.to_chat_ref(me).is_err());
    }
}
