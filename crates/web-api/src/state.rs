use std::sync::Arc;

use application::ChatService;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub jwt_service: Arc<JwtService>,
}

impl AppState {
    pub fn new(chat_service: Arc<ChatService>, jwt_service: Arc<JwtService>) -> Self {
        Self {
            chat_service,
            jwt_service,
        }
    }
}
