mod chat_service;

pub use chat_service::{
    ChatListing, ChatService, ChatServiceDependencies, PrivateChatEntry, SendMessageRequest,
};

#[cfg(test)]
mod chat_service_tests;
