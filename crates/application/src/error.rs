use domain::{DomainError, RepositoryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("infrastructure error: {message}")]
    Infrastructure { message: String },
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
        }
    }

    pub fn is_not_a_member(&self) -> bool {
        matches!(self, Self::Domain(DomainError::NotAMember))
    }

    pub fn is_chat_not_found(&self) -> bool {
        matches!(self, Self::Domain(DomainError::ChatNotFound))
    }
}
