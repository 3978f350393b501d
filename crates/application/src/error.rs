use domain::{DomainError, ErrorKind, RepositoryError, Timestamp};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("broadcast error: {0}")]
    Broadcast(#[from] crate::broadcaster::BroadcastError),
    /// 当日发送次数已达上限
    #[error("daily message limit reached, resets at {reset_at}")]
    RateLimited { reset_at: Timestamp },
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
    #[error("authentication failed")]
    Authentication,
    #[error("authorization failed")]
    Authorization,
}

impl ApplicationError {
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApplicationError::Domain(err) => err.kind(),
            ApplicationError::Repository(err) => err.kind(),
            ApplicationError::RateLimited { .. } => ErrorKind::RateLimited,
            ApplicationError::Authentication | ApplicationError::Authorization => {
                ErrorKind::Authorization
            }
            ApplicationError::Broadcast(_) | ApplicationError::Infrastructure(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// 可以安全返回给调用方的描述，内部错误不暴露细节
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
