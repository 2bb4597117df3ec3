/// Source of the bearer token attached to chat requests
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Sends requests without an `Authorization` header
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn bearer_token(&self) -> Option<String> {
        None
    }
}

pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.clone())
        }
    }
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn bearer_token(&self) -> Option<String> {
        self()
    }
}
