use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Single shared password for every login; the user name is not checked.
#[derive(Debug, Clone)]
pub struct SharedPassword {
    password: Vec<u8>,
}

impl SharedPassword {
    pub fn new(password: &str) -> Self {
        Self { password: password.as_bytes().to_vec() }
    }
}

#[async_trait]
impl AuthSource for SharedPassword {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = login.user().unwrap_or("-"), "password login");
        Ok(Password::new(None, self.password.clone()))
    }
}
