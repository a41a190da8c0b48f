use uuid::Uuid;

use crate::{Error, STUB_UUID};

#[derive(Clone, Debug, bolero::generator::TypeGenerator, serde::Deserialize, serde::Serialize)]
pub struct NewSession {
    pub user: String,
    pub password: String,
    pub device: String,
}

impl NewSession {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.user)?;
        crate::validate_string(&self.password)?;
        crate::validate_string(&self.device)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthToken(pub Uuid);

impl AuthToken {
    pub fn stub() -> AuthToken {
        AuthToken(STUB_UUID)
    }
}
