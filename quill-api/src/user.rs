use uuid::Uuid;

use crate::{Error, STUB_UUID};

#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    bolero::generator::TypeGenerator,
    serde::Deserialize,
    serde::Serialize,
)]
pub struct UserId(#[generator(bolero::generator::gen_arbitrary())] pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

#[derive(
    Clone, Debug, Eq, PartialEq, bolero::generator::TypeGenerator, serde::Deserialize, serde::Serialize,
)]
pub struct NewUser {
    pub id: UserId,
    #[generator(bolero::generator::gen_with::<String>().len(1..20usize))]
    pub name: String,
    #[generator(bolero::generator::gen_with::<String>().len(1..20usize))]
    pub initial_password_hash: String,
}

impl NewUser {
    /// `initial_password_hash` is expected to already be a bcrypt hash
    pub fn new(id: UserId, name: String, initial_password_hash: String) -> NewUser {
        NewUser {
            id,
            name,
            initial_password_hash,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.name)?;
        crate::validate_string(&self.initial_password_hash)?;
        // `:` would make basic-auth style logins ambiguous
        if self.name.is_empty()
            || self
                .name
                .chars()
                .any(|c| c == ':' || c.is_whitespace() || c.is_control())
        {
            return Err(Error::InvalidName(self.name.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> NewUser {
        NewUser::new(UserId::stub(), String::from(name), String::from("hash"))
    }

    #[test]
    fn validate_names() {
        assert_eq!(user("alice").validate(), Ok(()));
        assert_eq!(
            user("al ice").validate(),
            Err(Error::InvalidName(String::from("al ice")))
        );
        assert_eq!(
            user("al:ice").validate(),
            Err(Error::InvalidName(String::from("al:ice")))
        );
        assert_eq!(user("").validate(), Err(Error::InvalidName(String::new())));
        assert_eq!(
            user("a\0").validate(),
            Err(Error::NullByteInString(String::from("a\0")))
        );
    }
}
