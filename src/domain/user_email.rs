use validator::ValidateEmail;

/// A user's login email. Uniqueness (case-insensitive) is enforced by the
/// `citext` column; this type only guards the shape.
#[derive(Debug)]
pub struct UserEmail(String);

impl UserEmail {
    pub fn parse(email: String) -> Result<Self, String> {
        ValidateEmail::validate_email(&email)
            .then_some(Self(email.clone()))
            .ok_or(format!("invalid email: {email:?}"))
    }
}

impl AsRef<str> for UserEmail {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
