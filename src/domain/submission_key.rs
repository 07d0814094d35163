/// The `Idempotency-Key` header on a registration submission: an opaque,
/// trimmed string of 6..=120 characters. Repeated submissions with the same
/// key (within the idempotency TTL) map to the same request.
#[derive(Debug, Clone)]
pub struct SubmissionKey(String);

impl TryFrom<String> for SubmissionKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_string();
        if value.len() < 6 {
            return Err("idempotency key must be at least 6 characters".into());
        }
        if value.len() > 120 {
            return Err("idempotency key cannot be longer than 120 characters".into());
        }
        Ok(Self(value))
    }
}

impl AsRef<str> for SubmissionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
