/// Registration state tag. `canceled` is terminal; a canceled row always has
/// `waitlist_pos = NULL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Confirmed,
    Waitlisted,
    Canceled,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Waitlisted => "waitlisted",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "confirmed" => Ok(Self::Confirmed),
            "waitlisted" => Ok(Self::Waitlisted),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("invalid registration state: {other:?}")),
        }
    }
}
