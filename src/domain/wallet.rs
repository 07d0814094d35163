/// Snapshot of a user's wallet totals. `available` is derived, never stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalletSummary {
    pub posted_cents: i64,
    pub holds_cents: i64,
}

impl WalletSummary {
    pub fn available_cents(&self) -> i64 {
        self.posted_cents - self.holds_cents
    }
}
