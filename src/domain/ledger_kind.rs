/// Closed set of ledger entry kinds. The sign rules and wallet deltas live
/// here, next to the tag, so every writer shares one canonical table:
///
/// | kind         | status | sign     | wallet effect      |
/// |--------------|--------|----------|--------------------|
/// | deposit_in   | posted | non-zero | posted += amount   |
/// | refund       | posted | > 0      | posted += amount   |
/// | fee_capture  | posted | < 0      | posted += amount   |
/// | penalty      | posted | < 0      | posted += amount   |
/// | hold         | held   | > 0      | holds  += amount   |
/// | hold_release | posted | < 0      | holds  += amount   |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    DepositIn,
    Hold,
    HoldRelease,
    FeeCapture,
    Refund,
    Penalty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Posted,
    Held,
}

/// Signed change to apply to the wallet totals for one ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletDelta {
    pub posted_cents: i64,
    pub holds_cents: i64,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Posted => "posted",
            Self::Held => "held",
        }
    }
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DepositIn => "deposit_in",
            Self::Hold => "hold",
            Self::HoldRelease => "hold_release",
            Self::FeeCapture => "fee_capture",
            Self::Refund => "refund",
            Self::Penalty => "penalty",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "deposit_in" => Ok(Self::DepositIn),
            "hold" => Ok(Self::Hold),
            "hold_release" => Ok(Self::HoldRelease),
            "fee_capture" => Ok(Self::FeeCapture),
            "refund" => Ok(Self::Refund),
            "penalty" => Ok(Self::Penalty),
            other => Err(format!("unknown ledger kind: {other:?}")),
        }
    }

    pub fn entry_status(&self) -> EntryStatus {
        match self {
            Self::Hold => EntryStatus::Held,
            _ => EntryStatus::Posted,
        }
    }

    /// Canonical sign rule. `deposit_in` only requires non-zero: negative
    /// deposits are administrative corrections (the db check constraint is
    /// the source of truth and matches this).
    pub fn validate_amount(
        &self,
        amount_cents: i64,
    ) -> Result<(), String> {
        let ok = match self {
            Self::DepositIn => amount_cents != 0,
            Self::Hold | Self::Refund => amount_cents > 0,
            Self::HoldRelease | Self::FeeCapture | Self::Penalty => amount_cents < 0,
        };
        match ok {
            true => Ok(()),
            false => Err(format!(
                "{} must not use amount_cents = {amount_cents}",
                self.as_str()
            )),
        }
    }

    pub fn wallet_delta(
        &self,
        amount_cents: i64,
    ) -> WalletDelta {
        match self {
            Self::Hold | Self::HoldRelease => WalletDelta {
                posted_cents: 0,
                holds_cents: amount_cents,
            },
            Self::DepositIn | Self::Refund | Self::FeeCapture | Self::Penalty => WalletDelta {
                posted_cents: amount_cents,
                holds_cents: 0,
            },
        }
    }
}
