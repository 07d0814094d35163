mod allocation;
mod guest_name;
mod ledger_kind;
mod refund;
mod registration_state;
mod session_status;
mod submission_key;
mod user_email;
mod wallet;

pub use allocation::plan_allocation;
pub use allocation::AllocationPlan;
pub use allocation::SeatOutcome;
pub use guest_name::normalize_guests;
pub use guest_name::GuestName;
pub use guest_name::MAX_GUESTS;
pub use ledger_kind::EntryStatus;
pub use ledger_kind::LedgerKind;
pub use ledger_kind::WalletDelta;
pub use refund::cancel_window;
pub use refund::refund_split;
pub use refund::CancelWindow;
pub use refund::RefundSplit;
pub use registration_state::RegistrationState;
pub use session_status::SessionStatus;
pub use submission_key::SubmissionKey;
pub use user_email::UserEmail;
pub use wallet::WalletSummary;
