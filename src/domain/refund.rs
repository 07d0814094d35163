use chrono::DateTime;
use chrono::Utc;
use chrono_tz::Tz;

/// Which refund rule applies to a cancellation, evaluated in the session's
/// own IANA timezone:
///
/// - before local midnight of the session's start day -> full refund
/// - on the start day, before `starts_at`             -> half refund
/// - at or after `starts_at`                          -> disallowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelWindow {
    FullRefund,
    SameDay,
    TooLate,
}

/// `refund_cents` is credited back to `posted`; `penalty_cents` is the
/// (negative) remainder so the two always account for the original capture
/// exactly, even for odd fees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundSplit {
    pub refund_cents: i64,
    pub penalty_cents: i64,
}

pub fn cancel_window(
    now: DateTime<Utc>,
    starts_at: DateTime<Utc>,
    tz: Tz,
) -> CancelWindow {
    if now >= starts_at {
        return CancelWindow::TooLate;
    }
    let now_local = now.with_timezone(&tz);
    let start_local = starts_at.with_timezone(&tz);
    // comparing local calendar dates sidesteps midnight construction (and its
    // DST ambiguity) entirely
    match now_local.date_naive() < start_local.date_naive() {
        true => CancelWindow::FullRefund,
        false => CancelWindow::SameDay,
    }
}

/// Returns `None` when cancellation is disallowed.
pub fn refund_split(
    window: CancelWindow,
    total_fee_cents: i64,
) -> Option<RefundSplit> {
    match window {
        CancelWindow::FullRefund => Some(RefundSplit {
            refund_cents: total_fee_cents,
            penalty_cents: 0,
        }),
        CancelWindow::SameDay => {
            let refund = total_fee_cents / 2;
            Some(RefundSplit {
                refund_cents: refund,
                penalty_cents: -(total_fee_cents - refund),
            })
        }
        CancelWindow::TooLate => None,
    }
}
