/// What happens to a single seat (the host's or one guest's) at allocation
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatOutcome {
    Confirmed,
    Waitlisted,
}

/// Decision for one registration request, before any row is written. Parties
/// are split into 1-seat rows so the waitlist stays per-seat FIFO and guest
/// seats can be canceled independently; this plan assigns each of those rows
/// its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub host: SeatOutcome,
    /// One outcome per normalized guest, in submission order
    pub guests: Vec<SeatOutcome>,
    /// A group key ties the split rows together; it is also assigned to a
    /// solo host who lands on the waitlist so later guest-adds can join the
    /// group
    pub needs_group_key: bool,
}

impl AllocationPlan {
    pub fn confirmed_seats(&self) -> usize {
        let host = matches!(self.host, SeatOutcome::Confirmed) as usize;
        host + self
            .guests
            .iter()
            .filter(|g| matches!(g, SeatOutcome::Confirmed))
            .count()
    }

    pub fn waitlisted_seats(&self) -> usize {
        1 + self.guests.len() - self.confirmed_seats()
    }
}

/// Decide confirm-vs-waitlist for a party of `1 + guest_count` seats.
///
/// Fairness-first: if the session already has ANY waitlisted row, the whole
/// party queues at the tail even when seats remain (the head may simply be
/// too large to fit; newcomers must not leapfrog it). With an empty waitlist,
/// the host is privileged in partial fit (a guest-only confirmation is
/// meaningless), then guests are confirmed in submission order while seats
/// remain.
pub fn plan_allocation(
    remaining: i64,
    waitlist_exists: bool,
    guest_count: usize,
) -> AllocationPlan {
    let total_seats = 1 + guest_count as i64;

    if waitlist_exists || remaining == 0 {
        return AllocationPlan {
            host: SeatOutcome::Waitlisted,
            guests: vec![SeatOutcome::Waitlisted; guest_count],
            needs_group_key: true,
        };
    }

    if remaining >= total_seats {
        return AllocationPlan {
            host: SeatOutcome::Confirmed,
            guests: vec![SeatOutcome::Confirmed; guest_count],
            needs_group_key: guest_count > 0,
        };
    }

    // partial fit: host first, then guests in order
    let mut left = remaining - 1;
    let guests = (0..guest_count)
        .map(|_| {
            if left > 0 {
                left -= 1;
                SeatOutcome::Confirmed
            } else {
                SeatOutcome::Waitlisted
            }
        })
        .collect();
    AllocationPlan {
        host: SeatOutcome::Confirmed,
        guests,
        needs_group_key: true,
    }
}
