//! Credit ledger rules as pure functions over a client's passes.
//!
//! Everything here runs on a working copy of a `ClientLedger` while the
//! caller holds the client's row lock; nothing caches an ordering between calls.

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Outcome of a refund. A refund with nowhere to go is reported, not dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded {
        pass: Pass,
        /// Credits actually added; less than requested when clamped at `total_credits`.
        applied: u32,
    },
    Unapplied {
        count: u32,
    },
}

impl RefundOutcome {
    pub fn applied(&self) -> u32 {
        match self {
            RefundOutcome::Refunded { applied, .. } => *applied,
            RefundOutcome::Unapplied { .. } => 0,
        }
    }
}

/// The pass the next deduction comes from: soonest `valid_until` first, then
/// the oldest purchase, then id.
pub fn select_pass(passes: &[Pass], now: Ms) -> Option<&Pass> {
    passes
        .iter()
        .filter(|p| p.is_available(now))
        .min_by_key(|p| (p.valid_until, p.created_at, p.id))
}

/// Refund target when the caller names no pass: the most recently updated pass
/// that still has room below `total_credits`.
pub fn select_refund_target(passes: &[Pass]) -> Option<&Pass> {
    passes
        .iter()
        .filter(|p| p.has_room())
        .max_by_key(|p| (p.updated_at, p.created_at, p.id))
}

pub fn available_credits(passes: &[Pass], now: Ms) -> u32 {
    passes
        .iter()
        .filter(|p| p.is_available(now))
        .map(|p| p.credits_left)
        .sum()
}

fn debit(pass: &mut Pass, now: Ms) {
    debug_assert!(pass.credits_left > 0);
    pass.credits_left -= 1;
    pass.status = if pass.credits_left == 0 {
        PassStatus::Depleted
    } else {
        pass.window_status(now)
    };
    pass.updated_at = now;
}

fn credit(pass: &mut Pass, count: u32, now: Ms) -> u32 {
    let applied = count.min(pass.total_credits - pass.credits_left);
    if applied == 0 {
        return 0;
    }
    pass.credits_left += applied;
    if pass.status == PassStatus::Depleted {
        pass.status = pass.window_status(now);
    }
    pass.updated_at = now;
    applied
}

/// Take `count` credits, one at a time in selection order. All or nothing:
/// returns one pass id per credit taken.
pub(crate) fn deduct_credits(
    ledger: &mut ClientLedger,
    count: u32,
    now: Ms,
) -> Result<Vec<Ulid>, EngineError> {
    if available_credits(&ledger.passes, now) < count {
        return Err(EngineError::NoCreditsAvailable(ledger.id));
    }
    let mut debits = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let pass_id = select_pass(&ledger.passes, now)
            .map(|p| p.id)
            .ok_or(EngineError::NoCreditsAvailable(ledger.id))?;
        if let Some(pass) = ledger.passes.iter_mut().find(|p| p.id == pass_id) {
            debit(pass, now);
        }
        debits.push(pass_id);
    }
    Ok(debits)
}

pub(crate) fn refund_credits(
    ledger: &mut ClientLedger,
    count: u32,
    pass_id: Option<Ulid>,
    now: Ms,
) -> Result<RefundOutcome, EngineError> {
    if count == 0 {
        return Err(EngineError::InvalidInput("refund count must be positive"));
    }
    let target = match pass_id {
        Some(id) => Some(
            ledger
                .pass(id)
                .map(|p| p.id)
                .ok_or(EngineError::NotFound(super::Entity::Pass, id))?,
        ),
        None => select_refund_target(&ledger.passes).map(|p| p.id),
    };
    let Some(target) = target else {
        return Ok(RefundOutcome::Unapplied { count });
    };
    let Some(pass) = ledger.passes.iter_mut().find(|p| p.id == target) else {
        return Ok(RefundOutcome::Unapplied { count });
    };
    let applied = credit(pass, count, now);
    if applied == 0 {
        return Ok(RefundOutcome::Unapplied { count });
    }
    Ok(RefundOutcome::Refunded {
        pass: pass.clone(),
        applied,
    })
}

/// Return each debited credit to the pass it came from.
pub(crate) fn return_debits(ledger: &mut ClientLedger, debits: &[Ulid], now: Ms) -> u32 {
    let mut returned = 0;
    for pass_id in debits {
        if let Some(pass) = ledger.passes.iter_mut().find(|p| p.id == *pass_id) {
            returned += credit(pass, 1, now);
        }
    }
    returned
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Ms = 24 * HOUR_MS;
    const NOW: Ms = 1_800_000_000_000;

    fn pass(credits_left: u32, total: u32, valid_until: Ms, created_at: Ms) -> Pass {
        Pass {
            id: Ulid::new(),
            client_id: Ulid::nil(),
            total_credits: total,
            credits_left,
            valid_from: NOW - 30 * DAY,
            valid_until,
            status: if credits_left == 0 {
                PassStatus::Depleted
            } else {
                PassStatus::Active
            },
            created_at,
            updated_at: created_at,
        }
    }

    fn ledger(passes: Vec<Pass>) -> ClientLedger {
        let mut l = ClientLedger::new(Ulid::nil(), None);
        l.passes = passes;
        l
    }

    #[test]
    fn soonest_expiring_pass_goes_first() {
        let a = pass(3, 3, NOW + 7 * DAY, NOW - 2 * DAY);
        let b = pass(5, 5, NOW + 30 * DAY, NOW - 5 * DAY);
        let passes = vec![b.clone(), a.clone()];
        assert_eq!(select_pass(&passes, NOW).map(|p| p.id), Some(a.id));
    }

    #[test]
    fn expiry_tie_goes_to_oldest_purchase() {
        let newer = pass(2, 2, NOW + 7 * DAY, NOW - DAY);
        let older = pass(2, 2, NOW + 7 * DAY, NOW - 3 * DAY);
        let passes = vec![newer, older.clone()];
        assert_eq!(select_pass(&passes, NOW).map(|p| p.id), Some(older.id));
    }

    #[test]
    fn unavailable_passes_are_skipped() {
        let depleted = pass(0, 5, NOW + DAY, 0);
        let expired = pass(5, 5, NOW - 1, 0);
        let mut future = pass(5, 5, NOW + 60 * DAY, 0);
        future.valid_from = NOW + DAY;
        let passes = vec![depleted, expired, future];
        assert!(select_pass(&passes, NOW).is_none());
        assert_eq!(available_credits(&passes, NOW), 0);
    }

    #[test]
    fn deduct_last_credit_depletes() {
        let mut l = ledger(vec![pass(1, 3, NOW + DAY, 0)]);
        let debits = deduct_credits(&mut l, 1, NOW).unwrap();
        assert_eq!(debits.len(), 1);
        assert_eq!(l.passes[0].credits_left, 0);
        assert_eq!(l.passes[0].status, PassStatus::Depleted);
        assert_eq!(l.passes[0].updated_at, NOW);

        let err = deduct_credits(&mut l, 1, NOW).unwrap_err();
        assert!(matches!(err, EngineError::NoCreditsAvailable(_)));
        assert_eq!(l.passes[0].credits_left, 0);
    }

    #[test]
    fn multi_credit_deduction_spans_passes_in_order() {
        let a = pass(1, 1, NOW + DAY, 0);
        let b = pass(4, 4, NOW + 2 * DAY, 0);
        let mut l = ledger(vec![b.clone(), a.clone()]);
        let debits = deduct_credits(&mut l, 2, NOW).unwrap();
        assert_eq!(debits, vec![a.id, b.id]);
        assert_eq!(l.pass(a.id).unwrap().status, PassStatus::Depleted);
        assert_eq!(l.pass(b.id).unwrap().credits_left, 3);
    }

    #[test]
    fn multi_credit_deduction_is_all_or_nothing() {
        let mut l = ledger(vec![pass(1, 1, NOW + DAY, 0)]);
        assert!(deduct_credits(&mut l, 2, NOW).is_err());
        assert_eq!(l.passes[0].credits_left, 1);
    }

    #[test]
    fn refund_to_named_pass_reactivates_and_clamps() {
        let p = pass(0, 2, NOW + DAY, 0);
        let mut l = ledger(vec![p.clone()]);
        let outcome = refund_credits(&mut l, 5, Some(p.id), NOW).unwrap();
        match outcome {
            RefundOutcome::Refunded { pass, applied } => {
                assert_eq!(applied, 2);
                assert_eq!(pass.credits_left, 2);
                assert_eq!(pass.status, PassStatus::Active);
            }
            other => panic!("expected refund, got {other:?}"),
        }
    }

    #[test]
    fn refund_to_depleted_pass_outside_window_expires_it() {
        let p = pass(0, 2, NOW - 1, 0);
        let mut l = ledger(vec![p.clone()]);
        refund_credits(&mut l, 1, Some(p.id), NOW).unwrap();
        assert_eq!(l.passes[0].status, PassStatus::Expired);
        assert_eq!(l.passes[0].credits_left, 1);
    }

    #[test]
    fn refund_to_depleted_pass_before_window_is_pending() {
        let mut p = pass(0, 2, NOW + 60 * DAY, 0);
        p.valid_from = NOW + DAY;
        let mut l = ledger(vec![p.clone()]);
        refund_credits(&mut l, 1, Some(p.id), NOW).unwrap();
        assert_eq!(l.passes[0].status, PassStatus::Pending);
        assert_eq!(available_credits(&l.passes, NOW), 0);
        assert_eq!(available_credits(&l.passes, NOW + DAY), 1);
    }

    #[test]
    fn debit_activates_opened_pending_pass() {
        let mut p = pass(3, 3, NOW + 30 * DAY, 0);
        p.valid_from = NOW - DAY;
        p.status = PassStatus::Pending;
        let mut l = ledger(vec![p]);
        deduct_credits(&mut l, 1, NOW).unwrap();
        assert_eq!((l.passes[0].credits_left, l.passes[0].status), (2, PassStatus::Active));
    }

    #[test]
    fn refund_without_pass_prefers_most_recently_updated() {
        let mut stale = pass(1, 5, NOW + DAY, 0);
        stale.updated_at = NOW - DAY;
        let mut recent = pass(1, 5, NOW + 2 * DAY, 0);
        recent.updated_at = NOW - HOUR_MS;
        let mut full = pass(5, 5, NOW + DAY, 0);
        full.updated_at = NOW;
        let mut l = ledger(vec![stale, recent.clone(), full]);
        let outcome = refund_credits(&mut l, 1, None, NOW).unwrap();
        match outcome {
            RefundOutcome::Refunded { pass, .. } => assert_eq!(pass.id, recent.id),
            other => panic!("expected refund, got {other:?}"),
        }
    }

    #[test]
    fn refund_with_no_target_is_reported() {
        let mut l = ledger(vec![pass(3, 3, NOW + DAY, 0)]);
        let outcome = refund_credits(&mut l, 2, None, NOW).unwrap();
        assert_eq!(outcome, RefundOutcome::Unapplied { count: 2 });
        assert_eq!(outcome.applied(), 0);
    }

    #[test]
    fn refund_unknown_pass_is_not_found() {
        let mut l = ledger(vec![]);
        let err = refund_credits(&mut l, 1, Some(Ulid::new()), NOW).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(..)));
    }

    #[test]
    fn debits_return_to_their_passes() {
        let a = pass(1, 1, NOW + DAY, 0);
        let b = pass(1, 1, NOW + 2 * DAY, 0);
        let mut l = ledger(vec![a.clone(), b.clone()]);
        let debits = deduct_credits(&mut l, 2, NOW).unwrap();
        assert_eq!(return_debits(&mut l, &debits, NOW), 2);
        assert_eq!(l.pass(a.id).unwrap().credits_left, 1);
        assert_eq!(l.pass(b.id).unwrap().credits_left, 1);
        assert!(l.passes.iter().all(|p| p.status == PassStatus::Active));
    }
}
