//! Class booking state machine.
//!
//! ```text
//! book ──► booked ──┬─► attended
//!   │        ▲      ├─► no_show
//!   │        │      └─► cancelled
//!   └─► waitlist ───────► cancelled
//!          (promoted when a booked seat is cancelled, FIFO by booked_at)
//! ```
//!
//! Every path runs in one unit of work holding the occurrence row and every
//! affected client ledger, so the seat freed by a cancellation goes to the
//! waitlist head before any concurrent booking can see it.

use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::MAX_REGISTRATIONS_PER_CLASS;
use crate::model::*;
use crate::notify::Notification;
use crate::outbox::OutboxItem;
use crate::sync::{SyncEntity, SyncRequest};

use super::ledger;
use super::tx::UnitOfWork;
use super::{Engine, EngineError, Entity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOutcome {
    pub registration_id: Ulid,
    pub status: RegistrationStatus,
    pub payment_status: PaymentStatus,
    pub credits_used: u32,
}

/// The waitlisted registration that took a freed seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub registration_id: Ulid,
    pub client_id: Ulid,
    pub payment_status: PaymentStatus,
    pub credits_used: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub registration_id: Ulid,
    pub previous_status: RegistrationStatus,
    pub refunded_credits: u32,
    pub unpaid_reduced_cents: i64,
    pub promoted: Option<Promotion>,
}

struct Charge {
    payment_status: PaymentStatus,
    credits_used: u32,
    debits: Vec<Ulid>,
}

fn record_audit(
    uow: &mut UnitOfWork<'_>,
    actor: Actor,
    action: AuditAction,
    before: Option<&ClassRegistration>,
    after: &ClassRegistration,
) {
    let entry = AuditEntry {
        id: Ulid::new(),
        at: uow.now,
        actor,
        action,
        occurrence_id: after.occurrence_id,
        registration_id: after.id,
        before: before.map(ClassRegistration::snapshot),
        after: after.snapshot(),
    };
    uow.write_audit(entry);
}

/// Pay for a seat: credits when the client has enough, otherwise the class
/// price goes on the unpaid balance.
fn charge_seat(
    uow: &mut UnitOfWork<'_>,
    occurrence: &ClassOccurrence,
    client_id: Ulid,
) -> Result<Charge, EngineError> {
    let now = uow.now;
    let required = occurrence.credits_required;
    let account = uow.ledger_mut(client_id)?;
    if ledger::available_credits(&account.passes, now) >= required {
        let debits = ledger::deduct_credits(account, required, now)?;
        uow.write_passes(client_id, &debits)?;
        metrics::counter!(crate::observability::CREDITS_DEDUCTED_TOTAL).increment(required as u64);
        Ok(Charge {
            payment_status: PaymentStatus::Paid,
            credits_used: required,
            debits,
        })
    } else {
        let balance = account.unpaid_balance_cents + occurrence.unpaid_charge_cents();
        uow.write_unpaid_balance(client_id, balance)?;
        Ok(Charge {
            payment_status: PaymentStatus::Unpaid,
            credits_used: 0,
            debits: Vec::new(),
        })
    }
}

/// Undo a seat's charge. Returns (credits returned, cents taken off the balance).
fn refund_seat(
    uow: &mut UnitOfWork<'_>,
    occurrence: &ClassOccurrence,
    registration: &ClassRegistration,
) -> Result<(u32, i64), EngineError> {
    let client_id = registration.client_id;
    match registration.payment_status {
        PaymentStatus::Paid => {
            let now = uow.now;
            let returned = ledger::return_debits(uow.ledger_mut(client_id)?, &registration.debits, now);
            if returned < registration.debits.len() as u32 {
                warn!(
                    "registration {}: only {returned} of {} credits could be returned",
                    registration.id,
                    registration.debits.len()
                );
            }
            uow.write_passes(client_id, &registration.debits)?;
            metrics::counter!(crate::observability::CREDITS_REFUNDED_TOTAL).increment(returned as u64);
            Ok((returned, 0))
        }
        PaymentStatus::Unpaid => {
            let balance = uow.ledger(client_id)?.unpaid_balance_cents;
            let reduced = occurrence.unpaid_charge_cents().min(balance).max(0);
            if reduced > 0 {
                uow.write_unpaid_balance(client_id, balance - reduced)?;
            }
            Ok((0, reduced))
        }
        PaymentStatus::Pending => Ok((0, 0)),
    }
}

/// Move the waitlisted registration `candidate` into the seat just freed.
fn promote(
    uow: &mut UnitOfWork<'_>,
    occurrence: &ClassOccurrence,
    candidate: Ulid,
    actor: Actor,
) -> Result<Promotion, EngineError> {
    let before = uow
        .occurrence()?
        .registrations
        .iter()
        .find(|r| r.id == candidate)
        .cloned()
        .ok_or(EngineError::NotFound(Entity::Registration, candidate))?;
    let charge = charge_seat(uow, occurrence, before.client_id)?;
    let after = ClassRegistration {
        status: RegistrationStatus::Booked,
        payment_status: charge.payment_status,
        credits_used: charge.credits_used,
        debits: charge.debits,
        ..before.clone()
    };
    uow.write_registration(after.clone());
    record_audit(uow, actor, AuditAction::Promoted, Some(&before), &after);
    uow.queue(OutboxItem::Notify(Notification::WaitlistPromoted {
        occurrence_id: occurrence.id,
        client_id: after.client_id,
        registration_id: after.id,
        payment_status: after.payment_status,
    }));
    metrics::counter!(crate::observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
    Ok(Promotion {
        registration_id: after.id,
        client_id: after.client_id,
        payment_status: after.payment_status,
        credits_used: after.credits_used,
    })
}

impl Engine {
    pub async fn book_class(
        &self,
        occurrence_id: Ulid,
        client_id: Ulid,
        actor: Actor,
    ) -> Result<BookingOutcome, EngineError> {
        self.require_client(client_id)?;
        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_occurrence(occurrence_id).await?;
        uow.lock_ledgers(&[client_id]).await?;
        let now = uow.now;

        let state = uow.occurrence()?;
        let occurrence = state.occurrence.clone();
        let reason = match occurrence.status {
            ClassStatus::Cancelled => Some("class is cancelled"),
            ClassStatus::Completed => Some("class is completed"),
            ClassStatus::Scheduled if occurrence.span.start <= now => Some("class has already started"),
            ClassStatus::Scheduled => None,
        };
        if let Some(reason) = reason {
            return Err(EngineError::ClassNotBookable { occurrence_id, reason });
        }
        if let Some(existing) = state.active_registration(client_id) {
            return Err(EngineError::AlreadyRegistered {
                registration_id: existing.id,
                occurrence_id,
                client_id,
                span: occurrence.span,
            });
        }
        if state.registrations.len() >= MAX_REGISTRATIONS_PER_CLASS {
            return Err(EngineError::LimitExceeded("too many registrations for class"));
        }
        let full = state.is_full();
        // Strictly increasing per class so FIFO order is commit order.
        let booked_at = state
            .registrations
            .iter()
            .map(|r| r.booked_at + 1)
            .max()
            .map_or(now, |next| next.max(now));

        let mut registration = ClassRegistration {
            id: Ulid::new(),
            occurrence_id,
            client_id,
            status: RegistrationStatus::Waitlist,
            booked_at,
            credits_used: 0,
            payment_status: PaymentStatus::Pending,
            debits: Vec::new(),
        };
        if !full {
            let charge = charge_seat(&mut uow, &occurrence, client_id)?;
            registration.status = RegistrationStatus::Booked;
            registration.payment_status = charge.payment_status;
            registration.credits_used = charge.credits_used;
            registration.debits = charge.debits;
        }
        uow.write_registration(registration.clone());

        let (action, notification) = if full {
            (
                AuditAction::Waitlisted,
                Notification::Waitlisted {
                    occurrence_id,
                    client_id,
                    registration_id: registration.id,
                },
            )
        } else {
            (
                AuditAction::Booked,
                Notification::BookingConfirmed {
                    occurrence_id,
                    client_id,
                    registration_id: registration.id,
                    payment_status: registration.payment_status,
                },
            )
        };
        record_audit(&mut uow, actor, action, None, &registration);
        uow.queue(OutboxItem::Notify(notification));
        uow.commit().await?;

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "status" => registration.status.as_str())
            .increment(1);
        info!(
            "client {client_id} {} for class {occurrence_id} ({})",
            registration.status.as_str(),
            registration.payment_status.as_str()
        );
        Ok(BookingOutcome {
            registration_id: registration.id,
            status: registration.status,
            payment_status: registration.payment_status,
            credits_used: registration.credits_used,
        })
    }

    pub async fn cancel_class_booking(
        &self,
        occurrence_id: Ulid,
        client_id: Ulid,
        actor: Actor,
    ) -> Result<CancelOutcome, EngineError> {
        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_occurrence(occurrence_id).await?;
        let now = uow.now;

        let state = uow.occurrence()?;
        let occurrence = state.occurrence.clone();
        let before = state
            .active_registration(client_id)
            .or_else(|| state.latest_registration(client_id))
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Registration, client_id))?;
        if !before.status.is_active() {
            return Err(EngineError::InvalidTransition {
                id: before.id,
                from: before.status.as_str(),
                action: "cancel",
            });
        }
        let starts_in_ms = occurrence.span.start - now;
        if starts_in_ms < self.policy.free_cancellation_window_ms() && !actor.privileged {
            metrics::counter!(crate::observability::CANCELLATIONS_LOCKED_TOTAL).increment(1);
            return Err(EngineError::CancellationLocked {
                occurrence_id,
                starts_in_ms,
                window_hours: self.policy.free_cancellation_hours,
            });
        }
        let candidate = (before.status == RegistrationStatus::Booked
            && occurrence.status == ClassStatus::Scheduled
            && occurrence.span.start > now)
            .then(|| state.next_waitlisted().map(|r| (r.id, r.client_id)))
            .flatten();

        let mut clients = vec![client_id];
        clients.extend(candidate.map(|(_, c)| c));
        uow.lock_ledgers(&clients).await?;

        let after = ClassRegistration {
            status: RegistrationStatus::Cancelled,
            ..before.clone()
        };
        uow.write_registration(after.clone());
        record_audit(&mut uow, actor, AuditAction::Cancelled, Some(&before), &after);
        let (refunded_credits, unpaid_reduced_cents) = refund_seat(&mut uow, &occurrence, &before)?;
        uow.queue(OutboxItem::Notify(Notification::BookingCancelled {
            occurrence_id,
            client_id,
            registration_id: before.id,
            refunded_credits,
        }));

        let promoted = match candidate {
            Some((registration_id, _)) => Some(promote(&mut uow, &occurrence, registration_id, actor)?),
            None => None,
        };
        uow.commit().await?;

        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
        info!(
            "client {client_id} cancelled {} for class {occurrence_id}: {refunded_credits} credits, {unpaid_reduced_cents} cents returned",
            before.status.as_str()
        );
        if let Some(p) = &promoted {
            info!("client {} promoted from waitlist for class {occurrence_id}", p.client_id);
        }
        Ok(CancelOutcome {
            registration_id: before.id,
            previous_status: before.status,
            refunded_credits,
            unpaid_reduced_cents,
            promoted,
        })
    }

    /// Close out a booked seat after the class: attended or no-show.
    pub async fn mark_attendance(
        &self,
        occurrence_id: Ulid,
        client_id: Ulid,
        attended: bool,
        actor: Actor,
    ) -> Result<ClassRegistration, EngineError> {
        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_occurrence(occurrence_id).await?;
        let state = uow.occurrence()?;
        if state.occurrence.status == ClassStatus::Cancelled {
            return Err(EngineError::ClassNotBookable {
                occurrence_id,
                reason: "class is cancelled",
            });
        }
        let before = state
            .registrations
            .iter()
            .filter(|r| r.client_id == client_id)
            .max_by_key(|r| (r.booked_at, r.id))
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Registration, client_id))?;
        if before.status != RegistrationStatus::Booked {
            return Err(EngineError::InvalidTransition {
                id: before.id,
                from: before.status.as_str(),
                action: "mark attendance for",
            });
        }
        let (status, action) = if attended {
            (RegistrationStatus::Attended, AuditAction::Attended)
        } else {
            (RegistrationStatus::NoShow, AuditAction::NoShow)
        };
        let after = ClassRegistration { status, ..before.clone() };
        uow.write_registration(after.clone());
        record_audit(&mut uow, actor, action, Some(&before), &after);
        uow.commit().await?;
        info!("client {client_id} {} class {occurrence_id}", status.as_str());
        Ok(after)
    }

    /// Cancel a whole class. Every active registration is cancelled with a
    /// full refund regardless of the cancellation window.
    pub async fn cancel_class(&self, occurrence_id: Ulid, actor: Actor) -> Result<ClassOccurrence, EngineError> {
        let (room_id, trainer_id) = self.class_resources(occurrence_id).await?;
        let mut uow = UnitOfWork::begin(self).await?;
        uow.lock_resources(&[room_id], &[trainer_id]).await?;
        uow.lock_occurrence(occurrence_id).await?;

        let state = uow.occurrence()?;
        let mut occurrence = state.occurrence.clone();
        if occurrence.status != ClassStatus::Scheduled {
            return Err(EngineError::InvalidTransition {
                id: occurrence_id,
                from: occurrence.status.as_str(),
                action: "cancel",
            });
        }
        let active: Vec<ClassRegistration> = state
            .registrations
            .iter()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect();
        let clients: Vec<Ulid> = active.iter().map(|r| r.client_id).collect();
        uow.lock_ledgers(&clients).await?;

        occurrence.status = ClassStatus::Cancelled;
        uow.write_class(occurrence.clone());
        for before in &active {
            let after = ClassRegistration {
                status: RegistrationStatus::Cancelled,
                ..before.clone()
            };
            uow.write_registration(after.clone());
            record_audit(&mut uow, actor, AuditAction::Cancelled, Some(before), &after);
            let (refunded_credits, _) = refund_seat(&mut uow, &occurrence, before)?;
            uow.queue(OutboxItem::Notify(Notification::ClassCancelled {
                occurrence_id,
                client_id: before.client_id,
                registration_id: before.id,
                refunded_credits,
            }));
        }
        uow.queue(OutboxItem::Sync(SyncRequest::delete(
            SyncEntity::ClassOccurrence,
            occurrence_id,
        )));
        uow.commit().await?;
        info!("class {occurrence_id} cancelled, {} registrations released", active.len());
        Ok(occurrence)
    }
}
