use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Memory a package asked the platform to set aside before its exports are created (texture
/// mips in the engine this was modelled on).
pub trait PendingReservations: Send {
    fn has_completed(&self) -> bool;

    /// Gives up on reservations that haven't been fulfilled. With `only_unclaimed` set,
    /// reservations that completed but were never used are released as well. Returns how many
    /// were canceled.
    fn cancel_remaining(
        &mut self,
        only_unclaimed: bool,
    ) -> usize;
}

pub trait ReservationService: Send + Sync {
    fn reserve(
        &self,
        package_name: &str,
        sizes: &[u32],
    ) -> Box<dyn PendingReservations>;
}

/// Every reservation is fulfilled as soon as it is made
#[derive(Default)]
pub struct ImmediateReservations;

struct CompletedReservations {
    count: usize,
}

impl PendingReservations for CompletedReservations {
    fn has_completed(&self) -> bool {
        true
    }

    fn cancel_remaining(
        &mut self,
        only_unclaimed: bool,
    ) -> usize {
        if only_unclaimed {
            std::mem::take(&mut self.count)
        } else {
            0
        }
    }
}

impl ReservationService for ImmediateReservations {
    fn reserve(
        &self,
        _package_name: &str,
        sizes: &[u32],
    ) -> Box<dyn PendingReservations> {
        Box::new(CompletedReservations { count: sizes.len() })
    }
}

#[derive(Default)]
struct ManualReservationState {
    completed: AtomicBool,
    reserved: AtomicUsize,
    canceled: AtomicUsize,
}

/// Reservations stay pending until `complete_all` is called. Used to exercise loads that have to
/// wait on the platform.
#[derive(Default, Clone)]
pub struct ManualReservations {
    state: Arc<ManualReservationState>,
}

impl ManualReservations {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn complete_all(&self) {
        self.state.completed.store(true, Ordering::Release);
    }

    pub fn reserved_count(&self) -> usize {
        self.state.reserved.load(Ordering::Acquire)
    }

    pub fn canceled_count(&self) -> usize {
        self.state.canceled.load(Ordering::Acquire)
    }
}

struct ManualTicket {
    state: Arc<ManualReservationState>,
    outstanding: usize,
}

impl PendingReservations for ManualTicket {
    fn has_completed(&self) -> bool {
        self.outstanding == 0 || self.state.completed.load(Ordering::Acquire)
    }

    fn cancel_remaining(
        &mut self,
        only_unclaimed: bool,
    ) -> usize {
        if self.has_completed() && !only_unclaimed {
            return 0;
        }
        let canceled = std::mem::take(&mut self.outstanding);
        self.state.canceled.fetch_add(canceled, Ordering::AcqRel);
        canceled
    }
}

impl ReservationService for ManualReservations {
    fn reserve(
        &self,
        _package_name: &str,
        sizes: &[u32],
    ) -> Box<dyn PendingReservations> {
        self.state.reserved.fetch_add(sizes.len(), Ordering::AcqRel);
        Box::new(ManualTicket {
            state: self.state.clone(),
            outstanding: sizes.len(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manual_reservations_wait_for_completion() {
        let service = ManualReservations::new();
        let mut ticket = service.reserve("A", &[1024, 2048]);
        assert!(!ticket.has_completed());
        service.complete_all();
        assert!(ticket.has_completed());
        assert_eq!(ticket.cancel_remaining(false), 0);
        assert_eq!(service.reserved_count(), 2);
    }

    #[test]
    fn cancel_gives_up_pending_reservations() {
        let service = ManualReservations::new();
        let mut ticket = service.reserve("A", &[1024, 2048, 64]);
        assert_eq!(ticket.cancel_remaining(false), 3);
        assert!(ticket.has_completed());
        assert_eq!(service.canceled_count(), 3);
    }

    #[test]
    fn empty_reservations_are_complete() {
        let ticket = ImmediateReservations.reserve("A", &[]);
        assert!(ticket.has_completed());
        assert!(ManualReservations::new().reserve("B", &[]).has_completed());
    }
}
