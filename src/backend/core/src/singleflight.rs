//! Single-flight computation coalescing.
//!
//! For every `(attribute, target)` pair at most one compute body runs at a
//! time; contenders attach to the in-flight slot and receive the same outcome
//! (success or failure). A slot is a one-shot broadcast: the leader publishes
//! exactly one result, and a drop guard releases the slot on every exit path
//! — completion, timeout, error, or panic.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::definition::AttributeValue;
use crate::error::{ErrorCode, FacetError};

// ═══════════════════════════════════════════════════════════════════════════════
// Shared Outcomes
// ═══════════════════════════════════════════════════════════════════════════════

/// A failure shared with followers. The leader keeps the full error (with its
/// original cause); followers receive a rebuilt error carrying the same code
/// and message.
#[derive(Debug, Clone)]
pub struct FlightFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&FacetError> for FlightFailure {
    fn from(error: &FacetError) -> Self {
        Self {
            code: error.code(),
            message: error.message().to_string(),
        }
    }
}

impl From<FlightFailure> for FacetError {
    fn from(failure: FlightFailure) -> Self {
        FacetError::new(failure.code, failure.message)
    }
}

/// The outcome published on a flight's channel.
pub type FlightResult = std::result::Result<AttributeValue, FlightFailure>;

// ═══════════════════════════════════════════════════════════════════════════════
// Flight Table
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared table of in-flight computations keyed by `attribute:target`.
#[derive(Clone, Default)]
pub struct SingleFlight {
    flights: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
}

/// What a caller got when entering a flight.
pub enum FlightSlot {
    /// This caller installed the slot and must run the computation
    Leader(FlightGuard),
    /// Another computation is in flight; await its result
    Follower(broadcast::Receiver<FlightResult>),
}

impl SingleFlight {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the flight for `key`. Installation is atomic: exactly one
    /// concurrent caller becomes the leader.
    pub fn begin(&self, key: &str) -> FlightSlot {
        match self.flights.entry(key.to_string()) {
            Entry::Occupied(occupied) => FlightSlot::Follower(occupied.get().subscribe()),
            Entry::Vacant(vacant) => {
                let (sender, _) = broadcast::channel(1);
                vacant.insert(sender.clone());
                FlightSlot::Leader(FlightGuard {
                    key: key.to_string(),
                    flights: Arc::clone(&self.flights),
                    sender,
                    released: false,
                })
            }
        }
    }

    /// Number of computations currently in flight.
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Flight Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// Leader-side handle on a flight slot.
///
/// The slot is removed from the table *before* the result is published, so a
/// caller arriving afterwards starts a fresh computation instead of waiting
/// on a channel that will never speak again. Dropping the guard without
/// completing (panic, abandonment) also releases the slot; followers then
/// observe a closed channel.
pub struct FlightGuard {
    key: String,
    flights: Arc<DashMap<String, broadcast::Sender<FlightResult>>>,
    sender: broadcast::Sender<FlightResult>,
    released: bool,
}

impl FlightGuard {
    /// Publish the outcome to every follower and release the slot.
    pub fn complete(mut self, result: FlightResult) {
        self.release();
        let _ = self.sender.send(result);
    }

    fn release(&mut self) {
        if !self.released {
            self.flights.remove(&self.key);
            self.released = true;
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Await a follower slot's outcome.
pub async fn await_follower(
    mut receiver: broadcast::Receiver<FlightResult>,
) -> crate::error::Result<AttributeValue> {
    match receiver.recv().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(failure)) => Err(failure.into()),
        Err(_) => Err(FacetError::internal(
            "In-flight computation was abandoned before publishing a result",
        )),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_single_leader_many_followers() {
        let flights = SingleFlight::new();

        let FlightSlot::Leader(guard) = flights.begin("a:u1") else {
            panic!("first caller must lead");
        };

        let mut followers = Vec::new();
        for _ in 0..5 {
            match flights.begin("a:u1") {
                FlightSlot::Follower(rx) => followers.push(rx),
                FlightSlot::Leader(_) => panic!("only one leader per key"),
            }
        }
        assert_eq!(flights.len(), 1);

        guard.complete(Ok(json!(42)));

        for rx in followers {
            assert_eq!(await_follower(rx).await.unwrap(), json!(42));
        }
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_failure_shared_with_followers() {
        let flights = SingleFlight::new();

        let FlightSlot::Leader(guard) = flights.begin("a:u1") else {
            panic!("expected leader");
        };
        let FlightSlot::Follower(rx) = flights.begin("a:u1") else {
            panic!("expected follower");
        };

        let error = FacetError::computation_timeout("a", 100);
        guard.complete(Err(FlightFailure::from(&error)));

        let received = await_follower(rx).await.unwrap_err();
        assert_eq!(received.code(), ErrorCode::ComputationTimeout);
    }

    #[tokio::test]
    async fn test_slot_released_on_drop_without_completion() {
        let flights = SingleFlight::new();

        let FlightSlot::Leader(guard) = flights.begin("a:u1") else {
            panic!("expected leader");
        };
        let FlightSlot::Follower(rx) = flights.begin("a:u1") else {
            panic!("expected follower");
        };

        drop(guard);
        assert!(flights.is_empty());

        let error = await_follower(rx).await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::InternalError);

        // The key is free again
        assert!(matches!(flights.begin("a:u1"), FlightSlot::Leader(_)));
    }

    #[tokio::test]
    async fn test_distinct_keys_fly_independently() {
        let flights = SingleFlight::new();
        let FlightSlot::Leader(g1) = flights.begin("a:u1") else {
            panic!()
        };
        let FlightSlot::Leader(g2) = flights.begin("a:u2") else {
            panic!()
        };
        assert_eq!(flights.len(), 2);
        g1.complete(Ok(json!(1)));
        g2.complete(Ok(json!(2)));
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_caller_after_completion_leads_fresh_flight() {
        let flights = SingleFlight::new();
        let FlightSlot::Leader(guard) = flights.begin("a:u1") else {
            panic!()
        };
        guard.complete(Ok(json!(1)));

        assert!(matches!(flights.begin("a:u1"), FlightSlot::Leader(_)));
    }
}
