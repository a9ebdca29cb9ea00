//! Entropy Envelope (C3): a thread-local per-scope budget that charges
//! categorized costs and fails closed on overflow.

use std::cell::RefCell;

use thiserror::Error;

/// Category of entropy-consuming operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntropySource {
    Random,
    Time,
    Uuid,
    Network,
    Filesystem,
    Provider,
}

impl EntropySource {
    /// Fixed per-call cost (§4.3).
    pub fn cost(self) -> u64 {
        match self {
            EntropySource::Random => 10,
            EntropySource::Time => 5,
            EntropySource::Uuid => 10,
            EntropySource::Network => 50,
            EntropySource::Filesystem => 3,
            EntropySource::Provider => 1,
        }
    }
}

/// Entropy envelope errors (§7).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum EntropyError {
    #[error("entropy_budget_exceeded: spent {spent} + cost {cost} > budget {budget}")]
    BudgetExceeded { spent: u64, cost: u64, budget: u64 },
    #[error("entropy_budget_exhausted")]
    BudgetExhausted,
    #[error("nested_entropy_envelope_rejected")]
    NestedEnvelopeRejected,
    #[error("no_entropy_envelope_open")]
    NoEnvelopeOpen,
}

struct EnvelopeState {
    epoch_id: String,
    budget: u64,
    spent: u64,
}

thread_local! {
    static ENVELOPE: RefCell<Option<EnvelopeState>> = const { RefCell::new(None) };
}

/// A guard representing an open entropy scope; closes the scope on drop so
/// the thread-local is always cleared regardless of unwind path.
#[derive(Debug)]
pub struct EntropyEnvelope {
    _private: (),
}

impl EntropyEnvelope {
    /// Open a new entropy scope for `epoch_id` with `budget` total units.
    /// Fails if a scope is already open on this thread — nested envelopes
    /// are rejected outright (§4.3).
    pub fn open(epoch_id: impl Into<String>, budget: u64) -> Result<Self, EntropyError> {
        ENVELOPE.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                return Err(EntropyError::NestedEnvelopeRejected);
            }
            *slot = Some(EnvelopeState {
                epoch_id: epoch_id.into(),
                budget,
                spent: 0,
            });
            Ok(())
        })?;
        Ok(Self { _private: () })
    }

    /// Epoch this envelope is scoped to.
    pub fn epoch_id(&self) -> String {
        ENVELOPE.with(|cell| {
            cell.borrow()
                .as_ref()
                .map(|s| s.epoch_id.clone())
                .unwrap_or_default()
        })
    }
}

impl Drop for EntropyEnvelope {
    fn drop(&mut self) {
        ENVELOPE.with(|cell| {
            *cell.borrow_mut() = None;
        });
    }
}

/// Charge `source`'s fixed cost against the currently open envelope.
/// Outside an envelope this only logs a warning and always succeeds (§4.4).
pub fn charge_entropy(source: EntropySource, context: &str) -> Result<(), EntropyError> {
    let cost = source.cost();
    ENVELOPE.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_mut() {
            Some(state) => {
                if state.spent + cost > state.budget {
                    tracing::error!(
                        epoch_id = %state.epoch_id,
                        source = ?source,
                        context,
                        "entropy budget exceeded"
                    );
                    return Err(EntropyError::BudgetExceeded {
                        spent: state.spent,
                        cost,
                        budget: state.budget,
                    });
                }
                state.spent += cost;
                Ok(())
            }
            None => {
                tracing::warn!(source = ?source, context, "entropy_untracked");
                Ok(())
            }
        }
    })
}

/// Spent/budget snapshot of the currently open envelope, if any.
pub fn current_usage() -> Option<(u64, u64)> {
    ENVELOPE.with(|cell| cell.borrow().as_ref().map(|s| (s.spent, s.budget)))
}
