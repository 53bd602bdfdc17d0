//! Offer filtering and ranking.
//!
//! Selection is a pure function over a snapshot of offers: drop anything
//! above the price ceiling or matching an excluded accelerator model, rank
//! the remainder cheapest first, and take the requested number.

use thiserror::Error;

use crate::provider::Offer;

/// Filtering rules applied to a raw offer snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectionPolicy {
    /// Highest acceptable price per hour in USD (inclusive).
    pub max_price: f64,
    /// Accelerator model substrings to exclude (for example `4090`).
    pub excluded_models: Vec<String>,
    /// Number of offers to provision.
    pub count: usize,
}

impl SelectionPolicy {
    /// Returns `true` when `offer` is affordable and not excluded.
    #[must_use]
    pub fn admits(&self, offer: &Offer) -> bool {
        offer.price_per_hour <= self.max_price && !self.is_excluded(offer)
    }

    fn is_excluded(&self, offer: &Offer) -> bool {
        self.excluded_models
            .iter()
            .map(|pattern| pattern.trim())
            .filter(|pattern| !pattern.is_empty())
            .any(|pattern| offer.gpu_name.contains(pattern))
    }
}

/// Output of [`select_offers`].
#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    /// Offers to provision, cheapest first.
    pub candidates: Vec<Offer>,
    /// Number of offers that passed filtering before truncation.
    pub eligible: usize,
}

/// Errors raised when the snapshot cannot satisfy the policy.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SelectionError {
    /// Nothing survived filtering.
    #[error("no offers available at or below ${max_price}/hour after exclusions")]
    NoOffersAvailable {
        /// Price ceiling rendered for display.
        max_price: String,
    },
    /// Fewer offers survived filtering than the fleet size requires.
    #[error("requested {requested} instances but only {available} offers qualify")]
    InsufficientOffers {
        /// Requested fleet size.
        requested: usize,
        /// Offers remaining after filtering.
        available: usize,
    },
}

/// Filters, ranks, and truncates `offers` according to `policy`.
///
/// Sorting is stable, so offers with equal prices keep their snapshot
/// order and repeated calls produce identical output.
///
/// # Errors
///
/// Returns [`SelectionError::NoOffersAvailable`] when no offer survives
/// filtering and [`SelectionError::InsufficientOffers`] when fewer than
/// `policy.count` survive.
pub fn select_offers(offers: &[Offer], policy: &SelectionPolicy) -> Result<Selection, SelectionError> {
    let mut eligible: Vec<Offer> = offers
        .iter()
        .filter(|offer| policy.admits(offer))
        .cloned()
        .collect();

    if eligible.is_empty() {
        return Err(SelectionError::NoOffersAvailable {
            max_price: format!("{:.2}", policy.max_price),
        });
    }

    if eligible.len() < policy.count {
        return Err(SelectionError::InsufficientOffers {
            requested: policy.count,
            available: eligible.len(),
        });
    }

    eligible.sort_by(|lhs, rhs| lhs.price_per_hour.total_cmp(&rhs.price_per_hour));
    let total = eligible.len();
    eligible.truncate(policy.count);

    Ok(Selection {
        candidates: eligible,
        eligible: total,
    })
}

#[cfg(test)]
mod tests;
