//! Declarative listing filters.
//!
//! A [`FilterDoc`] is the structured JSON document stored on each monitoring
//! task. Evaluation is pure and total: every recognized predicate must hold
//! for a listing to match, and unknown keys in the stored document are
//! tolerated and ignored.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::listing::Listing;

/// Item families with distinct pattern seed ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternItemType {
    /// Weapon skins; seeds range 0..=999.
    Skin,
    /// Keychains (charms); seeds range 0..=99999.
    Keychain,
}

impl PatternItemType {
    /// Largest valid pattern seed for this item family.
    pub fn max_seed(self) -> i64 {
        match self {
            PatternItemType::Skin => 999,
            PatternItemType::Keychain => 99_999,
        }
    }
}

/// Pattern membership filter, gated by the item family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternListFilter {
    /// Item family the seeds belong to.
    pub item_type: PatternItemType,
    /// Seeds to match; a listing matches when its seed is in this set.
    pub seeds: Vec<i64>,
}

/// Structured filter document evaluated against each listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterDoc {
    /// Match if `price_cents <= max_price`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<i64>,

    /// Match if `price_cents >= min_price`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_price: Option<i64>,

    /// Inclusive upper bound on wear.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wear_max: Option<f64>,

    /// Inclusive lower bound on wear.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wear_min: Option<f64>,

    /// Pattern seed membership filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_list: Option<PatternListFilter>,

    /// Case-insensitive substring match on the item name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_contains: Option<String>,

    /// All listed sticker names must be present on the listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stickers_all: Option<Vec<String>>,
}

/// Validation failures for a filter document.
#[derive(Debug, Error, PartialEq)]
pub enum FilterValidationError {
    /// The pattern list carries no seeds.
    #[error("pattern list must contain at least one seed")]
    EmptySeeds,

    /// A seed falls outside the range of its item family.
    #[error("pattern seed {seed} out of range 0..={max} for this item type")]
    SeedOutOfRange {
        /// The offending seed.
        seed: i64,
        /// The family's largest valid seed.
        max: i64,
    },

    /// Wear bounds are inverted or outside `[0, 1]`.
    #[error("wear bounds must satisfy 0 <= wear_min <= wear_max <= 1")]
    InvalidWearBounds,

    /// Price bounds are negative or inverted.
    #[error("price bounds must satisfy 0 <= min_price <= max_price")]
    InvalidPriceBounds,
}

impl FilterDoc {
    /// Validates internal consistency of the document.
    pub fn validate(&self) -> Result<(), FilterValidationError> {
        if let Some(pattern) = &self.pattern_list {
            if pattern.seeds.is_empty() {
                return Err(FilterValidationError::EmptySeeds);
            }
            let max = pattern.item_type.max_seed();
            if let Some(&seed) = pattern.seeds.iter().find(|&&s| s < 0 || s > max) {
                return Err(FilterValidationError::SeedOutOfRange { seed, max });
            }
        }

        let wear_min = self.wear_min.unwrap_or(0.0);
        let wear_max = self.wear_max.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&wear_min)
            || !(0.0..=1.0).contains(&wear_max)
            || wear_min > wear_max
        {
            return Err(FilterValidationError::InvalidWearBounds);
        }

        let min_price = self.min_price.unwrap_or(0);
        let max_price = self.max_price.unwrap_or(i64::MAX);
        if min_price < 0 || min_price > max_price {
            return Err(FilterValidationError::InvalidPriceBounds);
        }

        Ok(())
    }

    /// Evaluates every recognized predicate against the listing.
    pub fn matches(&self, listing: &Listing) -> bool {
        if let Some(max_price) = self.max_price {
            if listing.price_cents > max_price {
                return false;
            }
        }
        if let Some(min_price) = self.min_price {
            if listing.price_cents < min_price {
                return false;
            }
        }

        if self.wear_min.is_some() || self.wear_max.is_some() {
            let Some(wear) = listing.wear else {
                return false;
            };
            if let Some(min) = self.wear_min {
                if wear < min {
                    return false;
                }
            }
            if let Some(max) = self.wear_max {
                if wear > max {
                    return false;
                }
            }
        }

        if let Some(pattern) = &self.pattern_list {
            let Some(seed) = listing.pattern_seed else {
                return false;
            };
            if !pattern.seeds.contains(&seed) {
                return false;
            }
        }

        if let Some(needle) = &self.name_contains {
            if !listing
                .item_name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }

        if let Some(required) = &self.stickers_all {
            let present: Vec<String> = listing
                .stickers
                .iter()
                .map(|s| s.to_lowercase())
                .collect();
            if !required
                .iter()
                .all(|want| present.contains(&want.to_lowercase()))
            {
                return false;
            }
        }

        true
    }
}
