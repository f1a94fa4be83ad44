//! Market listings and their de-duplication fingerprint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A single market listing as extracted by a parsing worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// The listing's externally stable id, when the upstream page exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<String>,

    /// Market hash name of the item.
    pub item_name: String,

    /// Asking price in cents.
    pub price_cents: i64,

    /// Wear (float) value, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wear: Option<f64>,

    /// Pattern seed, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_seed: Option<i64>,

    /// Applied sticker names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stickers: Vec<String>,

    /// Opaque seller identifier, when the upstream page exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_opaque_id: Option<String>,

    /// Raw payload summary carried along for the found-item record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl Listing {
    /// Computes the stable fingerprint identifying this listing for a task.
    ///
    /// The fingerprint is a SHA-256 digest over `(task_id, identity)` where
    /// identity is the external listing id when present, otherwise a
    /// deterministic composite of name, price, bucketed wear, pattern seed,
    /// and seller id. The same listing observed twice must hash identically,
    /// which is why the wear float is bucketed to its four-decimal
    /// representation before hashing.
    pub fn fingerprint(&self, task_id: i64) -> String {
        let identity = match &self.listing_id {
            Some(id) => format!("id:{id}"),
            None => format!(
                "{}|{}|{}|{}|{}",
                self.item_name,
                self.price_cents,
                self.wear.map_or_else(|| "-".to_string(), |w| format!("{w:.4}")),
                self.pattern_seed
                    .map_or_else(|| "-".to_string(), |p| p.to_string()),
                self.seller_opaque_id.as_deref().unwrap_or("-"),
            ),
        };

        let mut hasher = Sha256::new();
        hasher.update(task_id.to_be_bytes());
        hasher.update(b"|");
        hasher.update(identity.as_bytes());
        hasher
            .finalize()
            .iter()
            .fold(String::with_capacity(64), |mut out, byte| {
                use std::fmt::Write;
                let _ = write!(out, "{byte:02x}");
                out
            })
    }
}
