// src/pricing.rs

use serde::Serialize;
use utoipa::ToSchema;

pub const CURRENCY: &str = "eur";
pub const DEFAULT_MODEL: &str = "google/nano-banana";

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct ModelPrice {
    pub key: &'static str,
    pub label: &'static str,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
pub struct CreditPack {
    pub id: &'static str,
    pub credits: i32,
    pub amount_cents: i64,
    pub name: &'static str,
}

pub const MODEL_PRICING: &[ModelPrice] = &[
    ModelPrice {
        key: "google/nano-banana",
        label: "google/nano-banana (2€)",
        amount_cents: 200,
    },
    ModelPrice {
        key: "batouresearch/magic-image-refiner",
        label: "batouresearch/magic-image-refiner (3€)",
        amount_cents: 300,
    },
    ModelPrice {
        key: "zsxkib/qwen2-vl",
        label: "zsxkib/qwen2-vl (5€)",
        amount_cents: 500,
    },
];

pub const CREDIT_PACKS: &[CreditPack] = &[
    CreditPack {
        id: "pack_10",
        credits: 10,
        amount_cents: 1500,
        name: "Pack 10 generations",
    },
    CreditPack {
        id: "pack_25",
        credits: 25,
        amount_cents: 3200,
        name: "Pack 25 generations",
    },
];

pub fn model_price(model_key: &str) -> Option<&'static ModelPrice> {
    MODEL_PRICING.iter().find(|m| m.key == model_key)
}

pub fn credit_pack(pack_id: &str) -> Option<&'static CreditPack> {
    CREDIT_PACKS.iter().find(|p| p.id == pack_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_priced() {
        assert_eq!(model_price(DEFAULT_MODEL).map(|m| m.amount_cents), Some(200));
    }

    #[test]
    fn unknown_entries_are_rejected() {
        assert!(model_price("stability/sdxl").is_none());
        assert!(credit_pack("pack_1000").is_none());
        assert_eq!(credit_pack("pack_25").map(|p| p.credits), Some(25));
    }
}
