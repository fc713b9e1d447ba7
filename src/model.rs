use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

/// One card as returned by the paged listing endpoint, trimmed to the fields
/// the price run selects (`select=id,tcgplayer`).
#[derive(Debug, Clone, Deserialize)]
pub struct Card {
    pub id: String,
    #[serde(default)]
    pub tcgplayer: Option<Tcgplayer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tcgplayer {
    /// Variant name (normal / holofoil / reverseHolofoil / 1stEdition*)
    /// mapped to a quote object. Values stay raw JSON because upstream
    /// occasionally puts non-object data under a variant key; the projector
    /// filters those out.
    #[serde(default)]
    pub prices: Option<BTreeMap<String, Value>>,
}

/// A well-formed per-variant quote. Sub-fields are independently optional:
/// a missing field becomes NULL in the stored row, never zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct VariantQuote {
    pub market: Option<f64>,
    pub low: Option<f64>,
    pub high: Option<f64>,
}

/// One normalized price fact. Natural key: (card_id, variant, date).
#[derive(Debug, Clone, PartialEq)]
pub struct CardPriceRow {
    pub card_id: String,
    pub variant: String,
    pub date: NaiveDate,
    pub market: Option<f64>,
    pub low: Option<f64>,
    pub high: Option<f64>,
}

/// Per-(run date, set) resume state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub last_page_done: i32,
    pub done: bool,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            last_page_done: 0,
            done: false,
        }
    }
}
