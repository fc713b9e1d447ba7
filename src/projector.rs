use chrono::NaiveDate;

use crate::model::{Card, CardPriceRow, VariantQuote};

/// Flatten one card into price rows stamped with the run date. Pure, no I/O.
/// Cards without tcgplayer pricing yield nothing; variant entries that are
/// not quote objects are ignored.
pub fn rows_from_card(card: &Card, run_date: NaiveDate) -> Vec<CardPriceRow> {
    let mut out = Vec::new();
    let Some(prices) = card.tcgplayer.as_ref().and_then(|t| t.prices.as_ref()) else {
        return out;
    };
    for (variant, raw) in prices {
        if !raw.is_object() {
            continue;
        }
        let Ok(quote) = serde_json::from_value::<VariantQuote>(raw.clone()) else {
            continue;
        };
        out.push(CardPriceRow {
            card_id: card.id.clone(),
            variant: variant.clone(),
            date: run_date,
            market: quote.market,
            low: quote.low,
            high: quote.high,
        });
    }
    out
}
