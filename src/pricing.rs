//! Order pricing rules.
//!
//! Pure functions over line quantities and unit prices; no I/O. Both the
//! cart total shown to the shopper and the frozen prices written at order
//! creation come from here, so the two can never disagree on the rule.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

/// Orders strictly above this items subtotal ship free.
pub const FREE_SHIPPING_THRESHOLD: Decimal = dec!(100);

/// Flat shipping rate below the threshold.
pub const FLAT_SHIPPING_RATE: Decimal = dec!(10);

/// One line of a priced basket: quantity and the unit price in effect.
#[derive(Debug, Clone, Copy)]
pub struct PricedLine {
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Computed order pricing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub items_price: Decimal,
    pub shipping_price: Decimal,
    pub total_price: Decimal,
}

/// Line subtotal, `quantity * unit_price`.
pub fn line_total(quantity: i32, unit_price: Decimal) -> Decimal {
    Decimal::from(quantity) * unit_price
}

/// Prices a basket: items subtotal, flat-rate shipping waived strictly
/// above [`FREE_SHIPPING_THRESHOLD`], and the grand total.
pub fn quote(lines: &[PricedLine]) -> PriceQuote {
    let items_price: Decimal = lines
        .iter()
        .map(|line| line_total(line.quantity, line.unit_price))
        .sum();

    let shipping_price = if items_price > FREE_SHIPPING_THRESHOLD {
        Decimal::ZERO
    } else {
        FLAT_SHIPPING_RATE
    };

    PriceQuote {
        items_price,
        shipping_price,
        total_price: items_price + shipping_price,
    }
}
