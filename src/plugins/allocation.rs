//! Largest-remainder integer distribution (spec.md §4.5), kept as a pure
//! function so it is unit-testable without a database.

use crate::amount::{self, Amount};
use num_traits::Zero;

/// Splits `total` across `weights` so shares sum exactly to `total`. Each
/// share starts as `floor(total * w_i / sum(weights))`; the remainder is
/// handed out one unit at a time to the entries with the largest
/// `(total * w_i) mod sum(weights)`, ties broken by input order.
pub fn largest_remainder(total: &Amount, weights: &[Amount]) -> Vec<Amount> {
    if weights.is_empty() {
        return Vec::new();
    }
    let weight_sum: Amount = weights.iter().fold(amount::zero(), |acc, w| acc + w);
    if weight_sum.is_zero() || total.is_zero() {
        return vec![amount::zero(); weights.len()];
    }

    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders: Vec<(usize, Amount)> = Vec::with_capacity(weights.len());
    let mut floor_sum = amount::zero();

    for (i, w) in weights.iter().enumerate() {
        let product = total * w;
        let floor = &product / &weight_sum;
        let remainder = &product - &floor * &weight_sum;
        floor_sum += &floor;
        shares.push(floor);
        remainders.push((i, remainder));
    }

    let mut residual = total - &floor_sum;
    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let one = Amount::from(1u8);

    for (i, _) in remainders {
        if residual <= amount::zero() {
            break;
        }
        shares[i] += &one;
        residual -= &one;
    }

    shares
}
