//! Registry sizing.

#[rustfmt::skip]
const PRIMES: [usize; 24] = [
    0, 1, 5, 11,
    23, 53, 101, 197,
    389, 683, 1259, 2417,
    4733, 9371, 18617, 37097,
    74093, 148073, 296099, 592019,
    1100009, 2200013, 4400021, 8800019,
];

/// Smallest table capacity that keeps `items + 1` records under `load_factor`.
///
/// Capacities come from a fixed prime table; past its end the largest prime
/// is scaled by the smallest multiplier that fits.
pub(crate) fn ideal_capacity(items: usize, load_factor: f64) -> usize {
    let wanted = ((items + 1) as f64 / load_factor).ceil() as usize;

    if let Some(&prime) = PRIMES.iter().find(|&&prime| prime >= wanted) {
        return prime;
    }

    let largest = PRIMES[PRIMES.len() - 1];
    wanted.div_ceil(largest) * largest
}
