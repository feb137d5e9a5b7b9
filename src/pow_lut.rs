//! Thread-local lookup-table cache for `x.powf(1.0 / exponent)`.
//!
//! The additive mixer's response curve and the
//! polyphonic engine's amplitude-gamma shaping both evaluate `powf` once per
//! sample on the hot path. A process-global cache would need a lock or
//! suffer false sharing between workers touching it concurrently, so instead
//! each worker thread keeps its own table, rebuilt only when the exponent it
//! was built for changes.
//!
//! The table covers the domain the response curve actually sees
//! (`[0, DOMAIN_MAX]`, since `sum_envelope + base` is bounded by the note
//! count) and is linearly interpolated; values outside the domain fall back
//! to the real `powf`, which is fine since that path is never hot.

use std::cell::RefCell;

const LUT_SIZE: usize = 1024;
const DOMAIN_MAX: f32 = 256.0;

struct PowLut {
    /// Bit pattern of the exponent this table was built for.
    exponent_bits: u32,
    table: Box<[f32; LUT_SIZE]>,
}

impl PowLut {
    fn build(inv_exponent: f32) -> Self {
        let mut table = Box::new([0.0f32; LUT_SIZE]);
        for (i, slot) in table.iter_mut().enumerate() {
            let x = (i as f32 / (LUT_SIZE - 1) as f32) * DOMAIN_MAX;
            *slot = x.powf(inv_exponent);
        }
        Self { exponent_bits: inv_exponent.to_bits(), table }
    }

    #[inline]
    fn sample(&self, x: f32) -> f32 {
        let t = (x / DOMAIN_MAX) * (LUT_SIZE - 1) as f32;
        let i0 = t.floor().clamp(0.0, (LUT_SIZE - 1) as f32) as usize;
        let i1 = (i0 + 1).min(LUT_SIZE - 1);
        let frac = t - i0 as f32;

        self.table[i0] + (self.table[i1] - self.table[i0]) * frac
    }
}

thread_local! {
    static CACHE: RefCell<Option<PowLut>> = const { RefCell::new(None) };
}

/// Returns `x.powf(1.0 / exponent)`, using this thread's cached table when
/// `x` falls inside the table's domain and rebuilding the table only when
/// `exponent` has changed since the last call on this thread.
///
/// Callers should special-case `exponent == 2.0` (`sqrt`) before reaching
/// here; this function does not special-case it itself so that it stays a
/// pure cache-or-compute primitive.
#[inline]
pub fn response_pow(x: f32, exponent: f32) -> f32 {
    if !(0.0..=DOMAIN_MAX).contains(&x) {
        return x.powf(exponent.recip());
    }

    let inv_exponent = exponent.recip();
    let key = inv_exponent.to_bits();

    CACHE.with(|cell| {
        let mut cache = cell.borrow_mut();
        let needs_rebuild = !matches!(&*cache, Some(lut) if lut.exponent_bits == key);
        if needs_rebuild {
            *cache = Some(PowLut::build(inv_exponent));
        }
        cache.as_ref().unwrap().sample(x)
    })
}
