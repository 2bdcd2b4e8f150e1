//! Vector helpers for cosine similarity.

/// Scale a vector to unit L2 length in place.
///
/// Returns false, leaving the vector untouched, for zero-length or
/// non-finite input. Accumulates in f64 to keep the norm stable for
/// high-dimensional embeddings.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm_sq: f64 = v.iter().map(|&x| f64::from(x) * f64::from(x)).sum();
    if !norm_sq.is_finite() || norm_sq == 0.0 {
        return false;
    }

    let norm = norm_sq.sqrt();
    for x in v.iter_mut() {
        #[allow(clippy::cast_possible_truncation)]
        let scaled = (f64::from(*x) / norm) as f32;
        *x = scaled;
    }
    true
}

/// Cosine similarity in `[-1, 1]`.
///
/// Returns -1.0 for zero vectors or dimension mismatches so they never
/// clear a match threshold.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return -1.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return -1.0;
    }

    #[allow(clippy::cast_possible_truncation)]
    let similarity = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32;
    similarity
}

/// Fold `sample` into a representative built from `count` earlier samples.
///
/// Both inputs are expected to be unit length; the result is re-normalized.
/// Falls back to the current representative if the blend degenerates.
pub fn running_mean(representative: &[f32], count: u64, sample: &[f32]) -> Vec<f32> {
    if representative.len() != sample.len() {
        return representative.to_vec();
    }

    #[allow(clippy::cast_precision_loss)]
    let weight = count.max(1) as f64;
    let mut blended: Vec<f32> = representative
        .iter()
        .zip(sample)
        .map(|(&r, &s)| {
            #[allow(clippy::cast_possible_truncation)]
            let v = ((f64::from(r) * weight + f64::from(s)) / (weight + 1.0)) as f32;
            v
        })
        .collect();

    if l2_normalize(&mut blended) {
        blended
    } else {
        representative.to_vec()
    }
}
