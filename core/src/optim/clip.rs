use crate::autograd::Gradient;

/// Global L2 norm over a set of gradients; missing gradients contribute nothing.
pub fn global_norm(grads: &[Option<Gradient<f32>>]) -> f32 {
    grads
        .iter()
        .flatten()
        .map(Gradient::sum_squares)
        .sum::<f32>()
        .sqrt()
}

/// Rescales `grads` so that their global norm is at most `max_norm`.
///
/// Every gradient is multiplied by `max_norm / max(norm, max_norm)`, so nothing changes
/// when the norm is already within bounds. Returns the clipped gradients and the norm
/// before clipping.
pub fn clip_by_global_norm(
    grads: &[Option<Gradient<f32>>],
    max_norm: f32,
) -> (Vec<Option<Gradient<f32>>>, f32) {
    let norm = global_norm(grads);
    if norm <= max_norm {
        return (grads.to_vec(), norm);
    }
    let scale = max_norm / norm;
    let clipped = grads
        .iter()
        .map(|g| g.as_ref().map(|g| g.scale(scale)))
        .collect();
    (clipped, norm)
}

/// Scale factor reported alongside clipping: `min(max_norm / norm, 1)`, and 1 for a zero norm.
pub fn clip_scale(norm: f32, max_norm: f32) -> f32 {
    if norm > 0.0 {
        (max_norm / norm).min(1.0)
    } else {
        1.0
    }
}
