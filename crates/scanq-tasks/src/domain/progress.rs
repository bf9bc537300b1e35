//! Weighted progress arithmetic.

/// Percentage of the task done once the first `completed` modules finished.
///
/// The result is rounded to two decimals, clamped to `0..=100` and pinned to
/// exactly `100.0` when every module is done.
///
/// # Examples
///
/// ```
/// use scanq_tasks::domain::weighted_percent;
///
/// let weights = [1.0, 1.0, 2.0];
/// assert_eq!(weighted_percent(&weights, 1), 25.0);
/// assert_eq!(weighted_percent(&weights, 2), 50.0);
/// assert_eq!(weighted_percent(&weights, 3), 100.0);
/// ```
pub fn weighted_percent(weights: &[f64], completed: usize) -> f64 {
    if completed >= weights.len() {
        return 100.0;
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return 0.0;
    }
    let done: f64 = weights[..completed].iter().sum();
    let percent = (done / total * 100.0).clamp(0.0, 100.0);
    (percent * 100.0).round() / 100.0
}
