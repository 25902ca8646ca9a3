//! Pure remediation plan calculations.
//!
//! All functions in this module are side-effect free. They decide how clusters
//! are grouped into batches and how much time each batch gets.

use std::time::Duration;

use jiff::Timestamp;

/// Partition clusters into ordered remediation batches.
///
/// Canaries come first, one per batch, in declared order. The remaining
/// clusters keep their relative order and are chunked into batches of at most
/// `max_concurrency` clusters. Canaries that are not in `clusters` are ignored
/// and duplicates are only planned once, so every cluster lands in exactly one
/// batch. A `max_concurrency` of zero is treated as one.
///
/// # Examples
///
/// ```
/// use fleet_upgrade_operator::controller::remediation_plan::build_remediation_plan;
///
/// let clusters: Vec<String> = (1..=7).map(|i| format!("c{i}")).collect();
/// let plan = build_remediation_plan(&clusters, &["c3".to_string()], 2);
/// assert_eq!(
///     plan,
///     vec![
///         vec!["c3".to_string()],
///         vec!["c1".to_string(), "c2".to_string()],
///         vec!["c4".to_string(), "c5".to_string()],
///         vec!["c6".to_string(), "c7".to_string()],
///     ]
/// );
/// ```
pub fn build_remediation_plan(
    clusters: &[String],
    canaries: &[String],
    max_concurrency: usize,
) -> Vec<Vec<String>> {
    let batch_size = max_concurrency.max(1);
    let mut plan: Vec<Vec<String>> = Vec::new();
    let mut planned: Vec<&String> = Vec::new();

    for canary in canaries {
        if clusters.contains(canary) && !planned.contains(&canary) {
            plan.push(vec![canary.clone()]);
            planned.push(canary);
        }
    }

    let mut remaining: Vec<String> = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        if !planned.contains(&cluster) {
            remaining.push(cluster.clone());
            planned.push(cluster);
        }
    }

    plan.extend(
        remaining
            .chunks(batch_size)
            .map(<[String]>::to_vec)
            .filter(|batch| !batch.is_empty()),
    );
    plan
}

/// Number of leading canary batches in a plan.
///
/// Every canary that made it into the plan occupies one singleton batch at
/// the front, so this is the count of planned canaries.
pub fn canary_batch_count(plan: &[Vec<String>], canaries: &[String]) -> usize {
    plan.iter()
        .take_while(|batch| batch.len() == 1 && batch.iter().all(|c| canaries.contains(c)))
        .count()
}

/// Time allotted to the current batch.
///
/// The job timeout left when the batch started is split evenly across the
/// batches not yet finished, the current one included. The last batch gets
/// everything that remains.
///
/// `current_batch` is 1-based.
pub fn calculate_batch_timeout(
    job_timeout: Duration,
    started_at: Timestamp,
    batch_started_at: Timestamp,
    num_batches: usize,
    current_batch: usize,
) -> Duration {
    let elapsed = Duration::try_from(batch_started_at.duration_since(started_at)).unwrap_or_default();
    let remaining = job_timeout.saturating_sub(elapsed);
    let remaining_batches = num_batches.saturating_sub(current_batch.saturating_sub(1));
    if remaining_batches <= 1 {
        return remaining;
    }
    remaining / u32::try_from(remaining_batches).unwrap_or(u32::MAX)
}

/// Whether the current batch ran out of time at `now`.
pub fn batch_timed_out(batch_started_at: Timestamp, batch_timeout: Duration, now: Timestamp) -> bool {
    let elapsed = Duration::try_from(now.duration_since(batch_started_at)).unwrap_or_default();
    elapsed > batch_timeout
}
