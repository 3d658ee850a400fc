use drill_core::model::Topic;
use rand::Rng;
use rand::seq::SliceRandom;

/// Splits a question budget evenly across topics.
///
/// Every topic gets `total / topics` questions; the remainder goes to a
/// randomly chosen subset, one extra each, so repeated random sessions do
/// not always favor the same topics. Topics that end up with zero are
/// dropped from the result.
#[must_use]
pub fn plan_distribution<R: Rng + ?Sized>(
    total: u32,
    topics: &[Topic],
    rng: &mut R,
) -> Vec<(Topic, u32)> {
    if topics.is_empty() || total == 0 {
        return Vec::new();
    }
    let n = u32::try_from(topics.len()).unwrap_or(u32::MAX);
    let base = total / n;
    let remainder = (total % n) as usize;

    let mut order: Vec<usize> = (0..topics.len()).collect();
    order.shuffle(rng);
    let mut extra = vec![0_u32; topics.len()];
    for &i in order.iter().take(remainder) {
        extra[i] = 1;
    }

    topics
        .iter()
        .zip(extra)
        .map(|(topic, bonus)| (topic.clone(), base + bonus))
        .filter(|(_, count)| *count > 0)
        .collect()
}
