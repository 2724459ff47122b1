//! Consensus combinators over heterogeneous model outputs. Each candidate is
//! a `(text, confidence)` pair; the functions are pure and independent of
//! how the responses were obtained.

use crate::text::token_overlap;

/// Index of the highest-confidence response.
#[must_use]
pub fn highest_confidence(responses: &[(String, f32)]) -> Option<usize> {
    responses
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

/// Group near-duplicate responses by token overlap. Greedy single-link: a
/// response joins the first cluster whose seed it resembles above the
/// threshold.
#[must_use]
pub fn similarity_clusters(responses: &[(String, f32)], threshold: f32) -> Vec<Vec<usize>> {
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    for (i, (text, _)) in responses.iter().enumerate() {
        let mut placed = false;
        for cluster in &mut clusters {
            let seed = cluster[0];
            if token_overlap(text, &responses[seed].0) >= threshold {
                cluster.push(i);
                placed = true;
                break;
            }
        }
        if !placed {
            clusters.push(vec![i]);
        }
    }
    clusters
}

/// Representative of the largest similarity cluster: its highest-confidence
/// member. Cluster-size ties break toward the cluster with the higher
/// best-member confidence.
#[must_use]
pub fn cluster_representative(responses: &[(String, f32)], threshold: f32) -> Option<usize> {
    let clusters = similarity_clusters(responses, threshold);
    let best_cluster = clusters.into_iter().max_by(|a, b| {
        a.len().cmp(&b.len()).then_with(|| {
            let conf = |cluster: &[usize]| {
                cluster
                    .iter()
                    .map(|&i| responses[i].1)
                    .fold(f32::MIN, f32::max)
            };
            conf(a)
                .partial_cmp(&conf(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    })?;
    best_cluster
        .into_iter()
        .max_by(|&a, &b| {
            responses[a]
                .1
                .partial_cmp(&responses[b].1)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Weighted voting: clusters vote with the sum of their members' confidence
/// scores; the winning cluster's highest-confidence member represents it.
#[must_use]
pub fn weighted_vote(responses: &[(String, f32)], threshold: f32) -> Option<usize> {
    let clusters = similarity_clusters(responses, threshold);
    let winning = clusters.into_iter().max_by(|a, b| {
        let weight = |cluster: &[usize]| cluster.iter().map(|&i| responses[i].1).sum::<f32>();
        weight(a)
            .partial_cmp(&weight(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    })?;
    winning.into_iter().max_by(|&a, &b| {
        responses[a]
            .1
            .partial_cmp(&responses[b].1)
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responses() -> Vec<(String, f32)> {
        vec![
            (
                "Restart the ingress controller to clear stale routes".to_string(),
                0.7,
            ),
            (
                "You should restart the ingress controller, clearing stale routes".to_string(),
                0.8,
            ),
            ("Reinstall the operating system".to_string(), 0.9),
        ]
    }

    #[test]
    fn near_duplicates_form_the_majority_cluster() {
        let reps = responses();
        let clusters = similarity_clusters(&reps, 0.5);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn representative_comes_from_the_largest_cluster() {
        let reps = responses();
        // The outlier has the highest confidence, but the duplicate pair wins
        // on cluster size.
        let rep = cluster_representative(&reps, 0.5).unwrap();
        assert_eq!(rep, 1);
    }

    #[test]
    fn weighted_vote_favors_combined_confidence() {
        let reps = responses();
        // 0.7 + 0.8 outweighs the lone 0.9.
        assert_eq!(weighted_vote(&reps, 0.5), Some(1));
    }

    #[test]
    fn highest_confidence_picks_the_outlier() {
        let reps = responses();
        assert_eq!(highest_confidence(&reps), Some(2));
    }

    #[test]
    fn empty_input_yields_none() {
        assert_eq!(highest_confidence(&[]), None);
        assert_eq!(cluster_representative(&[], 0.5), None);
        assert_eq!(weighted_vote(&[], 0.5), None);
    }
}
