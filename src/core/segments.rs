use crate::types::ChordInterval;

/// Tolerance when deciding whether two candidates touch in time.
const CONTIGUITY_EPS: f64 = 1e-6;

/// Coalesces a chronological stream of `(label, start, end)` candidates.
///
/// Consecutive candidates with the same label that touch (the next one starts where the
/// current interval ends) extend the current interval. A label change or a gap starts a new
/// interval. Candidates with `end <= start` are ignored.
pub fn merge_segments<I, S>(candidates: I) -> Vec<ChordInterval>
where
    I: IntoIterator<Item = (S, f64, f64)>,
    S: Into<String>,
{
    let mut out: Vec<ChordInterval> = Vec::new();

    for (label, start, end) in candidates {
        if !(end > start) {
            continue;
        }
        let label = label.into();
        match out.last_mut() {
            Some(last) if last.label == label && start <= last.end + CONTIGUITY_EPS => {
                last.end = last.end.max(end);
            }
            _ => out.push(ChordInterval { start, end, label }),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(labels: &[&str]) -> Vec<(String, f64, f64)> {
        labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.to_string(), i as f64, i as f64 + 1.0))
            .collect()
    }

    #[test]
    fn merges_runs_of_equal_labels() {
        let merged = merge_segments(unit(&["A", "A", "B", "B", "B", "A"]));
        let got: Vec<(&str, f64, f64)> = merged
            .iter()
            .map(|c| (c.label.as_str(), c.start, c.end))
            .collect();
        assert_eq!(got, vec![("A", 0.0, 2.0), ("B", 2.0, 5.0), ("A", 5.0, 6.0)]);
    }

    #[test]
    fn gap_splits_equal_labels() {
        let merged = merge_segments(vec![("C", 0.0, 2.0), ("C", 4.0, 6.0)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].start, 4.0);
    }

    #[test]
    fn empty_and_degenerate_input() {
        assert!(merge_segments(Vec::<(String, f64, f64)>::new()).is_empty());
        assert!(merge_segments(vec![("C", 1.0, 1.0)]).is_empty());
    }

    #[test]
    fn output_is_non_overlapping_and_ordered() {
        let merged = merge_segments(unit(&["A", "B", "A", "A", "C", "C", "B"]));
        for pair in merged.windows(2) {
            assert!(pair[0].end <= pair[1].start);
            assert_ne!(pair[0].label, pair[1].label);
        }
        assert_eq!(merged.len(), 5);
    }
}
