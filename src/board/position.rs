//! Fractional ordering keys for the lead board.
//!
//! A dropped card gets a single `f64` key that sorts between its new
//! neighbours, so no sibling row is rewritten. Repeated drops into the same
//! gap halve it each time; once the gap falls under the configured minimum
//! the column is renormalized to integer keys and the drop is planned again.

use super::models::Lead;

/// Default smallest gap a new key may leave to either neighbour.
pub const DEFAULT_MIN_GAP: f64 = 1e-9;

/// Key for a card dropped at `index` into a column whose keys are
/// `positions` (ascending, dragged card excluded).
pub fn position_for_drop(positions: &[f64], index: usize) -> f64 {
    match positions {
        [] => 0.0,
        [first, ..] if index == 0 => first - 1.0,
        [.., last] if index >= positions.len() => last + 1.0,
        _ => (positions[index - 1] + positions[index]) / 2.0,
    }
}

/// Result of planning a drop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placement {
    /// The key to write for the dragged card.
    At(f64),
    /// The gap is exhausted; renormalize the column and plan again.
    Renormalize,
}

/// Plan a drop, checking the computed key still sorts strictly between its
/// neighbours with at least `min_gap` of room on each side.
pub fn plan_drop(positions: &[f64], index: usize, min_gap: f64) -> Placement {
    let index = index.min(positions.len());
    let candidate = position_for_drop(positions, index);
    if !candidate.is_finite() {
        return Placement::Renormalize;
    }

    let lower = index.checked_sub(1).map(|i| positions[i]);
    let upper = positions.get(index).copied();

    let clear_of_lower = lower.is_none_or(|l| candidate > l && candidate - l >= min_gap);
    let clear_of_upper = upper.is_none_or(|u| candidate < u && u - candidate >= min_gap);

    if clear_of_lower && clear_of_upper {
        Placement::At(candidate)
    } else {
        Placement::Renormalize
    }
}

/// Integer-spaced keys for a column of `count` cards, preserving order.
pub fn renormalized(count: usize) -> Vec<f64> {
    (0..count).map(|i| i as f64).collect()
}

/// Board order: ascending key, ties broken by id.
pub fn sort_leads(leads: &mut [Lead]) {
    leads.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lead(id: i64, position: f64) -> Lead {
        Lead {
            id,
            column_id: 1,
            name: format!("lead-{}", id),
            phone: None,
            email: None,
            company: None,
            value: None,
            notes: None,
            position,
            created_at: "2024-01-01".into(),
            updated_at: "2024-01-01".into(),
        }
    }

    #[test]
    fn test_drop_between_two_takes_midpoint() {
        assert_eq!(position_for_drop(&[0.0, 2.0, 4.0], 1), 1.0);
    }

    #[test]
    fn test_drop_into_empty_column_is_zero() {
        assert_eq!(position_for_drop(&[], 0), 0.0);
    }

    #[test]
    fn test_drop_at_top_is_one_below_first() {
        assert_eq!(position_for_drop(&[5.0], 0), 4.0);
    }

    #[test]
    fn test_drop_at_end_is_one_above_last() {
        assert_eq!(position_for_drop(&[5.0], 1), 6.0);
        assert_eq!(position_for_drop(&[5.0], 7), 6.0);
    }

    #[test]
    fn test_every_index_preserves_strict_order() {
        let positions = [-3.0, -0.5, 0.0, 0.25, 1.0, 10.0];
        for index in 0..=positions.len() {
            let p = position_for_drop(&positions, index);
            let mut inserted = positions.to_vec();
            inserted.insert(index, p);
            assert!(
                inserted.windows(2).all(|w| w[0] < w[1]),
                "index {} produced {} which breaks order: {:?}",
                index,
                p,
                inserted
            );
        }
    }

    #[test]
    fn test_plan_drop_accepts_roomy_gap() {
        assert_eq!(plan_drop(&[0.0, 2.0], 1, DEFAULT_MIN_GAP), Placement::At(1.0));
    }

    #[test]
    fn test_plan_drop_clamps_index_past_end() {
        assert_eq!(plan_drop(&[0.0, 2.0], 9, DEFAULT_MIN_GAP), Placement::At(3.0));
    }

    #[test]
    fn test_plan_drop_requests_renormalize_for_equal_neighbours() {
        assert_eq!(plan_drop(&[1.0, 1.0], 1, DEFAULT_MIN_GAP), Placement::Renormalize);
    }

    #[test]
    fn test_repeated_same_gap_drops_eventually_renormalize() {
        let mut upper = 1.0;
        let lower = 0.0;
        let mut drops = 0;
        loop {
            match plan_drop(&[lower, upper], 1, DEFAULT_MIN_GAP) {
                Placement::At(p) => {
                    assert!(p > lower && p < upper);
                    upper = p;
                    drops += 1;
                }
                Placement::Renormalize => break,
            }
            assert!(drops < 200, "gap never exhausted");
        }
        assert!(drops >= 20);
    }

    #[test]
    fn test_renormalized_keys_are_integer_spaced() {
        assert_eq!(renormalized(4), vec![0.0, 1.0, 2.0, 3.0]);
        assert!(renormalized(0).is_empty());
    }

    #[test]
    fn test_sort_leads_breaks_ties_by_id() {
        let mut leads = vec![lead(3, 1.0), lead(1, 2.0), lead(2, 1.0), lead(4, -1.0)];
        sort_leads(&mut leads);
        let ids: Vec<i64> = leads.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![4, 2, 3, 1]);
    }
}
