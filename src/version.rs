//! Debian package version ordering, per deb-version(5)

use std::cmp::Ordering;

/// Compare two Debian version strings.
pub fn compare(a: &str, b: &str) -> Ordering {
    let (a_epoch, a_upstream, a_revision) = split(a);
    let (b_epoch, b_upstream, b_revision) = split(b);

    a_epoch
        .cmp(&b_epoch)
        .then_with(|| compare_fragment(a_upstream.as_bytes(), b_upstream.as_bytes()))
        .then_with(|| compare_fragment(a_revision.as_bytes(), b_revision.as_bytes()))
}

/// Split `[epoch:]upstream[-revision]`; a missing revision compares as "0".
fn split(version: &str) -> (u64, &str, &str) {
    let (epoch, rest) = match version.split_once(':') {
        Some((e, rest)) if !e.is_empty() && e.bytes().all(|b| b.is_ascii_digit()) => {
            (e.parse().unwrap_or(0), rest)
        }
        _ => (0, version),
    };
    match rest.rfind('-') {
        Some(pos) => (epoch, &rest[..pos], &rest[pos + 1..]),
        None => (epoch, rest, "0"),
    }
}

/// Sort weight of one byte: `~` before everything (end of string
/// included), digits neutral, letters by value, punctuation after letters.
fn order(c: u8) -> i32 {
    match c {
        b'~' => -1,
        0 => 0,
        c if c.is_ascii_digit() => 0,
        c if c.is_ascii_alphabetic() => c as i32,
        c => c as i32 + 256,
    }
}

fn compare_fragment(a: &[u8], b: &[u8]) -> Ordering {
    let at = |s: &[u8], k: usize| s.get(k).copied().unwrap_or(0);
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() || j < b.len() {
        // non-digit run
        while (at(a, i) != 0 && !at(a, i).is_ascii_digit())
            || (at(b, j) != 0 && !at(b, j).is_ascii_digit())
        {
            let oa = order(at(a, i));
            let ob = order(at(b, j));
            if oa != ob {
                return oa.cmp(&ob);
            }
            i += 1;
            j += 1;
        }
        // digit run, numerically
        while at(a, i) == b'0' {
            i += 1;
        }
        while at(b, j) == b'0' {
            j += 1;
        }
        let mut first_diff = Ordering::Equal;
        while at(a, i).is_ascii_digit() && at(b, j).is_ascii_digit() {
            if first_diff == Ordering::Equal {
                first_diff = at(a, i).cmp(&at(b, j));
            }
            i += 1;
            j += 1;
        }
        if at(a, i).is_ascii_digit() {
            return Ordering::Greater;
        }
        if at(b, j).is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! check_cmp {
        ($name:ident, $a:expr, $b:expr, $expected:expr) => {
            #[test]
            fn $name() {
                assert_eq!(
                    compare($a, $b),
                    $expected,
                    "'{}' vs '{}' should be {:?}",
                    $a,
                    $b,
                    $expected
                );
            }
        };
    }

    check_cmp!(cmp_equal, "1.0", "1.0", Ordering::Equal);
    check_cmp!(cmp_simple_less, "1.0", "1.2", Ordering::Less);
    check_cmp!(cmp_simple_greater, "1.2", "1.0", Ordering::Greater);
    check_cmp!(cmp_multi_digit, "1.10", "1.9", Ordering::Greater);
    check_cmp!(cmp_leading_zeros, "1.010", "1.10", Ordering::Equal);
    check_cmp!(cmp_alpha, "1a2b", "1a2c", Ordering::Less);
    check_cmp!(cmp_tilde_presort, "1.0~rc1", "1.0", Ordering::Less);
    check_cmp!(cmp_tilde_chain, "0~~a", "0~a", Ordering::Less);
    check_cmp!(cmp_tilde_end, "0.1a~", "0.1a", Ordering::Less);
    check_cmp!(cmp_revision_less, "1.0-1", "1.0-2", Ordering::Less);
    check_cmp!(cmp_revision_default, "1.0", "1.0-1", Ordering::Less);
    check_cmp!(cmp_epoch_wins, "1:0.5", "2.0", Ordering::Greater);
    check_cmp!(cmp_epoch_default_zero, "0:1.0", "1.0", Ordering::Equal);
    check_cmp!(cmp_plus_after_letter, "1.0+b1", "1.0", Ordering::Greater);
    check_cmp!(cmp_letter_before_punct, "1.0a", "1.0+", Ordering::Less);
}
