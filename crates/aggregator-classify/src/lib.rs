//! Pure key classification: turns a `/`-separated key path into a
//! [`KeyKind`] by the same naming convention the original implementation
//! used (`ragged_` prefix, `var_` prefix, `_len` suffix), without touching
//! any buffer or catalog state.

use aggregator_value::{AggregatorError, Result};

pub const RAGGED_PREFIX: &str = "ragged_";
pub const VAR_PREFIX: &str = "var_";
pub const LEN_SUFFIX: &str = "_len";

/// The shape behavior a key implies for gather/backfill/storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    /// Constant shape across every event once first observed.
    Fixed,
    /// Variable-length 1-D row per event, stored as a ragged/vlarray node.
    Ragged,
    /// Variable first-dim length, tracked by a sibling length key.
    Variable { len_key: String },
    /// The length key itself (companion to a `Variable` key).
    Length,
}

/// Classify `key` by inspecting its `/`-separated path segments.
///
/// The terminal segment is checked first for a `ragged_` prefix, which
/// makes the whole key [`KeyKind::Ragged`]. Otherwise the path is scanned
/// left to right for the first segment carrying the `var_` prefix. A bare
/// `_len` suffix means nothing on its own — a key only classifies as
/// [`KeyKind::Length`] when that first `var_`-prefixed segment found is
/// itself the terminal segment *and* ends with `_len` (i.e. the key is a
/// companion length key's own name). Any other `var_`-prefixed segment
/// found makes the key [`KeyKind::Variable`], with its companion length key
/// living at the same depth, named `<that segment>_len`. A key with no
/// `var_`-prefixed segment anywhere is [`KeyKind::Fixed`], even if its
/// terminal segment happens to end in `_len`.
pub fn classify(key: &str) -> KeyKind {
    let segments: Vec<&str> = key.split('/').collect();
    let last = *segments.last().expect("split always yields at least one segment");

    if last.starts_with(RAGGED_PREFIX) {
        return KeyKind::Ragged;
    }

    for (i, seg) in segments.iter().enumerate() {
        if seg.starts_with(VAR_PREFIX) {
            if i == segments.len() - 1 && seg.ends_with(LEN_SUFFIX) {
                return KeyKind::Length;
            }
            let mut parts: Vec<String> = segments[..i].iter().map(|s| s.to_string()).collect();
            parts.push(format!("{seg}{LEN_SUFFIX}"));
            return KeyKind::Variable {
                len_key: parts.join("/"),
            };
        }
    }

    KeyKind::Fixed
}

/// Validate a key is not one of the two reserved timestamp keys.
pub fn reject_reserved(key: &str) -> Result<()> {
    if key == "event_time" || key == "fiducials" {
        return Err(AggregatorError::ReservedKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fixed_key_is_the_default() {
        assert_eq!(classify("ebeam/charge"), KeyKind::Fixed);
    }

    #[test]
    fn ragged_prefix_on_terminal_segment() {
        assert_eq!(classify("det/ragged_peaks"), KeyKind::Ragged);
    }

    #[test]
    fn ragged_prefix_elsewhere_does_not_count() {
        // only the terminal segment's prefix matters
        assert_eq!(classify("ragged_group/charge"), KeyKind::Fixed);
    }

    #[test]
    fn var_prefix_yields_sibling_length_key() {
        assert_eq!(
            classify("det/var_nhits"),
            KeyKind::Variable {
                len_key: "det/var_nhits_len".to_string()
            }
        );
    }

    #[test]
    fn var_prefix_nested_under_fixed_segments() {
        assert_eq!(
            classify("a/b/var_hits/value"),
            KeyKind::Variable {
                len_key: "a/b/var_hits_len".to_string()
            }
        );
    }

    #[test]
    fn len_suffix_wins_over_var_prefix() {
        assert_eq!(classify("det/var_nhits_len"), KeyKind::Length);
    }

    #[test]
    fn bare_len_suffix_without_var_ancestor_is_fixed() {
        // an ordinary key that happens to end in `_len` is not a length
        // companion unless a `var_`-prefixed segment produced it
        assert_eq!(classify("det/foo_len"), KeyKind::Fixed);
    }

    #[test]
    fn reserved_keys_are_rejected() {
        assert!(reject_reserved("event_time").is_err());
        assert!(reject_reserved("fiducials").is_err());
        assert!(reject_reserved("ebeam/charge").is_ok());
    }
}
