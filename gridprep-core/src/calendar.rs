//! Lag/lead expansion of date splits.
//!
//! A date can only be used when its whole context window is available, so a
//! split is expanded with the neighbouring dates each model input needs. A
//! neighbour is only admitted when every configured variable has a file for
//! it; otherwise the anchor date itself is dropped rather than silently
//! truncating the context window.

use crate::frequency::{Frequency, TimeStamp};
use log::warn;
use std::collections::BTreeSet;

/// Which way the context window extends from an anchor date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendDirection {
    Lag,
    Lead,
}

impl ExtendDirection {
    fn sign(&self) -> i64 {
        match self {
            ExtendDirection::Lag => -1,
            ExtendDirection::Lead => 1,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ExtendDirection::Lag => "lag",
            ExtendDirection::Lead => "lead",
        }
    }
}

/// Result of extending a date set in one direction.
#[derive(Debug, Default, Clone)]
pub struct Extension {
    /// Neighbour dates admitted into the working set.
    pub additional: BTreeSet<TimeStamp>,
    /// Anchor dates sacrificed because a neighbour's files were incomplete.
    pub dropped: BTreeSet<TimeStamp>,
}

/// Compute the neighbour dates needed by `dates` in one direction.
///
/// For each date and each step `1..=steps`, the neighbour is checked with
/// `file_exists` (a conjunction over all configured variables supplied by the
/// caller). `steps == 0` is a no-op.
pub fn extend<F>(
    dates: &BTreeSet<TimeStamp>,
    direction: ExtendDirection,
    steps: u32,
    frequency: Frequency,
    file_exists: F,
) -> Extension
where
    F: Fn(TimeStamp) -> bool,
{
    let mut extension = Extension::default();

    for &date in dates {
        for step in 1..=i64::from(steps) {
            let neighbour = frequency.offset(date, direction.sign() * step);
            if dates.contains(&neighbour) {
                continue;
            }
            if file_exists(neighbour) {
                extension.additional.insert(neighbour);
            } else {
                warn!(
                    "{} will be dropped due to missing {} data {}",
                    date,
                    direction.name(),
                    neighbour
                );
                extension.dropped.insert(date);
            }
        }
    }

    extension
}

/// Expand a split with its lag and lead neighbours.
///
/// Lead extension runs over the lag-augmented set, so admitted lag dates get
/// their own lead context checked too. The working set is
/// `(original ∪ additional) \ dropped`, returned sorted and de-duplicated.
pub fn extend_split<F>(
    dates: &BTreeSet<TimeStamp>,
    lag: u32,
    lead: u32,
    frequency: Frequency,
    file_exists: F,
) -> BTreeSet<TimeStamp>
where
    F: Fn(TimeStamp) -> bool,
{
    let lagged = extend(dates, ExtendDirection::Lag, lag, frequency, &file_exists);

    let mut working: BTreeSet<TimeStamp> = dates.clone();
    working.extend(lagged.additional.iter().copied());

    let led = extend(&working, ExtendDirection::Lead, lead, frequency, &file_exists);
    working.extend(led.additional.iter().copied());

    for dropped in lagged.dropped.iter().chain(led.dropped.iter()) {
        working.remove(dropped);
    }
    working
}
