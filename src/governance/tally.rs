//! Vote Tally
//!
//! Simple majority over admin votes. A tie keeps the proposed outcome: an
//! optimistic resolution stands unless a majority overturns it.

use serde::Serialize;
use std::collections::HashSet;

use crate::models::{Outcome, Vote};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteTally {
    pub yes: usize,
    pub no: usize,
    pub outcome: Outcome,
    pub tie: bool,
}

impl VoteTally {
    pub fn total(&self) -> usize {
        self.yes + self.no
    }
}

/// Counts one vote per admin (the first seen) and picks the majority, falling
/// back to `proposed` on a tie, including the no-votes case.
pub fn tally_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>, proposed: Outcome) -> VoteTally {
    let mut seen = HashSet::new();
    let (mut yes, mut no) = (0usize, 0usize);

    for vote in votes {
        if !seen.insert(vote.admin_id.as_str()) {
            continue;
        }
        match vote.vote {
            Outcome::Yes => yes += 1,
            Outcome::No => no += 1,
        }
    }

    let outcome = match yes.cmp(&no) {
        std::cmp::Ordering::Greater => Outcome::Yes,
        std::cmp::Ordering::Less => Outcome::No,
        std::cmp::Ordering::Equal => proposed,
    };

    VoteTally {
        yes,
        no,
        outcome,
        tie: yes == no,
    }
}
