//! Leader Arbitration
//!
//! Rules deciding which of two members should lead when they meet.

use std::cmp::Ordering;

use crate::store::TxCount;

/// One run of a name, split into text and digit segments
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Segment {
    /// Digits, compared by magnitude (length without leading zeros, then digits)
    Number(usize, String),
    /// Lowercased text
    Text(String),
}

/// Sort key ordering names naturally ("mgt2" before "mgt10")
///
/// Segments always alternate starting with text (possibly empty), so
/// numbers only ever compare against numbers.
pub fn natural_key(name: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut digits = String::new();

    for c in name.chars() {
        if c.is_ascii_digit() {
            if digits.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text).to_lowercase()));
            }
            digits.push(c);
        } else {
            if !digits.is_empty() {
                segments.push(number(std::mem::take(&mut digits)));
            }
            text.push(c);
        }
    }

    if !digits.is_empty() {
        segments.push(number(digits));
    } else {
        segments.push(Segment::Text(text.to_lowercase()));
    }
    segments
}

fn number(digits: String) -> Segment {
    let trimmed = digits.trim_start_matches('0');
    Segment::Number(trimmed.len(), trimmed.to_string())
}

/// Compare two member names naturally
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b))
}

/// What the receiver of an assimilation request knows
#[derive(Debug, Clone)]
pub struct AssimilationView<'a> {
    pub my_name: &'a str,
    pub my_txcount: TxCount,
    /// Members currently following us
    pub my_followers: usize,
    /// Whether we are leading anyone
    pub leading: bool,
    /// Whether our collective currently has quorum
    pub have_quorum: bool,
    pub requester_name: &'a str,
    pub requester_txcount: TxCount,
    /// Absent for requesters that do not report it
    pub requester_followers: Option<usize>,
}

/// Outcome of judging an assimilation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The requester should lead; reconnect to it
    Accept,
    /// We should lead; tell the requester our counter
    Refuse(&'static str),
}

/// Decide whether the requester should become our leader
///
/// A strictly higher transaction count always wins. On a tie, a leader
/// that still has quorum keeps leading; between degraded leaders the one
/// with more followers wins, then the naturally smaller name.
pub fn judge_assimilation(view: &AssimilationView<'_>) -> Verdict {
    if view.requester_txcount < view.my_txcount {
        return Verdict::Refuse("Refusing to be assimilated by inferior transaction count");
    }

    if view.leading && view.requester_txcount == view.my_txcount {
        if view.have_quorum {
            return Verdict::Refuse("Refusing to be assimilated as I am a leader with quorum");
        }

        if let Some(theirs) = view.requester_followers {
            match theirs.cmp(&view.my_followers) {
                Ordering::Less => {
                    return Verdict::Refuse("Refusing to be assimilated by leader with fewer followers")
                }
                Ordering::Equal if natural_cmp(view.my_name, view.requester_name) == Ordering::Less => {
                    return Verdict::Refuse("Refusing to be assimilated, tie broken in favor of my name")
                }
                _ => {}
            }
        }
    }

    Verdict::Accept
}
