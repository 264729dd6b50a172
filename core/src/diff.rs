//! Token sequence differ.
//!
//! Alignment is keyed on [`Token::key_eq`] (kind, level and parameter
//! names), never on values, so a value edit aligns with the token it
//! replaces and surfaces as [`ChangeOp::Update`]. An edit hint narrows the
//! window to what re-lexing produced; the common prefix and suffix of that
//! window are stripped, and Myers' O(N·D) greedy search runs over the rest.

use core::fmt;
use core::ops::Range;

use crate::edit::TextEdit;
use crate::queue::TokenSequence;
use crate::token::Token;
use crate::tokenizer::resync_start;

/// Edit distance beyond which the window is replaced wholesale.
const MAX_EDIT_DISTANCE: usize = 4096;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Insert,
    Delete,
    /// Old and new tokens at the same position with different keys.
    Retype,
    /// Same keys, different parameter values.
    Update,
}

/// One entry of a [`ChangeSet`]. Ranges are token indices.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub op: ChangeOp,
    pub old: Range<usize>,
    pub new: Range<usize>,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}..{} -> {}..{}",
            self.op, self.old.start, self.old.end, self.new.start, self.new.end
        )
    }
}

/// Ordered, non-overlapping edit script between two token sequences.
///
/// Between consecutive changes the old and new gaps have equal length and
/// hold tokens that are equal up to a position shift.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A change set that inserts `len` tokens into an empty sequence.
    pub fn initial(len: usize) -> Self {
        let mut set = Self::new();
        if len > 0 {
            set.changes.push(Change {
                op: ChangeOp::Insert,
                old: 0..0,
                new: 0..len,
            });
        }
        set
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Change] {
        &self.changes
    }

    /// Appends a change, merging it into the previous one when both have
    /// the same op and are adjacent.
    fn push(&mut self, op: ChangeOp, old: Range<usize>, new: Range<usize>) {
        if old.is_empty() && new.is_empty() {
            return;
        }
        if let Some(last) = self.changes.last_mut() {
            if last.op == op && last.old.end == old.start && last.new.end == new.start {
                last.old.end = old.end;
                last.new.end = new.end;
                return;
            }
        }
        self.changes.push(Change { op, old, new });
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Diffs two token sequences.
///
/// `hint` is the text edit that turned the old buffer into the new one.
/// With it, `new` is taken to be the [`retokenize`](crate::Tokenizer::retokenize)
/// result for that edit: tokens before the resync point and after the new
/// cursor are copies of old ones and are never compared. Without it the
/// byte shift of the common suffix is inferred from the end of the last
/// tokens.
pub fn diff(old: &TokenSequence, new: &TokenSequence, hint: Option<&TextEdit>) -> ChangeSet {
    let tail = hint.map_or(0, |_| new.len() - new.cursor());
    diff_window(old.as_slice(), new.as_slice(), hint, tail)
}

/// Diffs two token slices. A `hint` bounds the window from below only.
pub fn diff_tokens(old: &[Token], new: &[Token], hint: Option<&TextEdit>) -> ChangeSet {
    diff_window(old, new, hint, 0)
}

/// `tail` counts trailing tokens known to be shifted copies.
fn diff_window(old: &[Token], new: &[Token], hint: Option<&TextEdit>, tail: usize) -> ChangeSet {
    let delta = match hint {
        Some(edit) => edit.delta(),
        None => {
            let end = |t: &[Token]| t.last().map_or(0, |t| t.span.end) as isize;
            end(new) - end(old)
        }
    };

    let room = old.len().min(new.len());
    let head = hint.map_or(0, |edit| resync_start(old, edit.range)).min(room);
    let tail = tail.min(room - head);
    let (old_end, new_end) = (old.len() - tail, new.len() - tail);

    let prefix = head
        + old[head..old_end]
            .iter()
            .zip(&new[head..new_end])
            .take_while(|(a, b)| a == b)
            .count();
    let room = old_end.min(new_end) - prefix;
    let suffix = tail
        + old[..old_end]
            .iter()
            .rev()
            .zip(new[..new_end].iter().rev())
            .take(room)
            .take_while(|(a, b)| a.shifted(delta) == **b)
            .count();

    let a = &old[prefix..old.len() - suffix];
    let b = &new[prefix..new.len() - suffix];
    let mut set = ChangeSet::new();
    if a.is_empty() && b.is_empty() {
        return set;
    }

    match shortest_edit(a, b) {
        Some(steps) => script(&mut set, &steps, a, b, prefix),
        None => {
            log::debug!(
                "edit distance over {} in a {}x{} window; replacing it",
                MAX_EDIT_DISTANCE,
                a.len(),
                b.len()
            );
            coalesce(&mut set, prefix..prefix + a.len(), prefix..prefix + b.len());
        }
    }

    log::debug!(
        "diff: {} old / {} new tokens, window {}..{}, {} changes",
        old.len(),
        new.len(),
        prefix,
        old.len() - suffix,
        set.len()
    );
    set
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Keep(usize, usize),
    Delete(usize),
    Insert(usize),
}

/// Myers' greedy shortest edit script on diff keys.
///
/// On ties a deletion is taken before an insertion, which keeps the
/// earliest unchanged run aligned. Returns `None` past
/// [`MAX_EDIT_DISTANCE`].
fn shortest_edit(a: &[Token], b: &[Token]) -> Option<Vec<Step>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = a.len() + b.len();
    let limit = max.min(MAX_EDIT_DISTANCE) as isize;
    let offset = max as isize + 1;
    let mut v = vec![0isize; 2 * max + 3];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    for d in 0..=limit {
        for k in (-d..=d).step_by(2) {
            let at = (offset + k) as usize;
            let mut x = if k == -d || (k != d && v[at - 1] < v[at + 1]) {
                v[at + 1]
            } else {
                v[at - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize].key_eq(&b[y as usize]) {
                x += 1;
                y += 1;
            }
            v[at] = x;
            if x >= n && y >= m {
                trace.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
                return Some(backtrack(&trace, n, m));
            }
        }
        trace.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
    }
    None
}

fn backtrack(trace: &[Vec<isize>], n: isize, m: isize) -> Vec<Step> {
    let mut steps = Vec::new();
    let (mut x, mut y) = (n, m);

    for d in (1..trace.len() as isize).rev() {
        let prev = &trace[(d - 1) as usize];
        let at = |k: isize| prev[(k + d - 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = at(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
            steps.push(Step::Keep(x as usize, y as usize));
        }
        if x == prev_x {
            steps.push(Step::Insert(prev_y as usize));
        } else {
            steps.push(Step::Delete(prev_x as usize));
        }
        x = prev_x;
        y = prev_y;
    }
    while x > 0 && y > 0 {
        x -= 1;
        y -= 1;
        steps.push(Step::Keep(x as usize, y as usize));
    }
    steps.reverse();
    steps
}

/// Turns steps over the window into changes in sequence coordinates.
fn script(set: &mut ChangeSet, steps: &[Step], a: &[Token], b: &[Token], base: usize) {
    let mut dels: Option<Range<usize>> = None;
    let mut ins: Option<Range<usize>> = None;
    // Position of the next step in each sequence, for empty ranges.
    let (mut oi, mut ni) = (0, 0);

    for step in steps {
        match *step {
            Step::Delete(i) => {
                dels.get_or_insert(i..i).end = i + 1;
                oi = i + 1;
            }
            Step::Insert(j) => {
                ins.get_or_insert(j..j).end = j + 1;
                ni = j + 1;
            }
            Step::Keep(i, j) => {
                flush(set, &mut dels, &mut ins, oi, ni, base);
                if !a[i].same_values(&b[j]) {
                    set.push(ChangeOp::Update, base + i..base + i + 1, base + j..base + j + 1);
                }
                oi = i + 1;
                ni = j + 1;
            }
        }
    }
    flush(set, &mut dels, &mut ins, oi, ni, base);
}

fn flush(
    set: &mut ChangeSet,
    dels: &mut Option<Range<usize>>,
    ins: &mut Option<Range<usize>>,
    oi: usize,
    ni: usize,
    base: usize,
) {
    let old = dels.take().unwrap_or(oi..oi);
    let new = ins.take().unwrap_or(ni..ni);
    coalesce(set, base + old.start..base + old.end, base + new.start..base + new.end);
}

/// Pairs a delete run with an adjacent insert run: the overlap becomes
/// `Retype`, the remainder `Delete` or `Insert`.
fn coalesce(set: &mut ChangeSet, old: Range<usize>, new: Range<usize>) {
    let paired = old.len().min(new.len());
    set.push(
        ChangeOp::Retype,
        old.start..old.start + paired,
        new.start..new.start + paired,
    );
    let (old_rest, new_rest) = (old.start + paired..old.end, new.start + paired..new.end);
    if !old_rest.is_empty() {
        set.push(ChangeOp::Delete, old_rest, new_rest.start..new_rest.start);
    } else if !new_rest.is_empty() {
        set.push(ChangeOp::Insert, old_rest.start..old_rest.start, new_rest);
    }
}
