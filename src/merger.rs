//! Loser tree merger.

use std::cmp::Ordering;

use crate::compare::Comparator;
use crate::error::Result;

/// Tournament tree over `k` players keeping the loser of every match.
///
/// Player `i` is a leaf at position `k + i`; internal node `n` stores the loser of the match
/// played there and `winner` the overall champion. An exhausted player holds no key and loses
/// every match, so no sentinel values are needed. Ties go to the lower player index.
pub struct LoserTree<T> {
    keys: Vec<Option<T>>,
    losers: Vec<usize>,
    winner: usize,
}

impl<T> LoserTree<T> {
    /// Plays the initial tournament. `O(k)` comparisons.
    pub fn new<C: Comparator<T>>(keys: Vec<Option<T>>, cmp: &C) -> Result<Self> {
        let players = keys.len();
        let mut tree = LoserTree {
            keys,
            losers: vec![0; players.max(1)],
            winner: 0,
        };
        if players > 0 {
            tree.winner = tree.build(1, cmp)?;
        }

        return Ok(tree);
    }

    fn build<C: Comparator<T>>(&mut self, node: usize, cmp: &C) -> Result<usize> {
        let players = self.keys.len();
        if node >= players {
            return Ok(node - players);
        }

        let left = self.build(2 * node, cmp)?;
        let right = self.build(2 * node + 1, cmp)?;
        if self.beats(left, right, cmp)? {
            self.losers[node] = right;
            Ok(left)
        } else {
            self.losers[node] = left;
            Ok(right)
        }
    }

    fn beats<C: Comparator<T>>(&self, a: usize, b: usize, cmp: &C) -> Result<bool> {
        match (&self.keys[a], &self.keys[b]) {
            (Some(_), None) => Ok(true),
            (None, Some(_)) => Ok(false),
            (None, None) => Ok(a < b),
            (Some(key_a), Some(key_b)) => Ok(match cmp.compare(key_a, key_b)? {
                Ordering::Less => true,
                Ordering::Equal => a < b,
                Ordering::Greater => false,
            }),
        }
    }

    /// Index of the player holding the smallest key.
    pub fn winner(&self) -> usize {
        self.winner
    }

    /// Smallest key, `None` once every player is exhausted.
    pub fn peek(&self) -> Option<&T> {
        self.keys.get(self.winner).and_then(|key| key.as_ref())
    }

    /// Takes the winning key and gives its player `next`, replaying the winner's path to the
    /// root. `O(log k)` comparisons.
    pub fn replace_winner<C: Comparator<T>>(&mut self, next: Option<T>, cmp: &C) -> Result<Option<T>> {
        let players = self.keys.len();
        if players == 0 {
            return Ok(None);
        }

        let taken = std::mem::replace(&mut self.keys[self.winner], next);
        let mut winner = self.winner;
        let mut node = (winner + players) / 2;
        while node >= 1 {
            let other = self.losers[node];
            if self.beats(other, winner, cmp)? {
                self.losers[node] = winner;
                winner = other;
            }
            node /= 2;
        }
        self.winner = winner;

        return Ok(taken);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// K-way merger of sorted streams driven by a [`LoserTree`].
///
/// Stream items should be sorted by `cmp` otherwise the result is undefined. The first stream or
/// comparator error is yielded and ends the merge.
pub struct LoserTreeMerger<T, C, S>
where
    C: Comparator<T>,
    S: Iterator<Item = Result<T>>,
{
    streams: Vec<S>,
    tree: Option<LoserTree<T>>,
    cmp: C,
    failed: bool,
}

impl<T, C, S> LoserTreeMerger<T, C, S>
where
    C: Comparator<T>,
    S: Iterator<Item = Result<T>>,
{
    /// Creates a merger over `streams`. Nothing is read until the first call to `next`.
    pub fn new<I>(streams: I, cmp: C) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        return LoserTreeMerger {
            streams: streams.into_iter().collect(),
            tree: None,
            cmp,
            failed: false,
        };
    }

    pub fn fan_in(&self) -> usize {
        self.streams.len()
    }

    fn init(&mut self) -> Result<()> {
        let mut keys = Vec::with_capacity(self.streams.len());
        for stream in self.streams.iter_mut() {
            keys.push(stream.next().transpose()?);
        }
        self.tree = Some(LoserTree::new(keys, &self.cmp)?);
        return Ok(());
    }

    fn advance(&mut self) -> Result<Option<T>> {
        if self.tree.is_none() {
            self.init()?;
        }
        let tree = match self.tree.as_mut() {
            Some(tree) => tree,
            None => return Ok(None),
        };
        if tree.peek().is_none() {
            return Ok(None);
        }

        let idx = tree.winner();
        let next = self.streams[idx].next().transpose()?;
        tree.replace_winner(next, &self.cmp)
    }
}

impl<T, C, S> Iterator for LoserTreeMerger<T, C, S>
where
    C: Comparator<T>,
    S: Iterator<Item = Result<T>>,
{
    type Item = Result<T>;

    /// Returns the next item from the inputs in ascending order.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(item) => item.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
