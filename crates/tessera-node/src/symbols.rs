//! Position arithmetic over a leaf's symbols stream.
//!
//! The symbols stream interleaves the groups of a leaf: its `p`-th entry
//! names the group of the `p`-th packed entry. Entry `k` of group `g` sits
//! at the position of the `k`-th occurrence of `g`.

use tessera_common::{Result, TesseraError};
use tessera_packed::SubstreamData;

/// Position in `order` where a new entry `at` of `group` goes.
///
/// An entry appended to a group follows the group's last occurrence. If
/// the group is empty it goes before the first entry of a higher group.
pub(crate) fn insert_position(order: &[u64], group: usize, at: usize) -> Result<usize> {
    let group = group as u64;
    let mut seen = 0;
    let mut after_last = None;
    for (pos, &symbol) in order.iter().enumerate() {
        if symbol == group {
            if seen == at {
                return Ok(pos);
            }
            seen += 1;
            after_last = Some(pos + 1);
        }
    }
    if at > seen {
        return Err(TesseraError::IndexOutOfBounds {
            index: at,
            size: seen,
        });
    }
    Ok(after_last.unwrap_or_else(|| {
        order
            .iter()
            .position(|&symbol| symbol > group)
            .unwrap_or(order.len())
    }))
}

/// Entries of each of the first `groups` groups before position `pos`.
pub(crate) fn ranks(order: &[u64], groups: usize, pos: usize) -> Vec<usize> {
    counts(&order[..pos.min(order.len())], groups)
}

/// Occurrences of every symbol below `alphabet`.
pub(crate) fn counts(order: &[u64], alphabet: usize) -> Vec<usize> {
    let mut counts = vec![0; alphabet];
    for &symbol in order {
        if let Some(count) = counts.get_mut(symbol as usize) {
            *count += 1;
        }
    }
    counts
}

/// Pending rewrite of a symbols stream.
#[derive(Debug, Clone)]
pub(crate) struct SymbolsEdit {
    data: SubstreamData,
    order: Vec<u64>,
    changed: bool,
}

impl SymbolsEdit {
    pub(crate) fn new(data: SubstreamData) -> Result<Self> {
        let order = data.symbols()?;
        Ok(Self {
            data,
            order,
            changed: false,
        })
    }

    /// Tags `count` new entries of `group` inserted before its entry `at`.
    pub(crate) fn insert(&mut self, group: usize, at: usize, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let pos = insert_position(&self.order, group, at)?;
        let tags = vec![group as u64; count];
        self.data.insert_rows(pos, &tags)?;
        self.order.splice(pos..pos, tags);
        self.changed = true;
        Ok(())
    }

    /// Drops the tags of `(group, start, end)` entry ranges, all given
    /// against the state before the call.
    pub(crate) fn remove(&mut self, ranges: &[(usize, usize, usize)]) -> Result<()> {
        let mut doomed = Vec::new();
        for &(group, start, end) in ranges {
            doomed.extend(
                self.order
                    .iter()
                    .enumerate()
                    .filter(|&(_, &symbol)| symbol == group as u64)
                    .map(|(pos, _)| pos)
                    .skip(start)
                    .take(end.saturating_sub(start)),
            );
        }
        doomed.sort_unstable();
        while let Some(last) = doomed.pop() {
            let mut first = last;
            while doomed.last() == Some(&(first.wrapping_sub(1))) {
                first -= 1;
                doomed.pop();
            }
            self.data.remove(first, last + 1)?;
            self.order.drain(first..=last);
            self.changed = true;
        }
        Ok(())
    }

    /// The rewritten stream, if anything changed.
    pub(crate) fn into_data(self) -> Option<SubstreamData> {
        self.changed.then_some(self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_packed::{SubstreamKind, SubstreamParams};

    fn edit(order: &[u64]) -> SymbolsEdit {
        let mut data =
            SubstreamData::empty(SubstreamKind::SsrleSeq, SubstreamParams::symbols(2)).unwrap();
        data.insert_rows(0, order).unwrap();
        SymbolsEdit::new(data).unwrap()
    }

    #[test]
    fn test_insert_positions() {
        let order = [0, 2, 0, 2, 2];
        assert_eq!(insert_position(&order, 0, 0).unwrap(), 0);
        assert_eq!(insert_position(&order, 0, 1).unwrap(), 2);
        assert_eq!(insert_position(&order, 0, 2).unwrap(), 3);
        assert_eq!(insert_position(&order, 2, 3).unwrap(), 5);
        // Group 1 is empty: it goes before the first entry of group 2.
        assert_eq!(insert_position(&order, 1, 0).unwrap(), 1);
        assert_eq!(insert_position(&order, 3, 0).unwrap(), 5);
        assert!(insert_position(&order, 0, 3).is_err());
    }

    #[test]
    fn test_ranks_and_counts() {
        let order = [0, 2, 0, 2, 2, 1];
        assert_eq!(ranks(&order, 3, 3), vec![2, 0, 1]);
        assert_eq!(ranks(&order, 3, 99), vec![2, 1, 3]);
        assert_eq!(counts(&order, 4), vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_edit_keeps_order_and_data_together() {
        let mut edit = edit(&[0, 1, 1, 0, 1]);
        edit.insert(1, 1, 2).unwrap();
        assert_eq!(edit.order, vec![0, 1, 1, 1, 1, 0, 1]);
        edit.remove(&[(0, 0, 2), (1, 3, 5)]).unwrap();
        assert_eq!(edit.order, vec![1, 1, 1]);
        let data = edit.into_data().unwrap();
        assert_eq!(data.symbols().unwrap(), vec![1, 1, 1]);
    }

    #[test]
    fn test_untouched_edit_yields_nothing() {
        let mut edit = edit(&[0, 1]);
        edit.insert(0, 0, 0).unwrap();
        edit.remove(&[(1, 1, 1)]).unwrap();
        assert!(edit.into_data().is_none());
    }
}
