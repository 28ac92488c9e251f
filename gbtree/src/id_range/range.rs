//! Markable id ranges.

/// Error returned by `next_id` once a range has handed out all of its ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeExhaustedError {
    /// Page of the exhausted range.
    pub page_id: u64,
}

impl std::fmt::Display for RangeExhaustedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "id range of page {} is exhausted", self.page_id)
    }
}

impl std::error::Error for RangeExhaustedError {}

/// A leasable set of ids, consumed in order, with a replayable mark.
///
/// `reset_to_mark` restores the cursor to exactly where it was at the last
/// `mark` (or the start, if never marked), so a batch that fails half way can
/// be replayed with the same ids.
pub trait IdRange {
    /// Next id, or `RangeExhaustedError` once every id was handed out.
    fn next_id(&mut self) -> Result<u64, RangeExhaustedError>;

    /// Remember the current position.
    fn mark(&mut self);

    /// Return to the position of the last `mark`.
    fn reset_to_mark(&mut self);

    /// True if `next_id` would succeed.
    fn has_next(&self) -> bool {
        self.remaining() > 0
    }

    /// Ids not yet handed out.
    fn remaining(&self) -> usize;

    /// Page the range belongs to: its first id divided by the stride.
    fn page_id(&self) -> u64;

    /// Give up every id not yet handed out, returning them. The range is
    /// exhausted afterwards.
    fn unallocate(&mut self) -> Vec<u64>;
}

/// The dense interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuousRange {
    start: u64,
    end: u64,
    stride: u64,
    cursor: u64,
    mark: u64,
}

impl ContinuousRange {
    /// Ids `start..end`; `stride` is the number of ids per page (at least 1).
    #[must_use]
    pub fn new(start: u64, end: u64, stride: u64) -> Self {
        let end = end.max(start);
        Self {
            start,
            end,
            stride: stride.max(1),
            cursor: start,
            mark: start,
        }
    }
}

impl IdRange for ContinuousRange {
    fn next_id(&mut self) -> Result<u64, RangeExhaustedError> {
        if self.cursor >= self.end {
            return Err(RangeExhaustedError {
                page_id: self.page_id(),
            });
        }
        let id = self.cursor;
        self.cursor += 1;
        Ok(id)
    }

    fn mark(&mut self) {
        self.mark = self.cursor;
    }

    fn reset_to_mark(&mut self) {
        self.cursor = self.mark;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn remaining(&self) -> usize {
        (self.end - self.cursor) as usize
    }

    fn page_id(&self) -> u64 {
        self.start / self.stride
    }

    fn unallocate(&mut self) -> Vec<u64> {
        let ids = (self.cursor..self.end).collect();
        self.cursor = self.end;
        self.mark = self.end;
        ids
    }
}

/// An explicit, possibly non-contiguous list of ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayRange {
    ids: Vec<u64>,
    stride: u64,
    cursor: usize,
    mark: usize,
}

impl ArrayRange {
    /// Hand out `ids` in the given order; `stride` is the number of ids per
    /// page (at least 1).
    #[must_use]
    pub fn new(ids: Vec<u64>, stride: u64) -> Self {
        Self {
            ids,
            stride: stride.max(1),
            cursor: 0,
            mark: 0,
        }
    }
}

impl IdRange for ArrayRange {
    fn next_id(&mut self) -> Result<u64, RangeExhaustedError> {
        let Some(&id) = self.ids.get(self.cursor) else {
            return Err(RangeExhaustedError {
                page_id: self.page_id(),
            });
        };
        self.cursor += 1;
        Ok(id)
    }

    fn mark(&mut self) {
        self.mark = self.cursor;
    }

    fn reset_to_mark(&mut self) {
        self.cursor = self.mark;
    }

    fn remaining(&self) -> usize {
        self.ids.len() - self.cursor
    }

    fn page_id(&self) -> u64 {
        self.ids.first().map_or(0, |id| id / self.stride)
    }

    fn unallocate(&mut self) -> Vec<u64> {
        let ids = self.ids[self.cursor..].to_vec();
        self.cursor = self.ids.len();
        self.mark = self.cursor;
        ids
    }
}
