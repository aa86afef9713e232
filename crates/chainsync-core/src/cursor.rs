//! Scheduling cursor: decides which block numbers a scheduler tick enqueues.

use crate::number::BlockNumber;

/// The half-open range `[start, end)` of block numbers one tick publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlWindow {
    pub start: BlockNumber,
    pub end: BlockNumber,
}

impl CrawlWindow {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Iterates the block numbers in the window in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = BlockNumber> {
        let end = self.end;
        std::iter::successors(Some(self.start), |n| Some(n.next())).take_while(move |n| *n < end)
    }
}

/// Window parameters taken from scheduler configuration.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    /// Lowest block number ever scheduled.
    pub start_at: BlockNumber,
    /// Trailing blocks re-crawled every cycle because they may still reorg.
    pub unstable_number: u64,
    /// Upper bound on requests published per tick.
    pub batch_limit: u64,
}

impl Cursor {
    pub fn new(start_at: BlockNumber, unstable_number: u64, batch_limit: u64) -> Self {
        Self {
            start_at,
            unstable_number,
            batch_limit,
        }
    }

    /// Raises a persisted cursor to `start_at`. Returns `None` when no clamp is needed.
    pub fn clamp(&self, persisted: BlockNumber) -> Option<BlockNumber> {
        (persisted < self.start_at).then_some(self.start_at)
    }

    /// Computes the window for a tick given the persisted cursor and chain head.
    ///
    /// The window starts `unstable_number` blocks behind the cursor (never below
    /// `start_at`), stops at the head (exclusive), and spans at most
    /// `batch_limit` blocks.
    pub fn window(&self, cursor: BlockNumber, head: BlockNumber) -> CrawlWindow {
        let start = cursor.saturating_sub(self.unstable_number).max(self.start_at);
        let limit = start.saturating_add(self.batch_limit);
        CrawlWindow {
            start,
            end: limit.min(head).max(start),
        }
    }

    /// Cursor to persist after publishing up to (not including) `reached`.
    /// Never moves backwards.
    pub fn advance(&self, previous: BlockNumber, reached: BlockNumber) -> BlockNumber {
        previous.max(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: u64) -> BlockNumber {
        BlockNumber::from(v)
    }

    #[test]
    fn fresh_chain_window() {
        let cursor = Cursor::new(n(0), 20, 100);
        let window = cursor.window(n(0), n(50));
        assert_eq!(window, CrawlWindow { start: n(0), end: n(50) });
        assert_eq!(window.iter().count(), 50);
        assert_eq!(cursor.advance(n(0), window.end), n(50));
    }

    #[test]
    fn window_rewinds_over_unstable_blocks() {
        let cursor = Cursor::new(n(0), 20, 100);
        let window = cursor.window(n(50), n(60));
        assert_eq!(window.start, n(30));
        assert_eq!(window.end, n(60));
    }

    #[test]
    fn window_is_bounded_by_batch_limit() {
        let cursor = Cursor::new(n(0), 20, 100);
        let window = cursor.window(n(1_000), n(5_000));
        assert_eq!(window, CrawlWindow { start: n(980), end: n(1_080) });
    }

    #[test]
    fn window_never_starts_below_start_at() {
        let cursor = Cursor::new(n(500), 20, 100);
        assert_eq!(cursor.clamp(n(10)), Some(n(500)));
        assert_eq!(cursor.clamp(n(510)), None);
        assert_eq!(cursor.window(n(510), n(1_000)).start, n(500));
    }

    #[test]
    fn head_behind_window_is_empty() {
        let cursor = Cursor::new(n(0), 20, 100);
        let window = cursor.window(n(100), n(50));
        assert!(window.is_empty());
        assert_eq!(window.iter().count(), 0);
        // The cursor never moves backwards.
        assert_eq!(cursor.advance(n(100), window.start), n(100));
    }
}
