//! Run-length index of the pages of an area that have a backing frame.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::{PAGE_SIZE, VirtualAddress};

/// Ordered set of resolved pages, stored as runs of consecutive pages.
///
/// Runs are keyed by their first page address. Adjacent runs are always coalesced, so
/// the index of an area that was faulted in front to back is a single entry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UsedSpace {
    runs: BTreeMap<usize, usize>,
}

const fn run_end(start: usize, pages: usize) -> usize {
    start + pages * PAGE_SIZE
}

impl UsedSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Total number of resolved pages.
    pub fn pages(&self) -> usize {
        self.runs.values().sum()
    }

    /// Returns true if `page` is resolved.
    pub fn contains(&self, page: VirtualAddress) -> bool {
        let addr = page.as_usize();
        self.runs
            .range(..=addr)
            .next_back()
            .is_some_and(|(&start, &pages)| addr < run_end(start, pages))
    }

    /// Records `count` pages starting at `page`, returning how many were not already present.
    pub fn insert(&mut self, page: VirtualAddress, count: usize) -> usize {
        debug_assert!(page.is_page_aligned(), "used space is tracked in whole pages");
        if count == 0 {
            return 0;
        }

        let start = page.as_usize();
        let end = run_end(start, count);
        let touching: Vec<(usize, usize)> = self
            .runs
            .range(..=end)
            .rev()
            .take_while(|&(&run_start, &pages)| run_end(run_start, pages) >= start)
            .map(|(&run_start, &pages)| (run_start, pages))
            .collect();

        let mut merged_start = start;
        let mut merged_end = end;
        let mut already_present = 0;
        for (run_start, pages) in touching {
            let run_stop = run_end(run_start, pages);
            already_present += run_stop.min(end).saturating_sub(run_start.max(start)) / PAGE_SIZE;
            merged_start = merged_start.min(run_start);
            merged_end = merged_end.max(run_stop);
            self.runs.remove(&run_start);
        }

        self.runs
            .insert(merged_start, (merged_end - merged_start) / PAGE_SIZE);
        count - already_present
    }

    /// Forgets `count` pages starting at `page`, returning how many were present.
    pub fn remove(&mut self, page: VirtualAddress, count: usize) -> usize {
        debug_assert!(page.is_page_aligned(), "used space is tracked in whole pages");
        if count == 0 {
            return 0;
        }

        let start = page.as_usize();
        let end = run_end(start, count);
        let overlapping: Vec<(usize, usize)> = self
            .runs
            .range(..end)
            .rev()
            .take_while(|&(&run_start, &pages)| run_end(run_start, pages) > start)
            .map(|(&run_start, &pages)| (run_start, pages))
            .collect();

        let mut removed = 0;
        for (run_start, pages) in overlapping {
            let run_stop = run_end(run_start, pages);
            self.runs.remove(&run_start);
            removed += (run_stop.min(end) - run_start.max(start)) / PAGE_SIZE;
            if run_start < start {
                self.runs.insert(run_start, (start - run_start) / PAGE_SIZE);
            }
            if run_stop > end {
                self.runs.insert(end, (run_stop - end) / PAGE_SIZE);
            }
        }
        removed
    }

    /// Iterates over the runs as `(first page, page count)`.
    pub fn runs(&self) -> impl Iterator<Item = (VirtualAddress, usize)> + '_ {
        self.runs
            .iter()
            .map(|(&start, &pages)| (VirtualAddress::new(start), pages))
    }

    /// Iterates over every resolved page in ascending order.
    pub fn iter_pages(&self) -> impl Iterator<Item = VirtualAddress> + '_ {
        self.runs.iter().flat_map(|(&start, &pages)| {
            (0..pages).map(move |page| VirtualAddress::new(start + page * PAGE_SIZE))
        })
    }
}
