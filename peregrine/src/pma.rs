//! Physical-memory ownership tracking.
//!
//! Records which partition (or the hypervisor) a physical range has been
//! handed to, so that a range cannot be mapped on behalf of two owners.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::addr::{round_down_to_page, round_up_to_page};
use crate::vm::VmId;
use crate::Paddr;

/// Page-granular ownership map.
pub struct Pma {
    // begin -> (end, owner); ranges never overlap.
    regions: Mutex<BTreeMap<usize, (usize, VmId)>>,
}

fn page_range(begin: Paddr, end: Paddr) -> (usize, usize) {
    (round_down_to_page(begin.addr()), round_up_to_page(end.addr()))
}

/// Regions intersecting `[begin, end)`, in address order.
fn overlapping(
    regions: &BTreeMap<usize, (usize, VmId)>,
    begin: usize,
    end: usize,
) -> Vec<(usize, usize, VmId)> {
    let mut found: Vec<_> = regions
        .range(..end)
        .rev()
        .take_while(|(_, &(e, _))| e > begin)
        .map(|(&b, &(e, owner))| (b, e, owner))
        .collect();
    found.reverse();
    found
}

/// Whether `owner`'s regions in `found` cover all of `[begin, end)`.
fn covers(found: &[(usize, usize, VmId)], begin: usize, end: usize, owner: VmId) -> bool {
    let mut cursor = begin;
    for &(b, e, o) in found {
        if o != owner || b > cursor {
            return false;
        }
        cursor = e;
    }
    cursor >= end
}

impl Pma {
    pub const fn new() -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Marks `[begin, end)` as owned by `owner`. Fails if any page in it
    /// belongs to someone else.
    pub fn reserve(&self, begin: Paddr, end: Paddr, owner: VmId) -> bool {
        let (begin, end) = page_range(begin, end);
        if begin >= end {
            return false;
        }
        let mut regions = self.regions.lock();
        let found = overlapping(&regions, begin, end);
        if let Some(&(b, e, o)) = found.iter().find(|r| r.2 != owner) {
            warn!(
                "[PG] pma: [{:#x}, {:#x}) already owned by {} at [{:#x}, {:#x})",
                begin, end, o, b, e
            );
            return false;
        }
        let mut new_begin = begin;
        let mut new_end = end;
        for &(b, e, _) in &found {
            regions.remove(&b);
            new_begin = new_begin.min(b);
            new_end = new_end.max(e);
        }
        regions.insert(new_begin, (new_end, owner));
        trace!("[PG] pma: reserved [{:#x}, {:#x}) for {}", begin, end, owner);
        true
    }

    /// Gives up `owner`'s claim on `[begin, end)`. Fails, changing nothing,
    /// unless `owner` holds the whole range.
    pub fn release(&self, begin: Paddr, end: Paddr, owner: VmId) -> bool {
        let (begin, end) = page_range(begin, end);
        let mut regions = self.regions.lock();
        let found = overlapping(&regions, begin, end);
        if !covers(&found, begin, end, owner) {
            warn!(
                "[PG] pma: releasing [{:#x}, {:#x}) not held by {}",
                begin, end, owner
            );
            return false;
        }
        for (b, e, o) in found {
            regions.remove(&b);
            if b < begin {
                regions.insert(b, (begin, o));
            }
            if e > end {
                regions.insert(end, (e, o));
            }
        }
        trace!("[PG] pma: released [{:#x}, {:#x}) from {}", begin, end, owner);
        true
    }

    pub fn is_assigned(&self, begin: Paddr, end: Paddr, owner: VmId) -> bool {
        let (begin, end) = page_range(begin, end);
        let regions = self.regions.lock();
        begin < end && covers(&overlapping(&regions, begin, end), begin, end, owner)
    }

    pub fn owner_of(&self, pa: Paddr) -> Option<VmId> {
        let regions = self.regions.lock();
        regions
            .range(..=pa.addr())
            .next_back()
            .filter(|(_, &(end, _))| end > pa.addr())
            .map(|(_, &(_, owner))| owner)
    }
}

impl Default for Pma {
    fn default() -> Self {
        Self::new()
    }
}
