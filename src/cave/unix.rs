//! Codecave allocation on unix, driven by the `/proc/self/maps` snapshot.

use super::{Bound, CAVE_SIZE};
use crate::mem;

/// Finds a free gap inside `bound` and maps one executable cave there,
/// preferring the gap closest to `target`. Returns `None` when every
/// candidate gap refuses to map.
pub(super) fn allocate_in(bound: &Bound, target: usize) -> Option<usize> {
    let page = mem::page_size();
    for candidate in candidates(bound, target, page, &mem::regions()) {
        if let Some(addr) = map_at(candidate) {
            return Some(addr);
        }
    }
    None
}

pub(super) fn free(addr: usize, len: usize) -> bool {
    unsafe { libc::munmap(addr as *mut libc::c_void, len) == 0 }
}

/// Page-aligned addresses of free gaps that can hold a cave, ordered by
/// distance from `target`.
fn candidates(bound: &Bound, target: usize, page: usize, regions: &[mem::Region]) -> Vec<usize> {
    let mut gaps: Vec<(usize, usize)> = Vec::new();
    // never hand out the null page
    let mut prev_end = page;
    for r in regions {
        if r.start > prev_end {
            gaps.push((prev_end, r.start));
        }
        prev_end = prev_end.max(r.end);
    }

    let mut candidates: Vec<usize> = gaps
        .into_iter()
        .filter_map(|(lo, hi)| {
            let lo = lo.max(bound.min).next_multiple_of(page);
            let hi = hi.min(bound.max);
            (hi.checked_sub(lo)? >= CAVE_SIZE).then(|| {
                // inside the gap, sit as close to the target as allowed;
                // clamp reserves the cave itself below `hi`
                let best = Bound { min: lo, max: hi }.clamp(target);
                best - best % page
            })
        })
        .collect();
    candidates.sort_by_key(|&addr| addr.abs_diff(target));
    candidates
}

#[cfg(target_os = "linux")]
fn map_at(addr: usize) -> Option<usize> {
    let mapped = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            CAVE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    (mapped != libc::MAP_FAILED).then_some(mapped as usize)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn map_at(addr: usize) -> Option<usize> {
    // no MAP_FIXED_NOREPLACE; pass a hint and verify where the mapping landed
    let mapped = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            CAVE_SIZE,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return None;
    }
    if mapped as usize == addr {
        Some(addr)
    } else {
        unsafe { libc::munmap(mapped, CAVE_SIZE) };
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{Protection, Region};

    const PAGE: usize = 0x1000;

    fn region(start: usize, end: usize) -> Region {
        Region {
            start,
            end,
            protect: Protection::READ,
            path: None,
        }
    }

    #[test]
    fn gap_of_exactly_one_cave_is_usable() {
        // the shape a previous cave allocation leaves behind
        let regions = [region(0x10000, 0x20000), region(0x20000 + CAVE_SIZE, 0x40000)];
        let bound = Bound { min: PAGE, max: 0x100000 };
        let c = candidates(&bound, 0x20000, PAGE, &regions);
        assert!(c.contains(&0x20000));
    }

    #[test]
    fn narrow_gap_candidate_stays_inside_its_gap() {
        let gap_lo = 0x20000;
        let gap_hi = gap_lo + CAVE_SIZE + PAGE;
        let regions = [region(0x10000, gap_lo), region(gap_hi, 0x40000)];
        let bound = Bound { min: PAGE, max: 0x100000 };
        // a target past the gap clamps to the highest fitting address
        let c = candidates(&bound, 0x30000, PAGE, &regions);
        assert_eq!(c.first(), Some(&(gap_hi - CAVE_SIZE)));
        for addr in &c {
            assert!(addr % PAGE == 0);
            assert!(bound.contains(*addr));
        }
    }
}
