//! Capture number assignment.
//!
//! With two devices in odd/even roles a shot takes the smallest even number
//! `e` such that neither `e` nor `e + 1` is in use; the even device gets `e`
//! and the odd device `e + 1`. Gaps left by deleted pages are refilled this
//! way. Devices without a role take the smallest free number, devices with a
//! role the smallest free number of matching parity.

use std::collections::BTreeSet;

use crate::device::TargetPage;
use crate::page::Page;

fn matches_parity(num: u32, target: Option<TargetPage>) -> bool {
    match target {
        None => true,
        Some(TargetPage::Even) => num % 2 == 0,
        Some(TargetPage::Odd) => num % 2 == 1,
    }
}

/// Smallest even `e` with `e` and `e + 1` both free.
pub fn next_pair(used: &BTreeSet<u32>) -> u32 {
    (0..)
        .step_by(2)
        .find(|e| !used.contains(e) && !used.contains(&(e + 1)))
        .unwrap_or(0)
}

/// Smallest free number of the parity `target` asks for.
pub fn next_single(used: &BTreeSet<u32>, target: Option<TargetPage>) -> u32 {
    (0..)
        .find(|n| matches_parity(*n, target) && !used.contains(n))
        .unwrap_or(0)
}

/// Whether the roles form a proper odd/even pair.
pub fn is_pair(targets: &[Option<TargetPage>]) -> bool {
    matches!(
        targets,
        [Some(a), Some(b)] if a != b
    )
}

/// Capture numbers a retake replaces.
///
/// The last shot is reused while every one of its pages is still present.
/// Otherwise an odd/even pair falls back to the highest complete pair, and
/// devices without roles to the highest numbers present. Empty when nothing
/// qualifies, in which case the retake shoots fresh numbers.
pub fn retake_numbers(
    present: &BTreeSet<u32>,
    last: &[u32],
    targets: &[Option<TargetPage>],
) -> Vec<u32> {
    let last_intact = last.len() == targets.len() && last.iter().all(|n| present.contains(n));

    if is_pair(targets) {
        let mut sorted = last.to_vec();
        sorted.sort_unstable();
        if let [e, o] = sorted.as_slice() {
            if last_intact && e % 2 == 0 && *o == e + 1 {
                return sorted;
            }
        }
        return present
            .iter()
            .rev()
            .find(|n| *n % 2 == 0 && present.contains(&(*n + 1)))
            .map(|e| vec![*e, e + 1])
            .unwrap_or_default();
    }

    let still: Vec<u32> = last.iter().copied().filter(|n| present.contains(n)).collect();
    if !still.is_empty() {
        return still;
    }
    let mut highest: Vec<u32> = present.iter().rev().take(targets.len()).copied().collect();
    highest.reverse();
    highest
}

/// Capture numbers for one shot, one per device in device order.
///
/// `reuse` holds the numbers of a retaken shot; they are handed out again
/// when they fit the roles. `flip` swaps the odd/even path assignment.
pub fn assign(
    targets: &[Option<TargetPage>],
    used: &BTreeSet<u32>,
    reuse: &[u32],
    flip: bool,
) -> Vec<u32> {
    let targets: Vec<Option<TargetPage>> = targets
        .iter()
        .map(|t| if flip { t.map(TargetPage::flipped) } else { *t })
        .collect();

    if is_pair(&targets) {
        let mut sorted = reuse.to_vec();
        sorted.sort_unstable();
        let even = match sorted.as_slice() {
            [e, o] if e % 2 == 0 && *o == e + 1 => *e,
            _ => next_pair(used),
        };
        return targets
            .iter()
            .map(|t| match t {
                Some(TargetPage::Odd) => even + 1,
                _ => even,
            })
            .collect();
    }

    let mut taken = used.clone();
    let mut reusable: Vec<u32> = reuse.to_vec();
    targets
        .iter()
        .map(|target| {
            let num = match reusable.iter().position(|n| matches_parity(*n, *target)) {
                Some(idx) => reusable.remove(idx),
                None => next_single(&taken, *target),
            };
            taken.insert(num);
            num
        })
        .collect()
}

/// Position at which a page with `capture_num` joins the sequence: before
/// the first page with a larger capture number.
pub fn insertion_index(pages: &[Page], capture_num: u32) -> usize {
    pages
        .iter()
        .position(|p| p.capture_num > capture_num)
        .unwrap_or(pages.len())
}

/// Rewrites `sequence_num` as `0..n`.
pub fn renumber(pages: &mut [Page]) {
    for (idx, page) in pages.iter_mut().enumerate() {
        page.renumber(idx as u32);
    }
}
