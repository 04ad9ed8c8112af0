//! Allocation engine
//!
//! Pure functions that pick ledger rows for a withdraw and map rows onto the
//! handles a custodian currently holds. Nothing here touches the ledger or a
//! remote session; callers filter candidates (Active, handle unused) first.

use crate::types::{InventoryItem, Item};
use std::collections::HashSet;

/// Result of an allocation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// At most one row per requested unit, in request order
    pub picks: Vec<Item>,
    /// Requested type ids nothing could be found for
    pub unfulfilled: Vec<String>,
}

impl Allocation {
    pub fn is_complete(&self) -> bool {
        self.unfulfilled.is_empty()
    }

    /// Custodians touched by the picks, in first-pick order
    pub fn custodians(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for item in &self.picks {
            if !seen.contains(&item.custodian_id) {
                seen.push(item.custodian_id.clone());
            }
        }
        seen
    }
}

struct CustodianGroup<'a> {
    items: Vec<&'a Item>,
    score: usize,
}

/// Match each requested type id to a candidate row, preferring custodians
/// that hold the most of what was asked for.
///
/// Custodians are scored by how many of their candidates have a requested
/// type id and scanned in descending score order. Ties keep the order in
/// which custodians first appear in `candidates`, so the same input always
/// gives the same picks.
pub fn allocate(candidates: &[Item], requested: &[String]) -> Allocation {
    let wanted: HashSet<&str> = requested.iter().map(String::as_str).collect();

    let mut groups: Vec<(&str, CustodianGroup)> = Vec::new();
    for item in candidates {
        match groups.iter_mut().find(|(id, _)| *id == item.custodian_id) {
            Some((_, group)) => group.items.push(item),
            None => groups.push((
                item.custodian_id.as_str(),
                CustodianGroup {
                    items: vec![item],
                    score: 0,
                },
            )),
        }
    }
    for (_, group) in groups.iter_mut() {
        group.score = group
            .items
            .iter()
            .filter(|i| wanted.contains(i.type_id.as_str()))
            .count();
    }
    // sort_by is stable
    groups.sort_by(|a, b| b.1.score.cmp(&a.1.score));

    let mut claimed: HashSet<&str> = HashSet::new();
    let mut allocation = Allocation::default();

    for type_id in requested {
        let found = groups.iter().find_map(|(_, group)| {
            group.items.iter().copied().find(|item| {
                item.type_id == *type_id && !claimed.contains(item.asset_handle.as_str())
            })
        });

        match found {
            Some(item) => {
                claimed.insert(item.asset_handle.as_str());
                allocation.picks.push(item.clone());
            }
            None => allocation.unfulfilled.push(type_id.clone()),
        }
    }

    allocation
}

/// Assign each row the first inventory handle of the same type that is
/// neither in `used` nor claimed earlier in this pass.
///
/// Returns `(row, live handle)` pairs for the rows that matched; rows
/// without a match are left out.
pub fn resolve_handles(
    inventory: &[InventoryItem],
    rows: &[Item],
    used: &HashSet<String>,
) -> Vec<(Item, String)> {
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut resolved = Vec::with_capacity(rows.len());

    for row in rows {
        let hit = inventory.iter().find(|inv| {
            inv.type_id == row.type_id
                && !used.contains(&inv.asset_handle)
                && !claimed.contains(inv.asset_handle.as_str())
        });
        if let Some(inv) = hit {
            claimed.insert(inv.asset_handle.as_str());
            resolved.push((row.clone(), inv.asset_handle.clone()));
        }
    }

    resolved
}
