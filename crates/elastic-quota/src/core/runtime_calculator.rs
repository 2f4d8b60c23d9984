//! Weighted max-min fair-share distribution of a parent's runtime.
//!
//! Each child first claims its guarantee (`min(Min, Request)`, or its full
//! Min when it does not lend idle resources). What remains of the parent's
//! capacity is handed out by progressive filling: every unsaturated child
//! receives a weight-proportional share, children that hit their capped
//! demand leave the pool, and the loop restarts with the reduced pool and
//! weight sum. All arithmetic runs on integer milli-units.

use std::collections::HashMap;

use api_types::ResourceList;

/// The per-child inputs of one distribution round.
#[derive(Debug, Clone)]
pub struct ChildQuota {
    pub name: String,
    pub min: ResourceList,
    pub max: ResourceList,
    pub shared_weight: ResourceList,
    pub request: ResourceList,
    pub allow_lent_resource: bool,
}

/// Distribute `parent_available` among `children`, returning each child's
/// runtime vector. Children are processed in lexicographic name order so
/// rounding ties are deterministic.
pub fn calculate_child_runtimes(
    parent_available: &ResourceList,
    children: &[ChildQuota],
) -> HashMap<String, ResourceList> {
    let mut order: Vec<usize> = (0..children.len()).collect();
    order.sort_by(|&a, &b| children[a].name.cmp(&children[b].name));

    let mut runtimes: HashMap<String, ResourceList> =
        children.iter().map(|c| (c.name.clone(), ResourceList::new())).collect();

    let dimensions = collect_dimensions(children);
    for dimension in &dimensions {
        let allocations = distribute_dimension(parent_available.get(dimension), &order, children, dimension);
        for (index, value) in allocations {
            runtimes
                .get_mut(&children[index].name)
                .expect("runtime entry exists for every child")
                .set(dimension, value);
        }
    }

    runtimes
}

/// Union of the dimensions any child declares via Min, Max or Request.
fn collect_dimensions(children: &[ChildQuota]) -> Vec<String> {
    let mut dimensions: Vec<String> = children
        .iter()
        .flat_map(|c| {
            c.min
                .resource_names()
                .chain(c.max.resource_names())
                .chain(c.request.resource_names())
        })
        .map(str::to_string)
        .collect();
    dimensions.sort_unstable();
    dimensions.dedup();
    dimensions
}

/// One dimension of the distribution. Returns (child index, runtime value).
fn distribute_dimension(
    available: i64,
    order: &[usize],
    children: &[ChildQuota],
    dimension: &str,
) -> Vec<(usize, i64)> {
    struct Slot {
        index: usize,
        base: i64,
        demand: i64,
        weight: i64,
        extra: i64,
    }

    let mut slots: Vec<Slot> = Vec::with_capacity(order.len());
    let mut reserved_total: i64 = 0;
    for &index in order {
        let child = &children[index];
        let min = child.min.get(dimension);
        let request = child.request.get(dimension).max(0);
        let want = child.max.get(dimension).min(request);
        // A group that does not lend keeps its whole Min out of the shared
        // pool; its own demand above the guarantee draws from that reserve
        // first.
        let reserved = if child.allow_lent_resource {
            min.min(request)
        } else {
            min
        };
        let base = want.min(reserved).max(min.min(request));
        reserved_total += reserved;
        slots.push(Slot {
            index,
            base,
            demand: (want - base).max(0),
            weight: child.shared_weight.get(dimension).max(0),
            extra: 0,
        });
    }

    let mut pool = (available - reserved_total).max(0);
    let mut active: Vec<usize> = (0..slots.len())
        .filter(|&i| slots[i].demand > 0 && slots[i].weight > 0)
        .collect();

    while pool > 0 && !active.is_empty() {
        let weight_sum: i128 = active.iter().map(|&i| slots[i].weight as i128).sum();
        if weight_sum == 0 {
            break;
        }
        let round_pool = pool;
        let mut saturated = false;
        let mut next_active = Vec::with_capacity(active.len());
        for &i in &active {
            let slot = &mut slots[i];
            let share = ((round_pool as i128 * slot.weight as i128) / weight_sum) as i64;
            let room = slot.demand - slot.extra;
            if share >= room {
                slot.extra += room;
                pool -= room;
                saturated = true;
            } else {
                slot.extra += share;
                pool -= share;
                next_active.push(i);
            }
        }
        active = next_active;
        if !saturated {
            // Final proportional round: the remaining pool was handed out
            // with floor rounding; the sub-milli leftover stays idle.
            break;
        }
    }

    slots
        .into_iter()
        .map(|slot| (slot.index, slot.base + slot.extra))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_types::{RESOURCE_CPU, RESOURCE_MEMORY};

    fn rl(cpu: i64, memory: i64) -> ResourceList {
        ResourceList::new()
            .with(RESOURCE_CPU, cpu)
            .with(RESOURCE_MEMORY, memory)
    }

    fn child(name: &str, min: ResourceList, max: ResourceList, request: ResourceList) -> ChildQuota {
        ChildQuota {
            name: name.to_string(),
            shared_weight: max.clone(),
            min,
            max,
            request,
            allow_lent_resource: true,
        }
    }

    #[test]
    fn request_below_min_gets_exactly_the_request() {
        let children = vec![child(
            "a",
            rl(100_000, 160),
            rl(96_000, 160),
            rl(60_000, 100),
        )];
        let runtimes = calculate_child_runtimes(&rl(96_000, 160), &children);
        assert_eq!(runtimes["a"], rl(60_000, 100));
    }

    #[test]
    fn runtime_never_exceeds_max() {
        let children = vec![child("a", rl(0, 0), rl(10_000, 50), rl(50_000, 500))];
        let runtimes = calculate_child_runtimes(&rl(96_000, 160), &children);
        assert_eq!(runtimes["a"], rl(10_000, 50));
    }

    #[test]
    fn spare_capacity_splits_by_weight() {
        let mut a = child("a", rl(10_000, 0), rl(90_000, 0), rl(90_000, 0));
        let mut b = child("b", rl(10_000, 0), rl(90_000, 0), rl(90_000, 0));
        a.shared_weight = ResourceList::new().with(RESOURCE_CPU, 2);
        b.shared_weight = ResourceList::new().with(RESOURCE_CPU, 1);
        let runtimes = calculate_child_runtimes(
            &ResourceList::new().with(RESOURCE_CPU, 50_000),
            &[a, b],
        );
        // guarantees take 20k, remaining 30k splits 2:1
        assert_eq!(runtimes["a"].get(RESOURCE_CPU), 30_000);
        assert_eq!(runtimes["b"].get(RESOURCE_CPU), 20_000);
    }

    #[test]
    fn saturated_child_releases_the_pool() {
        let mut a = child("a", rl(0, 0), rl(12_000, 0), rl(12_000, 0));
        let mut b = child("b", rl(0, 0), rl(90_000, 0), rl(90_000, 0));
        a.shared_weight = ResourceList::new().with(RESOURCE_CPU, 1);
        b.shared_weight = ResourceList::new().with(RESOURCE_CPU, 1);
        let runtimes = calculate_child_runtimes(
            &ResourceList::new().with(RESOURCE_CPU, 60_000),
            &[a, b],
        );
        // a saturates at 12k, b absorbs the remaining 48k
        assert_eq!(runtimes["a"].get(RESOURCE_CPU), 12_000);
        assert_eq!(runtimes["b"].get(RESOURCE_CPU), 48_000);
    }

    #[test]
    fn non_lending_child_keeps_idle_min_out_of_the_pool() {
        let mut hoarder = child("a-hoarder", rl(40_000, 0), rl(40_000, 0), rl(0, 0));
        hoarder.allow_lent_resource = false;
        let hungry = child("b-hungry", rl(10_000, 0), rl(90_000, 0), rl(90_000, 0));
        let runtimes = calculate_child_runtimes(
            &ResourceList::new().with(RESOURCE_CPU, 60_000),
            &[hoarder.clone(), hungry.clone()],
        );
        // 40k stays reserved for the hoarder even though it requests nothing:
        // the hungry child gets its 10k guarantee plus the 10k left in the pool
        assert_eq!(runtimes["a-hoarder"].get(RESOURCE_CPU), 0);
        assert_eq!(runtimes["b-hungry"].get(RESOURCE_CPU), 20_000);

        // with lending enabled the hungry child sees the idle min
        hoarder.allow_lent_resource = true;
        let runtimes = calculate_child_runtimes(
            &ResourceList::new().with(RESOURCE_CPU, 60_000),
            &[hoarder, hungry],
        );
        assert_eq!(runtimes["b-hungry"].get(RESOURCE_CPU), 60_000);
    }

    #[test]
    fn runtime_stays_above_guarantee() {
        let a = child("a", rl(30_000, 0), rl(90_000, 0), rl(50_000, 0));
        let b = child("b", rl(30_000, 0), rl(90_000, 0), rl(90_000, 0));
        let runtimes = calculate_child_runtimes(
            &ResourceList::new().with(RESOURCE_CPU, 80_000),
            &[a, b],
        );
        // guarantees take 60k, the remaining 20k splits evenly by weight
        assert_eq!(runtimes["a"].get(RESOURCE_CPU), 40_000);
        assert_eq!(runtimes["b"].get(RESOURCE_CPU), 40_000);
    }

    #[test]
    fn zero_pool_leaves_only_guarantees() {
        let a = child("a", rl(30_000, 0), rl(90_000, 0), rl(90_000, 0));
        let b = child("b", rl(30_000, 0), rl(90_000, 0), rl(90_000, 0));
        let runtimes = calculate_child_runtimes(
            &ResourceList::new().with(RESOURCE_CPU, 60_000),
            &[a, b],
        );
        assert_eq!(runtimes["a"].get(RESOURCE_CPU), 30_000);
        assert_eq!(runtimes["b"].get(RESOURCE_CPU), 30_000);
    }

    #[test]
    fn sub_core_requests_keep_milli_precision() {
        let a = child("a", rl(0, 0), rl(300, 0), rl(300, 0));
        let b = child("b", rl(0, 0), rl(700, 0), rl(700, 0));
        let runtimes = calculate_child_runtimes(
            &ResourceList::new().with(RESOURCE_CPU, 1_000),
            &[a, b],
        );
        assert_eq!(runtimes["a"].get(RESOURCE_CPU), 300);
        assert_eq!(runtimes["b"].get(RESOURCE_CPU), 700);
    }

    #[test]
    fn ties_resolve_deterministically_by_name() {
        let make = |name: &str| child(name, rl(0, 0), rl(10_000, 0), rl(10_000, 0));
        let forward = calculate_child_runtimes(
            &ResourceList::new().with(RESOURCE_CPU, 5_001),
            &[make("a"), make("b"), make("c")],
        );
        let backward = calculate_child_runtimes(
            &ResourceList::new().with(RESOURCE_CPU, 5_001),
            &[make("c"), make("b"), make("a")],
        );
        for name in ["a", "b", "c"] {
            assert_eq!(forward[name], backward[name], "{name} differs by input order");
        }
    }
}
