//! Victim-block selection policies.
//!
//! Every policy draws from the same legality filter; they differ only in how
//! they rank the legal candidates. Randomized policies take the caller's
//! seeded RNG so runs stay reproducible.

use fsim_config::GcPolicy;
use fsim_fbm::PlaneBookkeeping;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

/// A block may be reclaimed only when it is fully written, is nobody's write
/// frontier, has no erase in flight, no user or background program in
/// flight, and no other GC/WL claim on it.
#[must_use]
pub fn is_legal_victim(plane: &PlaneBookkeeping, block_id: u32, pages_per_block: u32) -> bool {
    let record = &plane.blocks[block_id as usize];
    record.write_index == pages_per_block
        && !plane.is_write_frontier(block_id)
        && !plane.erasing_blocks.contains(&block_id)
        && record.ongoing_user_programs == 0
        && record.ongoing_background_programs == 0
        && !record.state.gc_in_progress()
}

/// Pick a victim block for the plane, or `None` when no candidate is worth
/// reclaiming this round.
#[must_use]
pub fn select_victim(
    policy: GcPolicy,
    plane: &PlaneBookkeeping,
    pages_per_block: u32,
    rga_set_size: u32,
    random_pp_threshold: u32,
    rng: &mut SmallRng,
) -> Option<u32> {
    let legal: Vec<u32> = (0..plane.blocks.len() as u32)
        .filter(|&id| is_legal_victim(plane, id, pages_per_block))
        .collect();
    if legal.is_empty() {
        return None;
    }
    let invalid = |id: u32| plane.blocks[id as usize].invalid_page_count;
    let valid = |id: u32| plane.blocks[id as usize].valid_page_count();

    match policy {
        GcPolicy::Greedy => {
            let best = legal.iter().copied().min_by_key(|&id| valid(id))?;
            (invalid(best) > 0).then_some(best)
        }
        GcPolicy::Rga => {
            let sample: Vec<u32> = legal
                .choose_multiple(rng, rga_set_size as usize)
                .copied()
                .collect();
            let best = sample.into_iter().min_by_key(|&id| valid(id))?;
            (invalid(best) > 0).then_some(best)
        }
        GcPolicy::Random => legal.choose(rng).copied(),
        GcPolicy::RandomP => {
            let gainful: Vec<u32> = legal.into_iter().filter(|&id| invalid(id) > 0).collect();
            gainful.choose(rng).copied()
        }
        GcPolicy::RandomPp => {
            let gainful: Vec<u32> = legal
                .into_iter()
                .filter(|&id| invalid(id) > random_pp_threshold)
                .collect();
            gainful.choose(rng).copied()
        }
        GcPolicy::Fifo => {
            // Oldest block rotated out of a frontier, skipping any that are
            // currently illegal.
            plane
                .usage_history
                .iter()
                .copied()
                .find(|&id| is_legal_victim(plane, id, pages_per_block))
        }
    }
}
