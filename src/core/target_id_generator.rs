use crate::model::TargetId;

const RESERVED_BITS: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GeneratorId {
    TargetCache = 0,
    SyncEngine = 1,
}

/// Hands out target ids from disjoint spaces: even ids for persisted query
/// targets, odd ids for in-memory limbo resolution targets.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    generator_id: GeneratorId,
    previous_id: TargetId,
}

impl TargetIdGenerator {
    fn new(generator_id: GeneratorId, seed: TargetId) -> Self {
        let mut generator = Self {
            generator_id,
            previous_id: 0,
        };
        generator.seek(seed);
        generator
    }

    /// Generator whose next id follows `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        // Seeding with the current id makes `next` skip past it.
        Self::new(GeneratorId::TargetCache, highest_target_id)
    }

    pub fn for_sync_engine() -> Self {
        Self::new(GeneratorId::SyncEngine, -1)
    }

    fn seek(&mut self, target_id: TargetId) {
        let id = self.generator_id as i32;
        // Round down to the previous id in this generator's space.
        let candidate = (target_id & !((1 << RESERVED_BITS) - 1)) | id;
        self.previous_id = if candidate > target_id {
            candidate - (1 << RESERVED_BITS)
        } else {
            candidate
        };
    }

    pub fn next(&mut self) -> TargetId {
        self.previous_id += 1 << RESERVED_BITS;
        self.previous_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_cache_ids_are_even_and_increasing() {
        let mut generator = TargetIdGenerator::for_target_cache(0);
        assert_eq!(generator.next(), 2);
        assert_eq!(generator.next(), 4);

        let mut resumed = TargetIdGenerator::for_target_cache(6);
        assert_eq!(resumed.next(), 8);
    }

    #[test]
    fn sync_engine_ids_are_odd() {
        let mut generator = TargetIdGenerator::for_sync_engine();
        assert_eq!(generator.next(), 1);
        assert_eq!(generator.next(), 3);
    }
}
