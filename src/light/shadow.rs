//! Shadow map staleness and slot allocation

use bevy_ecs::entity::Entity;

/// Whether a shadow map still matches the scene
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    /// Something moved after the map was rendered
    Stale,
    Current,
}

/// Tracks the cycle in which a light's shadow map was last rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowTracker {
    last_rendered_cycle: Option<u64>,
}

impl ShadowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_rendered_cycle(&self) -> Option<u64> {
        self.last_rendered_cycle
    }

    /// A map is stale iff `last_rendered < max(entity_moved, light_moved)`; one never
    /// rendered is always stale
    pub fn state(&self, entity_moved_in_cycle: u64, light_moved_in_cycle: u64) -> ShadowState {
        match self.last_rendered_cycle {
            Some(rendered) if rendered >= entity_moved_in_cycle.max(light_moved_in_cycle) => {
                ShadowState::Current
            }
            _ => ShadowState::Stale,
        }
    }

    pub fn needs_redraw(&self, entity_moved_in_cycle: u64, light_moved_in_cycle: u64) -> bool {
        self.state(entity_moved_in_cycle, light_moved_in_cycle) == ShadowState::Stale
    }

    pub fn mark_rendered(&mut self, cycle: u64) {
        self.last_rendered_cycle = Some(cycle);
    }

    /// Force the next check to redraw
    pub fn invalidate(&mut self) {
        self.last_rendered_cycle = None;
    }
}

/// Fixed-size table mapping lights to shadow map layers
///
/// Slots are handed out first-come. A light keeps its slot until it is released,
/// and lights arriving when the table is full get none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowSlots {
    slots: Vec<Option<Entity>>,
}

impl ShadowSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn index_of(&self, entity: Entity) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == Some(entity))
    }

    /// Existing slot of `entity`, or the first free one
    pub fn assign(&mut self, entity: Entity) -> Option<usize> {
        if let Some(index) = self.index_of(entity) {
            return Some(index);
        }
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(entity);
        Some(index)
    }

    pub fn release(&mut self, entity: Entity) -> bool {
        match self.index_of(entity) {
            Some(index) => {
                self.slots[index] = None;
                true
            }
            None => false,
        }
    }

    /// Free every slot whose light fails `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(Entity) -> bool) {
        for slot in &mut self.slots {
            if let Some(entity) = *slot {
                if !keep(entity) {
                    *slot = None;
                }
            }
        }
    }
}

/// Slot as the shaders expect it, -1 meaning no shadow
pub fn pack_shadow_index(slot: Option<usize>) -> i32 {
    slot.map_or(-1, |index| index as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::world::World;

    #[test]
    fn test_never_rendered_is_stale() {
        let tracker = ShadowTracker::new();
        assert_eq!(tracker.state(0, 0), ShadowState::Stale);
    }

    #[test]
    fn test_redraw_only_after_movement() {
        let mut tracker = ShadowTracker::new();
        tracker.mark_rendered(5);
        assert!(!tracker.needs_redraw(5, 3));
        assert!(!tracker.needs_redraw(0, 5));
        assert!(tracker.needs_redraw(6, 0));
        assert!(tracker.needs_redraw(2, 6));
        tracker.mark_rendered(6);
        assert!(!tracker.needs_redraw(6, 6));
    }

    #[test]
    fn test_slots_are_first_come_and_reused() {
        let mut world = World::new();
        let lights: Vec<Entity> = (0..3).map(|_| world.spawn_empty().id()).collect();
        let mut slots = ShadowSlots::new(2);

        assert_eq!(slots.assign(lights[0]), Some(0));
        assert_eq!(slots.assign(lights[1]), Some(1));
        assert_eq!(slots.assign(lights[2]), None);
        assert_eq!(slots.assign(lights[0]), Some(0));

        assert!(slots.release(lights[0]));
        assert_eq!(slots.assign(lights[2]), Some(0));
        assert_eq!(pack_shadow_index(slots.index_of(lights[0])), -1);
    }
}
