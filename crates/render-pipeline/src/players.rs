//! Player registry: a fixed arena of pipeline contexts addressed by
//! generation-checked handles, so a handle held across a release/reuse of
//! the same slot goes stale instead of aliasing the new player.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};
use render_bridge_types::StatusEvent;

use crate::context::{PipelineConfig, PipelineContext};
use crate::error::{PipelineError, Result};

pub const MAX_PLAYERS: usize = 32;

/// Opaque reference to an allocated player.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlayerHandle {
    index: usize,
    generation: u64,
}

impl PlayerHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

struct Slot {
    generation: u64,
    player: Option<Arc<PipelineContext>>,
}

pub struct PlayerRegistry {
    slots: Mutex<Vec<Slot>>,
    /// Events from every player, fanned into one stream tagged by handle.
    events_tx: Sender<(PlayerHandle, StatusEvent)>,
    events_rx: Receiver<(PlayerHandle, StatusEvent)>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        let slots = (0..MAX_PLAYERS)
            .map(|_| Slot {
                generation: 0,
                player: None,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            events_tx,
            events_rx,
        }
    }

    /// Tagged status events from all players.
    pub fn events(&self) -> Receiver<(PlayerHandle, StatusEvent)> {
        self.events_rx.clone()
    }

    /// Start a player in the first free slot.
    pub fn allocate(&self, config: PipelineConfig) -> Result<PlayerHandle> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(|s| s.player.is_none())
            .ok_or(PipelineError::NoFreeSlot)?;
        let handle = PlayerHandle {
            index,
            generation: slots[index].generation + 1,
        };

        // Forward this player's events into the shared stream, tagged.
        let (tx, rx) = unbounded();
        let fanout = self.events_tx.clone();
        std::thread::Builder::new()
            .name(format!("player-events-{index}"))
            .spawn(move || {
                for ev in rx {
                    if fanout.send((handle, ev)).is_err() {
                        break;
                    }
                }
            })
            .map_err(PipelineError::Io)?;

        let player = PipelineContext::start_with_events(config, tx)?;
        let slot = &mut slots[index];
        slot.generation = handle.generation;
        slot.player = Some(player);
        tracing::info!(index, generation = handle.generation, "player allocated");
        Ok(handle)
    }

    pub fn get(&self, handle: PlayerHandle) -> Result<Arc<PipelineContext>> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(handle.index).ok_or(PipelineError::StaleHandle)?;
        if slot.generation != handle.generation {
            return Err(PipelineError::StaleHandle);
        }
        slot.player.clone().ok_or(PipelineError::StaleHandle)
    }

    /// Stop the player and free its slot. A stale handle is a no-op error.
    pub fn release(&self, handle: PlayerHandle) -> Result<()> {
        let player = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.get_mut(handle.index).ok_or(PipelineError::StaleHandle)?;
            if slot.generation != handle.generation {
                return Err(PipelineError::StaleHandle);
            }
            slot.player.take().ok_or(PipelineError::StaleHandle)?
        };
        player.shutdown();
        tracing::info!(index = handle.index, "player released");
        Ok(())
    }

    pub fn active_handles(&self) -> Vec<PlayerHandle> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.player.is_some())
            .map(|(index, s)| PlayerHandle {
                index,
                generation: s.generation,
            })
            .collect()
    }

    /// Shut down every active player.
    pub fn shutdown_all(&self) {
        for handle in self.active_handles() {
            let _ = self.release(handle);
        }
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            bind: "127.0.0.1:0".into(),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn allocate_get_release() {
        let reg = PlayerRegistry::new();
        let h = reg.allocate(test_config()).unwrap();
        assert!(reg.get(h).is_ok());
        reg.release(h).unwrap();
        assert!(matches!(reg.get(h), Err(PipelineError::StaleHandle)));
    }

    #[test]
    fn reused_slot_invalidates_old_handle() {
        let reg = PlayerRegistry::new();
        let h1 = reg.allocate(test_config()).unwrap();
        reg.release(h1).unwrap();
        let h2 = reg.allocate(test_config()).unwrap();
        assert_eq!(h1.index(), h2.index());
        assert!(matches!(reg.get(h1), Err(PipelineError::StaleHandle)));
        assert!(reg.get(h2).is_ok());
        reg.shutdown_all();
    }

    #[test]
    fn release_twice_is_stale() {
        let reg = PlayerRegistry::new();
        let h = reg.allocate(test_config()).unwrap();
        reg.release(h).unwrap();
        assert!(matches!(reg.release(h), Err(PipelineError::StaleHandle)));
    }
}
