use forge_core::Channel;
use tracing::info;

use crate::board::{StatusBoard, StatusSummary};
use crate::controller::{ControllerHandle, ResilienceController};
use crate::state::Phase;

/// Owns the controllers of one client and the board summarising them.
pub struct ResilienceSupervisor {
    handles: Vec<ControllerHandle>,
    board: StatusBoard,
}

impl ResilienceSupervisor {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            board: StatusBoard::new(),
        }
    }

    /// Start a controller and put it on the board.
    ///
    /// A controller for a channel that is already supervised replaces the old
    /// one; the old one is shut down first.
    pub async fn spawn(&mut self, controller: ResilienceController) {
        let channel = controller.channel();
        if let Some(pos) = self.handles.iter().position(|h| h.channel() == channel) {
            let old = self.handles.remove(pos);
            old.shutdown().await;
        }
        info!(channel = %channel, "supervising controller");
        let handle = controller.spawn();
        self.board.track(&handle);
        self.handles.push(handle);
        self.handles.sort_by_key(|h| h.channel());
    }

    pub fn get(&self, channel: Channel) -> Option<&ControllerHandle> {
        self.handles.iter().find(|h| h.channel() == channel)
    }

    /// Forward an external connectivity signal to every controller.
    pub fn connectivity_restored(&self) {
        info!(controllers = self.handles.len(), "broadcasting connectivity restored");
        for handle in &self.handles {
            handle.connectivity_restored();
        }
    }

    pub fn summary(&self) -> StatusSummary {
        self.board.summary()
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// `(channel, phase)` for every controller, sorted by channel.
    pub fn statuses(&self) -> Vec<(Channel, Phase)> {
        self.handles.iter().map(|h| (h.channel(), h.phase())).collect()
    }

    /// Stop every controller and record their final state on the board.
    pub async fn shutdown_all(&mut self) {
        for handle in &self.handles {
            handle.shutdown().await;
        }
        self.board.stop();
        for handle in &self.handles {
            self.board.record(&handle.state());
        }
        info!("all controllers stopped");
    }
}

impl Default for ResilienceSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
