//! Agent-speaking and processing flags shared with the recorder

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Writable flags owned by the turn coordinator
#[derive(Debug, Clone, Default)]
pub struct AgentFlags {
    speaking: Arc<AtomicBool>,
    processing: Arc<AtomicBool>,
}

impl AgentFlags {
    /// Both flags cleared
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the agent as producing audio
    pub fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::SeqCst);
    }

    /// Mark an utterance as being handled
    pub fn set_processing(&self, processing: bool) {
        self.processing.store(processing, Ordering::SeqCst);
    }

    /// Whether the agent is speaking
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Whether a turn is being processed
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Read-only view for the recorder
    #[must_use]
    pub fn gate(&self) -> ListenGate {
        ListenGate {
            speaking: Arc::clone(&self.speaking),
            processing: Arc::clone(&self.processing),
        }
    }
}

/// Read-only view of the agent flags
#[derive(Debug, Clone)]
pub struct ListenGate {
    speaking: Arc<AtomicBool>,
    processing: Arc<AtomicBool>,
}

impl ListenGate {
    /// Gate that never closes
    #[must_use]
    pub fn always_open() -> Self {
        AgentFlags::new().gate()
    }

    /// Agent audio is playing; captured audio would be echo
    #[must_use]
    pub fn agent_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// A previous utterance is still being handled
    #[must_use]
    pub fn agent_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// New utterances may be handed to the coordinator
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.agent_speaking() && !self.agent_processing()
    }
}
