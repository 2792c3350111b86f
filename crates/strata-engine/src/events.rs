//! Apply events and notifiers for observability.
//!
//! Events are emitted during graph execution so consumers can observe
//! progress, persist state transitions, or stream them to a UI. The engine
//! itself holds no hidden state beyond the graph: everything observable
//! flows through node state transitions and output attributes.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::engine::AppliedAction;
use crate::provider::Outputs;

/// Events emitted during an apply or teardown run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApplyEvent {
  /// An apply run has started.
  ApplyStarted { apply_id: String, deployment: String },

  /// A node has begun provisioning.
  NodeStarted { apply_id: String, node: String },

  /// A node reached Ready; `action` says what it took to get there.
  NodeReady {
    apply_id: String,
    node: String,
    action: AppliedAction,
    outputs: Outputs,
  },

  /// A node failed; the engine halts after the in-flight wave drains.
  NodeFailed {
    apply_id: String,
    node: String,
    error: String,
  },

  /// A node's resource was destroyed during teardown.
  NodeDeleted { apply_id: String, node: String },

  /// Every node converged.
  ApplyCompleted { apply_id: String },

  /// The run halted at a failed node; dependents were never attempted.
  ApplyHalted {
    apply_id: String,
    node: String,
    error: String,
  },

  /// The run was cancelled; in-flight nodes stay Provisioning.
  ApplyCancelled { apply_id: String },
}

/// Trait for receiving apply events.
///
/// The engine calls `notify` for each event - implementations decide what
/// to do with them (persist, broadcast, log, ignore).
pub trait ApplyNotifier: Send + Sync {
  fn notify(&self, event: ApplyEvent);
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ApplyNotifier for NoopNotifier {
  fn notify(&self, _event: ApplyEvent) {
    // Intentionally empty
  }
}

/// A notifier that sends events to an unbounded channel.
///
/// Unbounded so a slow consumer never blocks the engine; event volume is a
/// handful per node, so memory growth is not a practical concern.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ApplyEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ApplyEvent>) -> Self {
    Self { sender }
  }
}

impl ApplyNotifier for ChannelNotifier {
  fn notify(&self, event: ApplyEvent) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
