//! Recording origin for tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::ports::{LifecycleReply, OriginNotifier, ReplyAck, ReplySink};
use crate::error::{Error, Result};

/// Scripted outcome for the next delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack(ReplyAck),
    /// Simulate a transport failure
    Unreachable,
}

/// In-memory origin that records every call.
///
/// Deliveries are acknowledged as `Accepted` unless an outcome was queued
/// with [`RecordingOrigin::push_outcome`].
#[derive(Debug, Default)]
pub struct RecordingOrigin {
    failed_objects: Mutex<Vec<(String, Uuid)>>,
    replies: Mutex<Vec<(String, LifecycleReply)>>,
    outcomes: Mutex<VecDeque<DeliveryOutcome>>,
    fail_notifications: Mutex<bool>,
}

impl RecordingOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(host, object)` pairs reported through `object_failed`
    pub fn failed_objects(&self) -> Vec<(String, Uuid)> {
        self.failed_objects.lock().clone()
    }

    /// `(host, reply)` pairs delivered so far
    pub fn replies(&self) -> Vec<(String, LifecycleReply)> {
        self.replies.lock().clone()
    }

    pub fn push_outcome(&self, outcome: DeliveryOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Make `object_failed` report an unreachable origin
    pub fn set_fail_notifications(&self, fail: bool) {
        *self.fail_notifications.lock() = fail;
    }
}

#[async_trait]
impl OriginNotifier for RecordingOrigin {
    async fn object_failed(&self, host: &str, id: Uuid) -> Result<()> {
        self.failed_objects.lock().push((host.to_string(), id));
        if *self.fail_notifications.lock() {
            return Err(Error::OriginStatus {
                host: host.to_string(),
                status: 503,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReplySink for RecordingOrigin {
    async fn deliver(&self, host: &str, reply: &LifecycleReply) -> Result<ReplyAck> {
        self.replies.lock().push((host.to_string(), reply.clone()));
        let outcome = self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or(DeliveryOutcome::Ack(ReplyAck::Accepted));
        match outcome {
            DeliveryOutcome::Ack(ack) => Ok(ack),
            DeliveryOutcome::Unreachable => {
                Err(Error::Internal(format!("origin {} unreachable", host)))
            }
        }
    }
}
