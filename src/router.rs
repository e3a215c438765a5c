//! Routing of server-push envelopes to user-facing notifications.

use livecore::types::{ChatNotification, GroupId, UserId};
use livecore::{PushEnvelope, UnsupportedEventKind};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

/// The signed-in user as the router sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: UserId,
    pub groups_joined: HashSet<GroupId>,
}

impl Viewer {
    pub fn new(user_id: UserId, groups_joined: impl IntoIterator<Item = GroupId>) -> Self {
        Self {
            user_id,
            groups_joined: groups_joined.into_iter().collect(),
        }
    }
}

/// Receives notifications that passed the filters.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &ChatNotification);
}

/// Receives user-visible diagnostics, such as unsupported kinds.
pub trait DiagnosticSink: Send + Sync {
    fn diagnostic(&self, message: &str);
}

pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: &ChatNotification) {
        let message = &notification.message;
        info!(
            target: "Sync/Notify",
            "New message in group {} from {}: {}",
            message.group_id(),
            message
                .user
                .username
                .as_deref()
                .unwrap_or("unknown user"),
            message.content
        );
    }
}

pub struct LogDiagnostics;

impl DiagnosticSink for LogDiagnostics {
    fn diagnostic(&self, message: &str) {
        warn!(target: "Sync/Notify", "{message}");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    SuppressedSelf,
    SuppressedNotMember,
    Unsupported(String),
    Malformed,
}

pub struct NotificationRouter {
    viewer: RwLock<Viewer>,
    notifier: Arc<dyn NotificationSink>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl NotificationRouter {
    pub fn new(
        viewer: Viewer,
        notifier: Arc<dyn NotificationSink>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            viewer: RwLock::new(viewer),
            notifier,
            diagnostics,
        }
    }

    pub fn set_viewer(&self, viewer: Viewer) {
        *self.viewer.write().unwrap_or_else(PoisonError::into_inner) = viewer;
    }

    pub fn viewer(&self) -> Viewer {
        self.viewer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handles one raw envelope. Never fails: problems are logged or turned
    /// into a diagnostic.
    pub fn route(&self, raw: &str) -> RouteOutcome {
        let envelope = match PushEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "Sync/Notify", "Dropping malformed push envelope: {e}");
                return RouteOutcome::Malformed;
            }
        };

        match envelope {
            PushEnvelope::ChatGroupMessage(notification) => {
                let outcome = {
                    let viewer = self.viewer.read().unwrap_or_else(PoisonError::into_inner);
                    let message = &notification.message;
                    if message.sender() == viewer.user_id {
                        RouteOutcome::SuppressedSelf
                    } else if !viewer.groups_joined.contains(&message.group_id()) {
                        RouteOutcome::SuppressedNotMember
                    } else {
                        RouteOutcome::Delivered
                    }
                };
                match outcome {
                    RouteOutcome::Delivered => self.notifier.notify(&notification),
                    _ => debug!(target: "Sync/Notify", "Notification suppressed: {outcome:?}"),
                }
                outcome
            }
            PushEnvelope::Unsupported { event_name, .. } => {
                let err = UnsupportedEventKind(event_name);
                self.diagnostics.diagnostic(&err.to_string());
                RouteOutcome::Unsupported(err.0)
            }
        }
    }

    /// Routes every envelope of a push stream, in order, until it ends.
    pub async fn run(&self, mut events: mpsc::Receiver<String>) {
        while let Some(raw) = events.recv().await {
            self.route(&raw);
        }
        debug!(target: "Sync/Notify", "Push stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        notified: Mutex<Vec<ChatNotification>>,
        diagnostics: Mutex<Vec<String>>,
    }

    impl NotificationSink for Recorder {
        fn notify(&self, notification: &ChatNotification) {
            self.notified.lock().unwrap().push(notification.clone());
        }
    }

    impl DiagnosticSink for Recorder {
        fn diagnostic(&self, message: &str) {
            self.diagnostics.lock().unwrap().push(message.to_string());
        }
    }

    fn router() -> (NotificationRouter, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let router = NotificationRouter::new(
            Viewer::new(UserId(1), [GroupId(9)]),
            recorder.clone(),
            recorder.clone(),
        );
        (router, recorder)
    }

    fn chat(sender: i64, group: i64) -> String {
        serde_json::json!({
            "eventName": "chat-group-message",
            "message": {"User": {"ID": sender}, "Group": {"ID": group}, "Content": "hi"}
        })
        .to_string()
    }

    #[test]
    fn own_messages_are_not_notified() {
        let (router, recorder) = router();
        assert_eq!(router.route(&chat(1, 9)), RouteOutcome::SuppressedSelf);
        assert!(recorder.notified.lock().unwrap().is_empty());
    }

    #[test]
    fn groups_not_joined_are_not_notified() {
        let (router, recorder) = router();
        assert_eq!(router.route(&chat(2, 10)), RouteOutcome::SuppressedNotMember);
        assert!(recorder.notified.lock().unwrap().is_empty());
    }

    #[test]
    fn other_members_are_notified() {
        let (router, recorder) = router();
        assert_eq!(router.route(&chat(2, 9)), RouteOutcome::Delivered);
        assert_eq!(recorder.notified.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_kind_emits_one_diagnostic() {
        let (router, recorder) = router();
        let outcome = router.route(r#"{"eventName":"foo","x":1}"#);
        assert_eq!(outcome, RouteOutcome::Unsupported("foo".to_string()));

        let diagnostics = recorder.diagnostics.lock().unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].contains("foo"));
        assert_eq!(diagnostics[0], "foo is not a supported notification type");
    }

    #[test]
    fn malformed_input_is_dropped_quietly() {
        let (router, recorder) = router();
        assert_eq!(router.route("{not json"), RouteOutcome::Malformed);
        assert_eq!(router.route(r#"{"x":1}"#), RouteOutcome::Malformed);
        assert_eq!(
            router.route(r#"{"eventName":"chat-group-message"}"#),
            RouteOutcome::Malformed
        );
        assert!(recorder.diagnostics.lock().unwrap().is_empty());
    }

    #[test]
    fn viewer_can_be_replaced() {
        let (router, recorder) = router();
        router.set_viewer(Viewer::new(UserId(1), [GroupId(10)]));
        assert_eq!(router.route(&chat(2, 10)), RouteOutcome::Delivered);
        assert_eq!(recorder.notified.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_consumes_stream_in_order() {
        let (router, recorder) = router();
        let (tx, rx) = mpsc::channel(8);
        tx.send(chat(2, 9)).await.unwrap();
        tx.send(r#"{"eventName":"foo"}"#.to_string()).await.unwrap();
        tx.send(chat(3, 9)).await.unwrap();
        drop(tx);

        router.run(rx).await;
        let notified = recorder.notified.lock().unwrap();
        assert_eq!(notified.len(), 2);
        assert_eq!(notified[0].message.sender(), UserId(2));
        assert_eq!(notified[1].message.sender(), UserId(3));
        assert_eq!(recorder.diagnostics.lock().unwrap().len(), 1);
    }
}
