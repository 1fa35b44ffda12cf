//! Notification dispatcher that records notifications in the log stream.
//!
//! Delivery (email, chat) belongs to the host application; this dispatcher
//! makes every notification visible through `tracing` so the CLI and
//! operators can see who would have been told what.

use tenure_core::workflow::collaborators::{
    BoxFuture, CollaboratorError, Notification, NotificationDispatcher,
};

#[derive(Debug, Default)]
pub struct TracingNotifier;

impl NotificationDispatcher for TracingNotifier {
    fn dispatch(&self, notification: Notification) -> BoxFuture<'_, Result<(), CollaboratorError>> {
        tracing::info!(
            instance_id = %notification.instance_id,
            process_id = notification.process_id.as_str(),
            event = ?notification.event,
            recipients = ?notification.recipient_ids,
            emails = ?notification.recipient_emails,
            template = notification.template.as_deref().unwrap_or(""),
            subject = notification.subject.as_str(),
            "notification: {}",
            notification.message
        );
        Box::pin(async { Ok(()) })
    }
}
