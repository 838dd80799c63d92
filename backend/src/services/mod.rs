// Services - Collaborators the workflow engine calls out to

pub mod email;
pub mod identity;
pub mod notifier;

pub use email::EmailService;
pub use identity::{Realm, RealmRegistry, Resource, UserProvider};
pub use notifier::{ChannelNotifier, LogNotifier, Notification, Notifier, NotifyChannel, WebhookNotifier};
