//! Notification delivery: channel senders, templates and the dispatcher.

pub mod dingtalk;
pub mod dispatcher;
pub mod email;
pub mod model;
pub mod sender;
pub mod template;
pub mod webhook;
pub mod wechat;

pub use dispatcher::{DispatchStats, Dispatcher};
pub use model::{
    Channel, ChannelFamily, ChannelKind, ChannelStatus, LogStats, LogStatus, NotificationLog,
    Template,
};
pub use sender::{ChannelSender, SendOutcome, SenderRegistry};
pub use template::{Rendered, TemplateRenderer};
