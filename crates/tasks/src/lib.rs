//! `tasks` crate: the `TaskHandler` trait and built-in handler implementations.
//!
//! Every task kind's handler, built-in or host-provided, must
//! implement [`TaskHandler`]. The engine crate dispatches execution through
//! this trait object.

pub mod error;
pub mod traits;
pub mod expression;
pub mod mock;

pub mod batch;
pub mod control;
pub mod http;
pub mod notification;
pub mod script;
pub mod storage;

pub use error::TaskError;
pub use traits::{TaskContext, TaskHandler, TaskOutput};
pub use expression::ExpressionError;

pub use batch::BatchHandler;
pub use control::ControlHandler;
pub use http::HttpCalloutHandler;
pub use notification::NotificationHandler;
pub use script::{ScriptHandler, TransformHandler};
pub use storage::{InMemorySink, SinkError, StorageSink, StoragePushHandler};
