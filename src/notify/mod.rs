//! Detection notifications: payload construction, the bounded outbound queue,
//! and the worker that drains it to an HTTP sink.

mod job;
mod worker;

pub use job::{encode_crop, JobBox, NotificationJob, StreamIdentity};
pub use worker::{channel, run_worker, Delivery, HttpSink, NotificationQueue, NotificationSink};
