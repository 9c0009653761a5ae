//! Core of the Kestrel host sensor.
//!
//! Notification sources (process, thread and image-load callbacks, user-mode
//! hook messages) build an [`Event`](event::Event) and hand it to the
//! [`EventBus`](bus::EventBus), which broadcasts it synchronously to every
//! registered [plugin](pdk::Plugin) in registration order.
//!
//! Plugins reach the host OS only through the [`Platform`](platform::Platform)
//! oracles and can move work to a later point of a specific thread's execution
//! through the [`DeferredCallQueue`](deferred::DeferredCallQueue).

pub mod bus;
pub mod deferred;
pub mod event;
pub mod hook;
pub mod pdk;
pub mod platform;
