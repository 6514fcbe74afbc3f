// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session orchestration.
//!
//! - [`facade`]: the capability boundary to a protocol stack
//! - [`state`]: the lifecycle state machine and wait budget
//! - [`controller`]: connect, monitor, reconnect and durable transfer
//! - [`subscription`]: subscriptions and their notification streams
//! - [`operations`]: one-shot Read, Write and Call
//! - [`quit`]: the cooperative quit signal

pub mod controller;
pub mod facade;
pub mod operations;
pub mod quit;
#[cfg(feature = "real-transport")]
pub mod real_facade;
pub mod state;
pub mod subscription;

pub use controller::{ControllerStats, ControllerStatsSnapshot, ReconnectReport, SessionLifecycleController};
pub use facade::{
    BrowseResponse, CallResponse, ChannelHandle, FacadeEvent, MonitoredItemRequest, MonitoredItemResult,
    ReferenceDescription, ServerLimits, SessionFacade, SharedFacade, SubscriptionParameters,
};
pub use operations::{CallOutcome, OneShot, ReadOutcome, WriteOutcome};
pub use quit::QuitSignal;
#[cfg(feature = "real-transport")]
pub use real_facade::OpcUaFacade;
pub use state::{SessionEvent, SessionState, StateMachine, StateTransition, TerminationReason, WaitBudget};
pub use subscription::{
    select_sample, subscription_candidates, ChannelCallback, Escalation, MonitoredItem, Notification,
    NotificationCallback, NotificationStream, OutputCallback, SubscriptionHandle, SubscriptionId,
    SubscriptionManager, SubscriptionSpec, SubscriptionSpecBuilder,
};
