//! Where bridge events go.
//!
//! The core reports adapter state, the gateway address and decoded
//! advertisements through [`EventSink`]. [`TopicSink`] renders them as JSON
//! messages on topics under a prefix and hands them to a [`Publisher`]; the
//! hub's message bus client sits behind that trait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::discovery::AdapterState;
use crate::gap::Advertisement;
use crate::keys::{KeyQuery, KeyQueryMessage};
use crate::tracing::prelude::*;
use crate::types::MacAddr;

pub trait EventSink: Send + Sync {
    fn adapter_state(&self, state: AdapterState);
    fn gateway_address(&self, mac: MacAddr);
    fn advertisement(&self, adv: &Advertisement);
}

pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool);
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) {
        (**self).publish(topic, payload, retain)
    }
}

/// Publisher that writes messages to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) {
        debug!(
            target: "bgbridge::publish",
            topic,
            retain,
            payload = %String::from_utf8_lossy(payload),
            "Publish"
        );
    }
}

#[derive(Serialize)]
struct StatusMessage {
    adapter: AdapterState,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<MacAddr>,
}

#[derive(Default)]
struct Status {
    state: AdapterState,
    address: Option<MacAddr>,
}

/// Publishes events as JSON under `<prefix>/...`.
///
/// - `<prefix>/status`: adapter state and gateway address, retained
/// - `<prefix>/gap/<addr>`: one message per advertisement
/// - `<prefix>/miio/query`: bind key queries
pub struct TopicSink<P> {
    prefix: String,
    publisher: P,
    status: Mutex<Status>,
    next_query_id: AtomicU32,
}

impl<P: Publisher> TopicSink<P> {
    pub fn new(prefix: impl Into<String>, publisher: P) -> Self {
        Self {
            prefix: prefix.into(),
            publisher,
            status: Mutex::new(Status::default()),
            next_query_id: AtomicU32::new(1),
        }
    }

    fn publish_json<T: Serialize>(&self, topic: &str, message: &T, retain: bool) {
        match serde_json::to_vec(message) {
            Ok(payload) => self.publisher.publish(topic, &payload, retain),
            Err(e) => error!(topic, error = %e, "Failed to serialize message"),
        }
    }

    fn publish_status(&self, status: &Status) {
        let message = StatusMessage {
            adapter: status.state,
            address: status.address,
        };
        self.publish_json(&format!("{}/status", self.prefix), &message, true);
    }
}

impl<P: Publisher> EventSink for TopicSink<P> {
    fn adapter_state(&self, state: AdapterState) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.state = state;
        self.publish_status(&status);
    }

    fn gateway_address(&self, mac: MacAddr) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.address == Some(mac) {
            return;
        }
        status.address = Some(mac);
        self.publish_status(&status);
    }

    fn advertisement(&self, adv: &Advertisement) {
        let topic = format!("{}/gap/{}", self.prefix, adv.report.address);
        self.publish_json(&topic, adv, false);
    }
}

impl<P: Publisher> KeyQuery for TopicSink<P> {
    fn query(&self, mac: MacAddr, product_id: u16) {
        let id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        info!(%mac, pdid = product_id, "Requesting bind key");
        let message = KeyQueryMessage::new(id, mac, product_id);
        self.publish_json(&format!("{}/miio/query", self.prefix), &message, false);
    }
}
