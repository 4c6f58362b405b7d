//! Subscription statistics and the per-system view formatter.
//!
//! Statistics are diagnostics only: every value is derived fresh from
//! engine state when requested and nothing reads them back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Delivery metadata for one live connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub resource_id: u64,
    pub remote_address: String,
    pub m_time_send: Option<f64>,
    pub m_time_send_format1: Option<String>,
    pub m_time_send_format2: Option<String>,
}

impl ConnectionStats {
    pub fn new(resource_id: u64, remote_address: String, m_time_send: Option<f64>) -> Self {
        let formatted = m_time_send.and_then(format_micro_time);
        Self {
            resource_id,
            remote_address,
            m_time_send,
            m_time_send_format1: formatted.as_ref().map(|t| t.0.clone()),
            m_time_send_format2: formatted.map(|t| t.1),
        }
    }
}

fn format_micro_time(timestamp: f64) -> Option<(String, String)> {
    let secs = timestamp.trunc() as i64;
    let micros = ((timestamp - timestamp.trunc()) * 1_000_000.0).round() as u32;
    let datetime: DateTime<Utc> = DateTime::from_timestamp(secs, micros * 1000)?;
    Some((
        datetime.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        datetime.format("%H:%M:%S").to_string(),
    ))
}

/// Per-character subscription detail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterStats {
    pub character_id: i64,
    pub character_name: Option<String>,
    pub count_con: usize,
    pub connections: Vec<ConnectionStats>,
}

/// One map channel with its subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub channel_id: i64,
    pub channel_name: String,
    pub count_sub: usize,
    pub count_con: usize,
    pub subscriptions: Vec<CharacterStats>,
}

/// Aggregate view over all active map channels.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStats {
    pub count_sub: usize,
    pub count_con: usize,
    pub channels: Vec<ChannelStats>,
}

/// Groups character snapshots by the system they are currently logged
/// into (`log.system.id`, 0 when absent) for the subscription view
/// broadcast.
pub fn group_characters_by_system(characters: &BTreeMap<i64, Value>) -> Vec<Value> {
    let mut systems: BTreeMap<i64, Vec<Value>> = BTreeMap::new();
    for snapshot in characters.values() {
        let system_id = snapshot
            .pointer("/log/system/id")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        systems.entry(system_id).or_default().push(snapshot.clone());
    }
    systems
        .into_iter()
        .map(|(id, user)| json!({"id": id, "user": user}))
        .collect()
}
