use serde::Serialize;
use std::fmt::{Display, Formatter};

/// Lifecycle of one pool instance. Only moves forward.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Accepting acquisitions
    Active,
    /// Replaced or closing: releases are honored, acquisitions are refused
    Draining,
    Closed,
}

impl Status {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Status::Active => 0,
            Status::Draining => 1,
            Status::Closed => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Active,
            1 => Status::Draining,
            _ => Status::Closed,
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Active => "active",
            Status::Draining => "draining",
            Status::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a connection pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct State {
    pub alias: String,
    pub status: Status,
    pub min_connections: u64,
    pub max_connections: u64,
    pub max_overflow: u64,
    /// Physical connections, including ones still being opened
    pub size: u64,
    /// Connections above `max_connections`
    pub overflow: u64,
    /// Idle connections available
    pub idle: u64,
    /// Checked out by callers
    pub in_use: u64,
    /// Callers currently inside an acquire
    pub waits: u64,
    /// Currently establishing connections
    pub connecting: u64,
    /// Successful acquisitions over the pool's lifetime
    pub acquired: u64,
    /// Physical connections opened over the pool's lifetime
    pub opened: u64,
    /// Connections retired after a failed probe or a broken flag
    pub retired: u64,
    pub age_secs: f64,
    /// Seconds since the last failure, if any
    pub last_error_secs: Option<f64>,
}

impl State {
    /// In-use connections as a share of the hard ceiling, 0.0 to 1.0.
    pub fn utilization(&self) -> f64 {
        let capacity = self.max_connections + self.max_overflow;
        if capacity == 0 {
            0.0
        } else {
            self.in_use as f64 / capacity as f64
        }
    }

    pub fn usage_percent(&self) -> f64 {
        self.utilization() * 100.0
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ alias: {}, status: {}, size: {}, overflow: {}, in_use: {}, idle: {}, connecting: {}, waits: {}, usage: {:.1}% }}",
            self.alias,
            self.status,
            self.size,
            self.overflow,
            self.in_use,
            self.idle,
            self.connecting,
            self.waits,
            self.usage_percent()
        )
    }
}
