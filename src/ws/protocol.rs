//! WebSocket frame types and the topic grammar.
//!
//! All frames are JSON objects discriminated by `type`. Topics are either
//! `<type>.<symbol>.<interval>` or `market.<market>.summary`; the symbol
//! segment may itself contain dots (`stock.000001.SZ.1d`), so parsing
//! anchors on the first and last segments.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Interval;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation (invalid topic, unauthenticated where required).
pub const CLOSE_POLICY: u16 = 1008;
/// Server-side error.
pub const CLOSE_SERVER_ERROR: u16 = 1011;

/// Asset class segment of a quote topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Stock,
    Crypto,
    Futures,
    Options,
    Commodity,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Stock => "stock",
            TopicKind::Crypto => "crypto",
            TopicKind::Futures => "futures",
            TopicKind::Options => "options",
            TopicKind::Commodity => "commodity",
        }
    }

    fn parse(s: &str) -> Option<TopicKind> {
        match s {
            "stock" => Some(TopicKind::Stock),
            "crypto" => Some(TopicKind::Crypto),
            "futures" => Some(TopicKind::Futures),
            "options" => Some(TopicKind::Options),
            "commodity" => Some(TopicKind::Commodity),
            _ => None,
        }
    }
}

/// Push cadence segment of a quote topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamInterval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl StreamInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamInterval::M1 => "1m",
            StreamInterval::M5 => "5m",
            StreamInterval::M15 => "15m",
            StreamInterval::M30 => "30m",
            StreamInterval::H1 => "1h",
            StreamInterval::H4 => "4h",
            StreamInterval::D1 => "1d",
            StreamInterval::W1 => "1w",
            StreamInterval::Mo1 => "1M",
        }
    }

    pub fn parse(s: &str) -> Option<StreamInterval> {
        match s {
            "1m" => Some(StreamInterval::M1),
            "5m" => Some(StreamInterval::M5),
            "15m" => Some(StreamInterval::M15),
            "30m" => Some(StreamInterval::M30),
            "1h" => Some(StreamInterval::H1),
            "4h" => Some(StreamInterval::H4),
            "1d" => Some(StreamInterval::D1),
            "1w" => Some(StreamInterval::W1),
            "1M" => Some(StreamInterval::Mo1),
            _ => None,
        }
    }

    /// Worker tick for this cadence, in seconds.
    pub fn tick_seconds(&self) -> u64 {
        match self {
            StreamInterval::M1 => 60,
            StreamInterval::M5 => 300,
            StreamInterval::M15 => 900,
            StreamInterval::M30 => 1_800,
            StreamInterval::H1 => 3_600,
            StreamInterval::H4 => 14_400,
            StreamInterval::D1 => 86_400,
            StreamInterval::W1 => 604_800,
            StreamInterval::Mo1 => 2_592_000,
        }
    }

    /// Bar interval the fetch coordinator is asked for.
    pub fn fetch_interval(&self) -> Interval {
        match self {
            StreamInterval::M1
            | StreamInterval::M5
            | StreamInterval::M15
            | StreamInterval::M30
            | StreamInterval::H1
            | StreamInterval::H4 => Interval::Minute,
            StreamInterval::D1 => Interval::Daily,
            StreamInterval::W1 => Interval::Weekly,
            StreamInterval::Mo1 => Interval::Monthly,
        }
    }
}

/// Market-summary worker tick.
pub const SUMMARY_TICK_SECONDS: u64 = 300;

/// A validated subscription topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Quote {
        kind: TopicKind,
        symbol: String,
        interval: StreamInterval,
    },
    MarketSummary {
        market: String,
    },
}

impl Topic {
    /// Parse and validate a topic string per the grammar.
    pub fn parse(raw: &str) -> Option<Topic> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() < 3 {
            return None;
        }
        let first = segments[0];
        let last = segments[segments.len() - 1];
        let middle = segments[1..segments.len() - 1].join(".");
        if middle.is_empty() {
            return None;
        }

        if first == "market" {
            return (last == "summary").then(|| Topic::MarketSummary { market: middle });
        }

        let kind = TopicKind::parse(first)?;
        let interval = StreamInterval::parse(last)?;
        Some(Topic::Quote {
            kind,
            symbol: middle,
            interval,
        })
    }

    pub fn tick_seconds(&self) -> u64 {
        match self {
            Topic::Quote { interval, .. } => interval.tick_seconds(),
            Topic::MarketSummary { .. } => SUMMARY_TICK_SECONDS,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Quote {
                kind,
                symbol,
                interval,
            } => write!(f, "{}.{}.{}", kind.as_str(), symbol, interval.as_str()),
            Topic::MarketSummary { market } => write!(f, "market.{market}.summary"),
        }
    }
}

/// Frames the client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    HeartbeatResponse,
    Ping,
    GetSubscriptions,
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionAck {
        client_id: String,
        timestamp: String,
    },
    SubscribeAck {
        topic: String,
    },
    UnsubscribeAck {
        topic: String,
    },
    Heartbeat {
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    SubscriptionsList {
        subscriptions: Vec<String>,
    },
    Data {
        topic: String,
        data: Value,
        timestamp: String,
    },
    Error {
        error_code: String,
        error_message: String,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
