#![forbid(unsafe_code)]

// Run configuration. Defaults reproduce the canonical load profiles for
// each scenario; everything is overridable from the command line, with
// BASE_URL / WS_URL environment fallbacks for the endpoints.

use crate::fixtures::RoomTopology;
use crate::metrics::Threshold;
use crate::scenario::WsOptions;
use crate::scheduler::{Stage, StageProfile};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid duration '{0}' (expected e.g. 10s, 500ms, 2m)")]
    InvalidDuration(String),

    #[error("invalid stage '{0}' (expected <duration>:<target>)")]
    InvalidStage(String),

    #[error("invalid count '{0}'")]
    InvalidCount(String),

    #[error("unknown scenario '{0}' (expected rest or ws)")]
    UnknownScenario(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    Rest,
    Ws,
}

impl ScenarioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::Rest => "rest",
            ScenarioKind::Ws => "ws",
        }
    }
}

impl FromStr for ScenarioKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rest" => Ok(ScenarioKind::Rest),
            "ws" | "websocket" => Ok(ScenarioKind::Ws),
            other => Err(ConfigError::UnknownScenario(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub scenario: ScenarioKind,
    pub base_url: String,
    pub ws_url: String,
    pub users: usize,
    /// Group rooms to create in the rest scenario; the ws scenario pairs
    /// users into direct rooms instead.
    pub group_rooms: usize,
    pub profile: StageProfile,
    pub messages_per_connection: u32,
    pub message_pacing: Duration,
    pub drain_wait: Duration,
    pub connect_timeout: Duration,
    pub history_page_size: u32,
    pub thresholds: Vec<Threshold>,
}

impl RunConfig {
    pub fn defaults_for(scenario: ScenarioKind) -> Self {
        let base_url =
            std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        let ws_url =
            std::env::var("WS_URL").unwrap_or_else(|_| "ws://localhost:8080/ws".to_string());

        match scenario {
            ScenarioKind::Rest => Self {
                scenario,
                base_url,
                ws_url,
                users: 200,
                group_rooms: 10,
                profile: StageProfile {
                    start_vus: 0,
                    stages: vec![
                        stage(Duration::from_secs(10), 50),
                        stage(Duration::from_secs(30), 200),
                        stage(Duration::from_secs(10), 0),
                    ],
                },
                messages_per_connection: 5,
                message_pacing: Duration::from_millis(500),
                drain_wait: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(15),
                history_page_size: 20,
                thresholds: vec![
                    Threshold::TrendP95Below {
                        metric: "http_req_duration".to_string(),
                        limit_ms: 500,
                    },
                    Threshold::RateBelow {
                        metric: "http_req_failed".to_string(),
                        limit: 0.01,
                    },
                ],
            },
            ScenarioKind::Ws => Self {
                scenario,
                base_url,
                ws_url,
                users: 100,
                group_rooms: 0,
                profile: StageProfile {
                    start_vus: 0,
                    stages: vec![
                        stage(Duration::from_secs(10), 20),
                        stage(Duration::from_secs(30), 100),
                        stage(Duration::from_secs(10), 0),
                    ],
                },
                messages_per_connection: 5,
                message_pacing: Duration::from_millis(500),
                drain_wait: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(15),
                history_page_size: 20,
                thresholds: vec![
                    Threshold::TrendP95Below {
                        metric: "ws_message_latency".to_string(),
                        limit_ms: 500,
                    },
                    Threshold::RateBelow {
                        metric: "http_req_failed".to_string(),
                        limit: 0.01,
                    },
                ],
            },
        }
    }

    pub fn topology(&self) -> RoomTopology {
        match self.scenario {
            ScenarioKind::Rest => RoomTopology::Group {
                rooms: self.group_rooms,
            },
            ScenarioKind::Ws => RoomTopology::Direct,
        }
    }

    pub fn ws_options(&self) -> WsOptions {
        WsOptions {
            messages_per_connection: self.messages_per_connection,
            message_pacing: self.message_pacing,
            drain_wait: self.drain_wait,
            connect_timeout: self.connect_timeout,
        }
    }
}

fn stage(duration: Duration, target: u64) -> Stage {
    Stage { duration, target }
}

/// Parses `10s`, `500ms`, `2m`; a bare number means seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let (value, unit) = if let Some(v) = s.strip_suffix("ms") {
        (v, "ms")
    } else if let Some(v) = s.strip_suffix('s') {
        (v, "s")
    } else if let Some(v) = s.strip_suffix('m') {
        (v, "m")
    } else {
        (s, "s")
    };

    let n: u64 = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;
    Ok(match unit {
        "ms" => Duration::from_millis(n),
        "m" => Duration::from_secs(n * 60),
        _ => Duration::from_secs(n),
    })
}

/// Parses a comma-separated ramp shape: `10s:50,30s:200,10s:0`.
pub fn parse_stages(s: &str) -> Result<Vec<Stage>, ConfigError> {
    s.split(',')
        .map(|part| {
            let part = part.trim();
            let (duration, target) = part
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidStage(part.to_string()))?;
            Ok(Stage {
                duration: parse_duration(duration)?,
                target: target
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidStage(part.to_string()))?,
            })
        })
        .collect()
}

pub fn parse_count(s: &str) -> Result<usize, ConfigError> {
    s.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidCount(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_parse_stages_matches_ramp_shape() {
        let stages = parse_stages("10s:50, 30s:200, 10s:0").unwrap();
        assert_eq!(
            stages,
            vec![
                stage(Duration::from_secs(10), 50),
                stage(Duration::from_secs(30), 200),
                stage(Duration::from_secs(10), 0),
            ]
        );
        assert!(parse_stages("10s").is_err());
        assert!(parse_stages("10s:x").is_err());
    }

    #[test]
    fn test_scenario_kind_parsing() {
        assert_eq!("rest".parse::<ScenarioKind>().unwrap(), ScenarioKind::Rest);
        assert_eq!("ws".parse::<ScenarioKind>().unwrap(), ScenarioKind::Ws);
        assert_eq!(
            "websocket".parse::<ScenarioKind>().unwrap(),
            ScenarioKind::Ws
        );
        assert!("soak".parse::<ScenarioKind>().is_err());
    }

    #[test]
    fn test_rest_defaults_use_group_topology() {
        let config = RunConfig::defaults_for(ScenarioKind::Rest);
        assert_eq!(config.users, 200);
        assert_eq!(config.topology(), RoomTopology::Group { rooms: 10 });
        assert_eq!(config.profile.stages.len(), 3);
        assert_eq!(config.thresholds.len(), 2);
    }

    #[test]
    fn test_ws_defaults_use_direct_topology() {
        let config = RunConfig::defaults_for(ScenarioKind::Ws);
        assert_eq!(config.users, 100);
        assert_eq!(config.topology(), RoomTopology::Direct);
        assert_eq!(config.messages_per_connection, 5);
        assert_eq!(config.message_pacing, Duration::from_millis(500));
        assert_eq!(config.drain_wait, Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
    }
}
