use crate::error::MonitorError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const MAX_SOURCE_ID_LEN: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn parse(raw: &str) -> Result<Self, MonitorError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MonitorError::InvalidSource("source id is empty".to_string()));
        }
        if trimmed.len() > MAX_SOURCE_ID_LEN {
            return Err(MonitorError::InvalidSource(format!(
                "source id longer than {MAX_SOURCE_ID_LEN} bytes"
            )));
        }
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(MonitorError::InvalidSource(format!(
                "source id {trimmed:?} contains whitespace or control characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SourceId {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SourceSet(BTreeSet<SourceId>);

impl SourceSet {
    pub fn new<I, S>(raw: I) -> Result<Self, MonitorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for item in raw {
            let id = SourceId::parse(item.as_ref())?;
            if !set.insert(id.clone()) {
                return Err(MonitorError::InvalidSource(format!(
                    "source {id} listed more than once"
                )));
            }
        }
        Ok(Self(set))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for SourceSet {
    type Item = SourceId;
    type IntoIter = std::collections::btree_set::IntoIter<SourceId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Acceleration,
    Airflow,
    Ecg,
    HeartRate,
    O2,
    Temperature,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Acceleration,
        Channel::Airflow,
        Channel::Ecg,
        Channel::HeartRate,
        Channel::O2,
        Channel::Temperature,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Acceleration => "acceleration",
            Channel::Airflow => "airflow",
            Channel::Ecg => "ecg",
            Channel::HeartRate => "heart_rate",
            Channel::O2 => "o2",
            Channel::Temperature => "temperature",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acceleration" => Ok(Channel::Acceleration),
            "airflow" => Ok(Channel::Airflow),
            "ecg" | "ecg_v1" => Ok(Channel::Ecg),
            "heart_rate" => Ok(Channel::HeartRate),
            "o2" => Ok(Channel::O2),
            "temperature" => Ok(Channel::Temperature),
            other => Err(MonitorError::UnknownChannel(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }

    pub fn from_millis(timestamp_ms: i64, value: f64) -> Option<Self> {
        let timestamp = Utc.timestamp_millis_opt(timestamp_ms).single()?;
        Some(Self { timestamp, value })
    }
}

#[derive(Clone, Debug)]
pub struct ChannelSeries {
    pub channel: String,
    pub samples: Vec<Sample>,
}

impl ChannelSeries {
    pub fn new(channel: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            channel: channel.into(),
            samples,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SampleBatch {
    pub source_id: SourceId,
    pub series: Vec<ChannelSeries>,
}

impl SampleBatch {
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            series: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>, samples: Vec<Sample>) -> Self {
        self.series.push(ChannelSeries::new(channel, samples));
        self
    }

    pub fn sample_count(&self) -> usize {
        self.series.iter().map(|series| series.samples.len()).sum()
    }
}
