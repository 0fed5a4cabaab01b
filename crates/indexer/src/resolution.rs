//! Time-bucket arithmetic for candle resolutions.
//!
//! A resolution is `<integer><unit>` with unit one of `m`, `h`, `d`, `w`.
//! Every function here is pure; the only failure is a malformed resolution.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, IndexerResult};

const MINUTE: i64 = 60;
const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;
const WEEK: i64 = 604_800;

fn unit_seconds(unit: char) -> Option<i64> {
    match unit {
        'm' => Some(MINUTE),
        'h' => Some(HOUR),
        'd' => Some(DAY),
        'w' => Some(WEEK),
        _ => None,
    }
}

/// Duration of a resolution string in seconds.
pub fn resolution_seconds(resolution: &str) -> IndexerResult<i64> {
    let mut chars = resolution.chars();
    let unit = chars
        .next_back()
        .ok_or_else(|| IndexerError::malformed("empty resolution"))?;
    let unit_secs = unit_seconds(unit).ok_or_else(|| {
        IndexerError::malformed(format!("unknown unit '{unit}' in resolution '{resolution}'"))
    })?;
    let count = chars.as_str();
    if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IndexerError::malformed(format!(
            "resolution '{resolution}' must start with a positive integer"
        )));
    }
    let count: i64 = count
        .parse()
        .map_err(|_| IndexerError::malformed(format!("resolution '{resolution}' is too large")))?;
    if count == 0 {
        return Err(IndexerError::malformed(format!(
            "resolution '{resolution}' has zero width"
        )));
    }
    count
        .checked_mul(unit_secs)
        .ok_or_else(|| IndexerError::malformed(format!("resolution '{resolution}' is too large")))
}

pub fn epoch_of(time: i64, resolution_seconds: i64) -> i64 {
    time.div_euclid(resolution_seconds)
}

pub fn bucket_start(epoch: i64, resolution_seconds: i64) -> i64 {
    epoch * resolution_seconds
}

pub fn bucket_end(epoch: i64, resolution_seconds: i64) -> i64 {
    bucket_start(epoch, resolution_seconds) + resolution_seconds
}

/// A validated candle width, e.g. `15m` or `1w`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    label: String,
    seconds: i64,
}

impl Resolution {
    pub fn as_str(&self) -> &str {
        &self.label
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn epoch_of(&self, time: i64) -> i64 {
        epoch_of(time, self.seconds)
    }

    pub fn bucket_start(&self, epoch: i64) -> i64 {
        bucket_start(epoch, self.seconds)
    }

    pub fn bucket_end(&self, epoch: i64) -> i64 {
        bucket_end(epoch, self.seconds)
    }
}

impl FromStr for Resolution {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim();
        let seconds = resolution_seconds(label)?;
        Ok(Self {
            label: label.to_string(),
            seconds,
        })
    }
}

impl TryFrom<String> for Resolution {
    type Error = IndexerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.label
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl PartialOrd for Resolution {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Resolution {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then_with(|| self.label.cmp(&other.label))
    }
}

/// The configured resolutions, finest first and coarsest last.
///
/// Every width divides the coarsest one, so a coarsest-width macro-epoch is
/// always an exact union of buckets of every other resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionSet {
    resolutions: Vec<Resolution>,
}

impl ResolutionSet {
    pub fn new(resolutions: Vec<Resolution>) -> IndexerResult<Self> {
        let mut resolutions = resolutions;
        resolutions.sort();
        // labels are stored keys, so two spellings of one width would split its candles
        if let Some(pair) = resolutions.windows(2).find(|w| w[0].seconds == w[1].seconds) {
            return Err(IndexerError::malformed(format!(
                "resolutions '{}' and '{}' have the same width",
                pair[0], pair[1]
            )));
        }

        let coarsest = resolutions
            .last()
            .ok_or_else(|| IndexerError::malformed("at least one resolution is required"))?;
        if let Some(bad) = resolutions
            .iter()
            .find(|r| coarsest.seconds % r.seconds != 0)
        {
            return Err(IndexerError::malformed(format!(
                "resolution '{bad}' does not evenly divide the coarsest resolution '{coarsest}'"
            )));
        }

        Ok(Self { resolutions })
    }

    pub fn parse<S: AsRef<str>>(labels: &[S]) -> IndexerResult<Self> {
        let resolutions = labels
            .iter()
            .map(|l| l.as_ref().parse())
            .collect::<IndexerResult<Vec<Resolution>>>()?;
        Self::new(resolutions)
    }

    pub fn coarsest(&self) -> &Resolution {
        // non-empty by construction
        &self.resolutions[self.resolutions.len() - 1]
    }

    pub fn get(&self, label: &str) -> Option<&Resolution> {
        self.resolutions.iter().find(|r| r.as_str() == label)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Resolution> {
        self.resolutions.iter()
    }

    pub fn len(&self) -> usize {
        self.resolutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolutions.is_empty()
    }
}

impl<'a> IntoIterator for &'a ResolutionSet {
    type Item = &'a Resolution;
    type IntoIter = std::slice::Iter<'a, Resolution>;

    fn into_iter(self) -> Self::IntoIter {
        self.resolutions.iter()
    }
}
