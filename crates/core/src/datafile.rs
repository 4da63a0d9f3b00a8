//! Raw data file naming, grouping and presubmission checks.
//!
//! Raw files are Mock spectrometer PSRFITS files named
//! `4bit-{project}.{mjd}.{source}.b{beam}s{subband}g0.{seq:05}.fits`.
//! One observation is the two subbands `s0` and `s1` of the same beam and
//! sequence number. Merged files (`...b{beam}g0.{seq}.fits`) already hold
//! both subbands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex_lite::Regex;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::store::DataFile;

static NAME_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^4bit-(?P<project>[^.]+)\.(?P<mjd>\d+)\.(?P<source>.+)\.b(?P<beam>\d+)(?:s(?P<subband>\d))?g0\.(?P<seq>\d{5})\.fits$",
    )
    .ok()
});

const FITS_BLOCK: usize = 2880;
const FITS_CARD: usize = 80;

/// Fields encoded in a raw data file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileName {
    pub project: String,
    pub mjd: u32,
    pub source: String,
    pub beam: u8,
    /// None for merged files.
    pub subband: Option<u8>,
    pub seq: u32,
}

/// Identity of one observation; files sharing a key belong together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub project: String,
    pub mjd: u32,
    pub source: String,
    pub beam: u8,
    pub seq: u32,
    pub merged: bool,
}

impl DataFileName {
    /// Parse a file name (directory components are ignored).
    pub fn parse(name: &str) -> Option<Self> {
        let base = Path::new(name).file_name()?.to_str()?;
        let caps = NAME_PATTERN.as_ref()?.captures(base)?;
        Some(Self {
            project: caps.name("project")?.as_str().to_string(),
            mjd: caps.name("mjd")?.as_str().parse().ok()?,
            source: caps.name("source")?.as_str().to_string(),
            beam: caps.name("beam")?.as_str().parse().ok()?,
            subband: match caps.name("subband") {
                Some(m) => Some(m.as_str().parse().ok()?),
                None => None,
            },
            seq: caps.name("seq")?.as_str().parse().ok()?,
        })
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            project: self.project.clone(),
            mjd: self.mjd,
            source: self.source.clone(),
            beam: self.beam,
            seq: self.seq,
            merged: self.subband.is_none(),
        }
    }
}

/// Whether a listed file should be skipped by acquisition.
pub fn is_excluded(name: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| !p.is_empty() && name.contains(p.as_str()))
}

/// Split files into complete observation groups.
///
/// A subband group is complete once both `s0` and `s1` are present; a merged
/// file is complete on its own. Incomplete groups and unparseable names are
/// left out. Groups come back ordered by key, files within a group by subband.
pub fn complete_groups(files: &[DataFile]) -> Vec<Vec<&DataFile>> {
    let mut pending: BTreeMap<GroupKey, BTreeMap<Option<u8>, &DataFile>> = BTreeMap::new();
    for file in files {
        let Some(name) = DataFileName::parse(&file.remote_name) else {
            continue;
        };
        pending
            .entry(name.group_key())
            .or_default()
            .entry(name.subband)
            .or_insert(file);
    }

    pending
        .into_iter()
        .filter_map(|(key, members)| {
            let complete = if key.merged {
                members.contains_key(&None)
            } else {
                members.contains_key(&Some(0)) && members.contains_key(&Some(1))
            };
            if !complete {
                return None;
            }
            Some(
                members
                    .into_iter()
                    .filter(|(subband, _)| key.merged || matches!(subband, Some(0) | Some(1)))
                    .map(|(_, file)| file)
                    .collect(),
            )
        })
        .collect()
}

/// Reasons a job can never run. None of these are retryable.
#[derive(Debug, Error)]
pub enum PrecheckError {
    #[error("job has no data files")]
    NoFiles,

    #[error("data file missing: {0}")]
    MissingFile(PathBuf),

    #[error("unrecognized data file name: {0}")]
    UnrecognizedName(String),

    #[error("no SCANLEN in primary header of {0}")]
    MissingScanLength(PathBuf),

    #[error("observation in {path} is {secs:.1}s, shorter than the {min:.1}s minimum")]
    TooShort { path: PathBuf, secs: f64, min: f64 },

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Presubmission check for one job's files.
pub async fn precheck(files: &[PathBuf], min_observation_secs: f64) -> Result<(), PrecheckError> {
    if files.is_empty() {
        return Err(PrecheckError::NoFiles);
    }

    for path in files {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(PrecheckError::MissingFile(path.clone()));
        }
        let name = path.to_string_lossy();
        if DataFileName::parse(&name).is_none() {
            return Err(PrecheckError::UnrecognizedName(name.into_owned()));
        }

        let secs = read_scan_length(path)
            .await?
            .ok_or_else(|| PrecheckError::MissingScanLength(path.clone()))?;
        if secs < min_observation_secs {
            return Err(PrecheckError::TooShort {
                path: path.clone(),
                secs,
                min: min_observation_secs,
            });
        }
    }
    Ok(())
}

/// Read `SCANLEN` (seconds) from the primary FITS header.
pub async fn read_scan_length(path: &Path) -> Result<Option<f64>, PrecheckError> {
    let unreadable = |source: std::io::Error| PrecheckError::Unreadable {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::open(path).await.map_err(unreadable)?;
    let mut block = vec![0u8; FITS_BLOCK];

    loop {
        match file.read_exact(&mut block).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(unreadable(e)),
        }
        for card in block.chunks(FITS_CARD) {
            let card = String::from_utf8_lossy(card);
            let keyword = card.get(..8).unwrap_or(card.as_ref()).trim();
            if keyword == "END" {
                return Ok(None);
            }
            if keyword == "SCANLEN" {
                return Ok(card_value(&card).and_then(|v| v.parse().ok()));
            }
        }
    }
}

/// Value field of a header card: after `= `, before any `/` comment.
fn card_value(card: &str) -> Option<&str> {
    let rest = card.get(8..)?.trim_start().strip_prefix('=')?;
    Some(rest.split('/').next()?.trim().trim_matches('\'').trim())
}
