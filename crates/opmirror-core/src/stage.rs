//! Stage status classification for routing steps.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    InProgress,
    Done,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "DONE" => Ok(Self::Done),
            other => Err(format!("unknown stage status `{other}`")),
        }
    }
}

/// Raw legacy status codes with a known meaning. Anything else is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCodeTable {
    #[serde(default)]
    pub done: Vec<String>,
    #[serde(default)]
    pub in_progress: Vec<String>,
}

impl Default for StageCodeTable {
    fn default() -> Self {
        let owned = |codes: &[&str]| codes.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        Self {
            done: owned(&[
                "FF", "FINALIZADO", "FINALIZADA", "CONCLUIDO", "CONCLUIDA", "FECHADO", "FECHADA", "F",
                "C", "2",
            ]),
            in_progress: owned(&[
                "IN", "INICIADO", "INICIADA", "EXECUCAO", "EXECUTANDO", "ANDAMENTO", "A", "1",
            ]),
        }
    }
}

impl StageCodeTable {
    pub fn lookup(&self, code: &str) -> Option<StageStatus> {
        let code = code.trim();
        if code.is_empty() {
            return None;
        }
        let matches = |codes: &[String]| codes.iter().any(|c| c.trim().eq_ignore_ascii_case(code));
        if matches(&self.done) {
            Some(StageStatus::Done)
        } else if matches(&self.in_progress) {
            Some(StageStatus::InProgress)
        } else {
            None
        }
    }
}

/// End timestamp beats start timestamp beats status code; nothing known means pending.
pub fn classify_stage(
    started_at: Option<NaiveDateTime>,
    finished_at: Option<NaiveDateTime>,
    status_code: Option<&str>,
    codes: &StageCodeTable,
) -> StageStatus {
    if finished_at.is_some() {
        return StageStatus::Done;
    }
    if started_at.is_some() {
        return StageStatus::InProgress;
    }
    status_code
        .and_then(|code| codes.lookup(code))
        .unwrap_or(StageStatus::Pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(2025, 9, 1).unwrap().and_hms_opt(h, 0, 0)
    }

    #[test]
    fn end_timestamp_means_done_regardless_of_code() {
        let codes = StageCodeTable::default();
        assert_eq!(classify_stage(None, ts(10), Some("IN"), &codes), StageStatus::Done);
        assert_eq!(classify_stage(ts(8), ts(10), None, &codes), StageStatus::Done);
    }

    #[test]
    fn start_timestamp_alone_means_in_progress() {
        let codes = StageCodeTable::default();
        assert_eq!(classify_stage(ts(8), None, Some("FF"), &codes), StageStatus::InProgress);
    }

    #[test]
    fn status_codes_map_through_the_known_table() {
        let codes = StageCodeTable::default();
        assert_eq!(classify_stage(None, None, Some(" concluida "), &codes), StageStatus::Done);
        assert_eq!(classify_stage(None, None, Some("1"), &codes), StageStatus::InProgress);
        assert_eq!(classify_stage(None, None, Some("ZZ"), &codes), StageStatus::Pending);
        assert_eq!(classify_stage(None, None, Some(""), &codes), StageStatus::Pending);
        assert_eq!(classify_stage(None, None, None, &codes), StageStatus::Pending);
    }

    #[test]
    fn status_round_trips_through_its_mirror_text() {
        for status in [StageStatus::Pending, StageStatus::InProgress, StageStatus::Done] {
            assert_eq!(status.as_str().parse::<StageStatus>().unwrap(), status);
        }
    }
}
