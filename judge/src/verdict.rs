use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Terminal judgement for a single test case.
///
/// Rendered with the short codes stored in the database (`AC`, `WA`, ...).
/// `Broken` is not a property of the submission: it means the sandbox or the
/// host misbehaved and the submission should be re-judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "PE")]
    PresentationError,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "ITLE")]
    CheckerTimeLimitExceeded,
    #[serde(rename = "Fail")]
    CheckerFailed,
    #[serde(rename = "Broken")]
    Broken,
    #[serde(rename = "Unknown")]
    Unknown,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::PresentationError => "PE",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::RuntimeError => "RE",
            Verdict::CheckerTimeLimitExceeded => "ITLE",
            Verdict::CheckerFailed => "Fail",
            Verdict::Broken => "Broken",
            Verdict::Unknown => "Unknown",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AC" => Ok(Verdict::Accepted),
            "WA" => Ok(Verdict::WrongAnswer),
            "PE" => Ok(Verdict::PresentationError),
            "TLE" => Ok(Verdict::TimeLimitExceeded),
            "RE" => Ok(Verdict::RuntimeError),
            "ITLE" => Ok(Verdict::CheckerTimeLimitExceeded),
            "Fail" => Ok(Verdict::CheckerFailed),
            "Broken" => Ok(Verdict::Broken),
            "Unknown" => Ok(Verdict::Unknown),
            other => Err(anyhow::anyhow!("unrecognized verdict: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trip() {
        let all = [
            Verdict::Accepted,
            Verdict::WrongAnswer,
            Verdict::PresentationError,
            Verdict::TimeLimitExceeded,
            Verdict::RuntimeError,
            Verdict::CheckerTimeLimitExceeded,
            Verdict::CheckerFailed,
            Verdict::Broken,
            Verdict::Unknown,
        ];
        for v in all {
            assert_eq!(v.to_string().parse::<Verdict>().unwrap(), v);
        }
    }

    #[test]
    fn test_codes() {
        assert_eq!(Verdict::Accepted.to_string(), "AC");
        assert_eq!(Verdict::CheckerTimeLimitExceeded.to_string(), "ITLE");
        assert!("XX".parse::<Verdict>().is_err());
    }
}
