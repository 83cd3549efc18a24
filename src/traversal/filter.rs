use chrono::{Datelike, DateTime, Duration, Local, Months, NaiveDate, NaiveDateTime, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Which time window rows must fall into to be counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterMode {
    All,
    CurrentPeriod,
    PreviousPeriod,
}

impl FilterMode {
    /// Short slug used in file names.
    pub fn slug(&self) -> &'static str {
        match self {
            FilterMode::All => "all",
            FilterMode::CurrentPeriod => "this",
            FilterMode::PreviousPeriod => "last",
        }
    }

    /// Human label, e.g. "this week".
    pub fn label(&self, unit: PeriodUnit) -> String {
        match self {
            FilterMode::All => "all time".to_string(),
            FilterMode::CurrentPeriod => format!("this {}", unit.noun()),
            FilterMode::PreviousPeriod => format!("last {}", unit.noun()),
        }
    }
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(FilterMode::All),
            "current-period" | "current" | "this" => Ok(FilterMode::CurrentPeriod),
            "previous-period" | "previous" | "last" => Ok(FilterMode::PreviousPeriod),
            other => Err(format!(
                "unknown filter mode '{}' (expected all, current-period or previous-period)",
                other
            )),
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterMode::All => "all",
            FilterMode::CurrentPeriod => "current-period",
            FilterMode::PreviousPeriod => "previous-period",
        };
        f.write_str(s)
    }
}

/// Calendar unit a period spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodUnit {
    Day,
    Week,
    Month,
}

impl PeriodUnit {
    fn noun(&self) -> &'static str {
        match self {
            PeriodUnit::Day => "day",
            PeriodUnit::Week => "week",
            PeriodUnit::Month => "month",
        }
    }
}

/// Period boundary definition. Defaults to weeks starting Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub unit: PeriodUnit,
    pub week_start: Weekday,
}

impl Default for Period {
    fn default() -> Self {
        Self {
            unit: PeriodUnit::Week,
            week_start: Weekday::Mon,
        }
    }
}

impl Period {
    pub fn weekly(week_start: Weekday) -> Self {
        Self {
            unit: PeriodUnit::Week,
            week_start,
        }
    }

    /// Start (midnight) of the period containing `at`.
    pub fn start_of(&self, at: NaiveDateTime) -> NaiveDateTime {
        let date = at.date();
        let start = match self.unit {
            PeriodUnit::Day => date,
            PeriodUnit::Week => {
                let diff = (date.weekday().num_days_from_monday() + 7
                    - self.week_start.num_days_from_monday())
                    % 7;
                date - Duration::days(i64::from(diff))
            }
            PeriodUnit::Month => date.with_day(1).unwrap_or(date),
        };
        start.and_hms_opt(0, 0, 0).unwrap_or(at)
    }

    /// Start of the period immediately preceding the one starting at `start`.
    pub fn previous_start(&self, start: NaiveDateTime) -> NaiveDateTime {
        match self.unit {
            PeriodUnit::Day => start - Duration::days(1),
            PeriodUnit::Week => start - Duration::days(7),
            PeriodUnit::Month => start
                .checked_sub_months(Months::new(1))
                .unwrap_or(start - Duration::days(30)),
        }
    }
}

/// Closed interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Window {
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Source of "now" for window computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// Local wall-clock time, re-read on every evaluation
    System,
    Fixed(NaiveDateTime),
}

impl Clock {
    pub fn now(&self) -> NaiveDateTime {
        match self {
            Clock::System => Local::now().naive_local(),
            Clock::Fixed(at) => *at,
        }
    }
}

/// Outcome of testing one raw timestamp against the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    OutOfWindow,
    /// Could not be parsed; excluded from every period filter
    Unparseable,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Decides whether a row's timestamp falls in the selected window.
///
/// `CurrentPeriod` runs from the start of the current period up to now, so the
/// window grows while a traversal runs. `PreviousPeriod` is the full preceding
/// period and stays fixed until the period rolls over.
#[derive(Debug, Clone, Copy)]
pub struct DateRangeFilter {
    mode: FilterMode,
    period: Period,
    clock: Clock,
}

impl DateRangeFilter {
    pub fn new(mode: FilterMode, period: Period, clock: Clock) -> Self {
        Self { mode, period, clock }
    }

    pub fn all() -> Self {
        Self::new(FilterMode::All, Period::default(), Clock::System)
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn with_mode(self, mode: FilterMode) -> Self {
        Self { mode, ..self }
    }

    /// Current window, `None` for `All`.
    pub fn window(&self) -> Option<Window> {
        let now = self.clock.now();
        let current_start = self.period.start_of(now);
        match self.mode {
            FilterMode::All => None,
            FilterMode::CurrentPeriod => Some(Window {
                start: current_start,
                end: now,
            }),
            FilterMode::PreviousPeriod => Some(Window {
                start: self.period.previous_start(current_start),
                end: current_start - Duration::milliseconds(1),
            }),
        }
    }

    pub fn evaluate(&self, raw: &str) -> Verdict {
        let Some(window) = self.window() else {
            return Verdict::Accepted;
        };
        match parse_timestamp(raw) {
            Some(at) if window.contains(at) => Verdict::Accepted,
            Some(_) => Verdict::OutOfWindow,
            None => Verdict::Unparseable,
        }
    }

    pub fn accepts(&self, raw: &str) -> bool {
        self.evaluate(raw).is_accepted()
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
    "%b %d, %Y %I:%M %p",
    "%b %d, %Y %H:%M",
    "%B %d, %Y %I:%M %p",
    "%B %d, %Y %H:%M",
    "%d %b %Y %I:%M %p",
    "%d %b %Y %H:%M",
    "%d %B %Y %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%B %d %Y",
    "%d %b %Y",
    "%d %B %Y",
];

fn ordinal_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d{1,2})(st|nd|rd|th)").expect("ordinal suffix regex compiles")
    })
}

/// Best-effort timestamp parse: strict formats first, then again with ordinal
/// suffixes stripped ("1st" -> "1").
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    parse_strict(s).or_else(|| {
        let cleaned = ordinal_suffix().replace_all(s, "$1");
        parse_strict(&cleaned)
    })
}

fn parse_strict(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
